//! Opcode templates.
//!
//! Templates are grouped by opcode family:
//! - `memory`: loads, stores, address arithmetic, block moves
//! - `stack`: pushes, pops, frames, heap and tracker
//! - `arith`: integer arithmetic, shifts, comparisons
//! - `control`: branches, switches, halts
//! - `calls`: bytecode calls and native calls
//! - `float`: float opcodes
//!
//! Every template emits against a [`TemplateContext`], which owns the
//! assembler and the shared exit paths of the function being compiled.

pub mod arith;
pub mod calls;
pub mod control;
pub mod float;
pub mod memory;
pub mod stack;

use std::sync::atomic::AtomicUsize;

use pawn_core::{ErrorCode, Opcode};
use smallvec::SmallVec;

use super::context::{offsets, CheckMode, CompileOptions, RuntimeHelpers};
use super::decode::{FunctionBody, Instruction};
use super::{ALT, CTX, ENTRY_FRM_SLOT, FRM, MEM, PRI, SPILL_AREA, STK, TMP};
use crate::backend::x64::{
    AluOp, Assembler, CodeSink, Condition, Gpr, Label, LabelLayout, MemOperand, Scale, ShiftOp,
    SseOp, UnaryOp,
};

// =============================================================================
// Pending Records
// =============================================================================

/// A backward branch whose displacement can be redirected.
#[derive(Debug, Clone, Copy)]
pub struct PendingEdge {
    /// Offset of the rel32 field.
    pub field: u32,
    /// Bytecode offset of the branch.
    pub cip: u32,
    pub target: Label,
    /// The timeout stub for this edge.
    pub stub: Label,
}

/// A call site and the thunk its slot initially points at.
#[derive(Debug, Clone, Copy)]
pub struct PendingCall {
    pub slot: usize,
    pub target: u32,
    pub thunk: Label,
}

#[derive(Debug, Clone, Copy)]
struct CheckStub {
    label: Label,
    cip: u32,
    code: ErrorCode,
}

/// What one emission pass produced besides code.
#[derive(Debug, Default)]
pub struct Emitted {
    pub loop_edges: Vec<PendingEdge>,
    pub calls: Vec<PendingCall>,
}

// =============================================================================
// Operands
// =============================================================================

/// A context field.
#[inline]
pub fn field(offset: i32) -> MemOperand {
    MemOperand::base_disp(CTX, offset)
}

/// Guest memory at the offset held in `reg`.
#[inline]
pub fn guest(reg: Gpr) -> MemOperand {
    MemOperand::indexed(MEM, reg, Scale::S1, 0)
}

/// The stack cell `disp` bytes above the stack pointer.
#[inline]
pub fn stack_slot(disp: i32) -> MemOperand {
    MemOperand::indexed(MEM, STK, Scale::S1, disp)
}

/// `frm + offset`, for `lea`.
#[inline]
pub fn frame_addr(offset: i32) -> MemOperand {
    MemOperand::base_disp(FRM, offset)
}

// =============================================================================
// Template Context
// =============================================================================

/// State for emitting one function.
pub struct TemplateContext<'a, S: CodeSink> {
    pub asm: Assembler<S>,
    pub body: &'a FunctionBody,
    pub helpers: &'a RuntimeHelpers,
    pub options: CompileOptions,
    slots: &'a [AtomicUsize],
    /// Bytecode offset of the instruction being emitted.
    pub cip: u32,
    error_exit: Label,
    return_path: Label,
    leave: Label,
    stubs: Vec<CheckStub>,
    trampolines: SmallVec<[(ErrorCode, Label); 8]>,
    emitted: Emitted,
}

impl<'a, S: CodeSink> TemplateContext<'a, S> {
    /// Set up emission; labels `0..body.cells()` are the bytecode cells.
    pub fn new(
        sink: S,
        layout: LabelLayout,
        body: &'a FunctionBody,
        helpers: &'a RuntimeHelpers,
        options: CompileOptions,
        slots: &'a [AtomicUsize],
    ) -> Self {
        let mut asm = Assembler::with_layout(sink, layout);
        for _ in 0..body.cells() {
            asm.create_label();
        }
        let error_exit = asm.create_label();
        let return_path = asm.create_label();
        let leave = asm.create_label();
        TemplateContext {
            asm,
            body,
            helpers,
            options,
            slots,
            cip: body.start,
            error_exit,
            return_path,
            leave,
            stubs: Vec::new(),
            trampolines: SmallVec::new(),
            emitted: Emitted::default(),
        }
    }

    /// Label of the bytecode cell at `cip`.
    #[inline]
    pub fn label_for(&self, cip: u32) -> Label {
        let index = self.body.cell_index(cip).unwrap_or(0);
        Label::new(index as u32)
    }

    /// Label of the shared return path.
    #[inline]
    pub fn return_path(&self) -> Label {
        self.return_path
    }

    /// Emit the whole function and return the sink, the label layout,
    /// whether it matched the previous pass, and the pending records.
    pub fn emit_function(mut self) -> (S, LabelLayout, bool, Emitted) {
        self.emit_prologue();
        let body = self.body;
        for insn in &body.instructions {
            self.cip = insn.cip;
            let label = self.label_for(insn.cip);
            self.asm.bind_label(label);
            emit_instruction(&mut self, insn);
        }
        // Running off the end of the function.
        self.cip = body.end;
        self.raise(ErrorCode::InvalidInstruction);

        self.emit_loop_stubs();
        self.emit_call_thunks();
        self.emit_check_stubs();
        self.emit_exits();

        let matched = self.asm.layout_matches();
        let (sink, layout) = self.asm.finish();
        (sink, layout, matched, self.emitted)
    }

    // =========================================================================
    // Prologue / Exits
    // =========================================================================

    fn emit_prologue(&mut self) {
        for reg in Gpr::CALLEE_SAVED {
            self.asm.push(reg);
        }
        self.asm.alu_ri64(AluOp::Sub, Gpr::Rsp, SPILL_AREA);
        self.asm.mov_rr64(CTX, Gpr::Rdi);
        self.asm.mov_rm64(MEM, field(offsets::MEMORY));
        self.asm.mov_rm(STK, field(offsets::SP));
        self.asm.mov_rm(FRM, field(offsets::FRM));
        self.asm.mov_mr(MemOperand::base_disp(Gpr::Rsp, ENTRY_FRM_SLOT), FRM);
        // Callees start with the caller's registers, top-level entries with zeros.
        self.asm.mov_rm(PRI, field(offsets::PRI));
        self.asm.mov_rm(ALT, field(offsets::ALT));
    }

    fn emit_exits(&mut self) {
        // Error: eax holds the code. Report the cursors as they were when
        // the fault was raised, with the caller's frame restored.
        self.asm.bind_label(self.error_exit);
        self.asm.mov_mr(field(offsets::SP), STK);
        self.asm.mov_rm(TMP, MemOperand::base_disp(Gpr::Rsp, ENTRY_FRM_SLOT));
        self.asm.mov_mr(field(offsets::FRM), TMP);
        self.asm.jmp(self.leave);

        self.asm.bind_label(self.return_path);
        self.sync_out_registers();
        self.asm.alu_rr(AluOp::Xor, Gpr::Rax, Gpr::Rax);

        self.asm.bind_label(self.leave);
        self.asm.alu_ri64(AluOp::Add, Gpr::Rsp, SPILL_AREA);
        for reg in Gpr::CALLEE_SAVED.iter().rev() {
            self.asm.pop(*reg);
        }
        self.asm.ret();
    }

    // =========================================================================
    // Errors and Checks
    // =========================================================================

    /// Leave the function with `code`.
    pub fn raise(&mut self, code: ErrorCode) {
        self.asm.mov_mi(field(offsets::CIP), self.cip as i32);
        self.asm.mov_ri(Gpr::Rax, code.as_i32());
        self.asm.jmp(self.error_exit);
    }

    /// Fail with `code` when `cond` holds for the preceding comparison.
    pub fn check(&mut self, cond: Condition, code: ErrorCode) {
        match self.options.check_mode {
            CheckMode::Inline => {
                let skip = self.asm.create_label();
                self.asm.jcc(cond.invert(), skip);
                self.raise(code);
                self.asm.bind_label(skip);
            }
            CheckMode::OutOfLine => {
                let label = self.asm.create_label();
                self.asm.jcc(cond, label);
                self.stubs.push(CheckStub {
                    label,
                    cip: self.cip,
                    code,
                });
            }
        }
    }

    /// Fault unless `reg` holds a readable guest address.
    ///
    /// An address is valid below `mem_size` and outside the unallocated gap
    /// `[hp, sp)`.
    pub fn check_address(&mut self, reg: Gpr) {
        self.asm.alu_rm(AluOp::Cmp, reg, field(offsets::MEM_SIZE));
        self.check(Condition::AboveEqual, ErrorCode::MemAccess);
        let ok = self.asm.create_label();
        self.asm.alu_rm(AluOp::Cmp, reg, field(offsets::HP));
        self.asm.jcc(Condition::Below, ok);
        self.asm.alu_rr(AluOp::Cmp, reg, STK);
        self.check(Condition::Below, ErrorCode::MemAccess);
        self.asm.bind_label(ok);
    }

    /// Fault unless `bytes` more can be pushed without crossing `hp`.
    pub fn check_stack_space(&mut self, bytes: i32) {
        self.asm.mov_rm(TMP, field(offsets::HP));
        self.asm.alu_ri(AluOp::Add, TMP, bytes);
        self.asm.alu_rr(AluOp::Cmp, STK, TMP);
        self.check(Condition::Below, ErrorCode::StackLow);
    }

    /// Fault unless `cells` cells can be read at the stack pointer.
    pub fn check_stack_cells(&mut self, cells: i32) {
        self.asm.lea(TMP, MemOperand::base_disp(STK, cells * 4));
        self.asm.alu_rm(AluOp::Cmp, TMP, field(offsets::MEM_SIZE));
        self.check(Condition::Above, ErrorCode::StackMin);
    }

    fn trampoline(&mut self, code: ErrorCode) -> Label {
        if let Some(&(_, label)) = self.trampolines.iter().find(|(c, _)| *c == code) {
            return label;
        }
        let label = self.asm.create_label();
        self.trampolines.push((code, label));
        label
    }

    fn emit_check_stubs(&mut self) {
        let stubs = std::mem::take(&mut self.stubs);
        for stub in &stubs {
            self.asm.bind_label(stub.label);
            self.asm.mov_mi(field(offsets::CIP), stub.cip as i32);
            let target = self.trampoline(stub.code);
            self.asm.jmp(target);
        }
        let trampolines = std::mem::take(&mut self.trampolines);
        for (code, label) in trampolines {
            self.asm.bind_label(label);
            self.asm.mov_ri(Gpr::Rax, code.as_i32());
            self.asm.jmp(self.error_exit);
        }
    }

    // =========================================================================
    // Stack Helpers
    // =========================================================================

    /// Push a register; space must already be checked.
    pub fn push_reg(&mut self, reg: Gpr) {
        self.asm.alu_ri(AluOp::Sub, STK, 4);
        self.asm.mov_mr(stack_slot(0), reg);
    }

    /// Push an immediate; space must already be checked.
    pub fn push_imm(&mut self, value: i32) {
        self.asm.alu_ri(AluOp::Sub, STK, 4);
        self.asm.mov_mi(stack_slot(0), value);
    }

    // =========================================================================
    // Helper Calls
    // =========================================================================

    /// Store the live registers and the current cip into the context.
    pub fn sync_out(&mut self) {
        self.asm.mov_mi(field(offsets::CIP), self.cip as i32);
        self.sync_out_registers();
    }

    fn sync_out_registers(&mut self) {
        self.asm.mov_mr(field(offsets::PRI), PRI);
        self.asm.mov_mr(field(offsets::ALT), ALT);
        self.asm.mov_mr(field(offsets::SP), STK);
        self.asm.mov_mr(field(offsets::FRM), FRM);
    }

    /// Reload registers a helper may have changed.
    pub fn sync_in(&mut self) {
        self.asm.mov_rm(PRI, field(offsets::PRI));
        self.asm.mov_rm(ALT, field(offsets::ALT));
        self.asm.mov_rm(STK, field(offsets::SP));
    }

    /// Call a runtime helper with up to two immediate arguments and leave
    /// the function if it reports an error.
    pub fn call_helper(&mut self, helper: usize, args: &[i32]) {
        debug_assert!(args.len() <= 2);
        self.sync_out();
        self.asm.mov_rr64(Gpr::Rdi, CTX);
        for (&arg, reg) in args.iter().zip([Gpr::Rsi, Gpr::Rdx]) {
            self.asm.mov_ri(reg, arg);
        }
        self.asm.mov_ri64(Gpr::Rax, helper as u64);
        self.asm.call_r(Gpr::Rax);
        self.asm.test_rr(Gpr::Rax, Gpr::Rax);
        self.asm.jcc(Condition::NotEqual, self.error_exit);
        self.sync_in();
    }

    /// Jump to the error exit if `eax` is nonzero.
    pub fn propagate_status(&mut self) {
        self.asm.test_rr(Gpr::Rax, Gpr::Rax);
        self.asm.jcc(Condition::NotEqual, self.error_exit);
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// Branch to bytecode `target`, unconditionally or on `cond`.
    ///
    /// Backward branches get a 4-aligned displacement and a timeout stub so
    /// the watchdog can redirect them.
    pub fn branch(&mut self, cond: Option<Condition>, target: u32) {
        let label = self.label_for(target);
        let backward = target <= self.cip;
        if backward {
            self.asm.align_branch_field(if cond.is_some() { 2 } else { 1 });
        }
        let field = match cond {
            Some(cond) => self.asm.jcc(cond, label),
            None => self.asm.jmp(label),
        };
        if backward {
            let stub = self.asm.create_label();
            self.emitted.loop_edges.push(PendingEdge {
                field,
                cip: self.cip,
                target: label,
                stub,
            });
        }
    }

    fn emit_loop_stubs(&mut self) {
        let edges = self.emitted.loop_edges.clone();
        let timeout = self.helpers.timeout as usize;
        for edge in edges {
            self.asm.bind_label(edge.stub);
            self.cip = edge.cip;
            self.call_helper(timeout, &[]);
            self.asm.jmp(edge.target);
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Claim the next call slot for a call to `target`; returns its address.
    pub fn take_call_slot(&mut self, target: u32) -> usize {
        let slot = self.emitted.calls.len();
        let thunk = self.asm.create_label();
        self.emitted.calls.push(PendingCall {
            slot,
            target,
            thunk,
        });
        self.slots
            .get(slot)
            .map_or(0, |s| s as *const AtomicUsize as usize)
    }

    fn emit_call_thunks(&mut self) {
        let calls = self.emitted.calls.clone();
        let compile_call = self.helpers.compile_call as usize;
        for call in calls {
            let slot = self
                .slots
                .get(call.slot)
                .map_or(0, |s| s as *const AtomicUsize as usize);
            self.asm.bind_label(call.thunk);
            self.asm.mov_ri(Gpr::Rsi, call.target as i32);
            self.asm.mov_ri64(Gpr::Rdx, slot as u64);
            self.asm.mov_ri64(Gpr::Rax, compile_call as u64);
            self.asm.jmp_r(Gpr::Rax);
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Emit the template for one instruction.
pub fn emit_instruction<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, insn: &Instruction) {
    use Opcode::*;

    if let Some((kind, count)) = insn.op.push_shape() {
        stack::emit_push_n(ctx, kind, &insn.operands[..count]);
        return;
    }

    let a = insn.operand(0);
    let b = insn.operand(1);
    match insn.op {
        // Memory
        LoadPri => memory::emit_load_global(ctx, PRI, a),
        LoadAlt => memory::emit_load_global(ctx, ALT, a),
        LoadSPri => memory::emit_load_frame(ctx, PRI, a),
        LoadSAlt => memory::emit_load_frame(ctx, ALT, a),
        LrefPri => memory::emit_lref_global(ctx, PRI, a),
        LrefAlt => memory::emit_lref_global(ctx, ALT, a),
        LrefSPri => memory::emit_lref_frame(ctx, PRI, a),
        LrefSAlt => memory::emit_lref_frame(ctx, ALT, a),
        LoadI => memory::emit_load_i(ctx),
        LodbI => memory::emit_lodb_i(ctx, a),
        ConstPri => ctx.asm.mov_ri(PRI, a),
        ConstAlt => ctx.asm.mov_ri(ALT, a),
        AddrPri => ctx.asm.lea(PRI, frame_addr(a)),
        AddrAlt => ctx.asm.lea(ALT, frame_addr(a)),
        StorPri => memory::emit_store_global(ctx, PRI, a),
        StorAlt => memory::emit_store_global(ctx, ALT, a),
        StorSPri => memory::emit_store_frame(ctx, PRI, a),
        StorSAlt => memory::emit_store_frame(ctx, ALT, a),
        SrefPri => memory::emit_sref_global(ctx, PRI, a),
        SrefAlt => memory::emit_sref_global(ctx, ALT, a),
        SrefSPri => memory::emit_sref_frame(ctx, PRI, a),
        SrefSAlt => memory::emit_sref_frame(ctx, ALT, a),
        StorI => memory::emit_stor_i(ctx),
        StrbI => memory::emit_strb_i(ctx, a),
        Lidx => memory::emit_lidx(ctx, Option::None),
        LidxB => memory::emit_lidx(ctx, Some(a)),
        Idxaddr => memory::emit_idxaddr(ctx, Option::None),
        IdxaddrB => memory::emit_idxaddr(ctx, Some(a)),
        LoadBoth => memory::emit_load_both(ctx, a, b, false),
        LoadSBoth => memory::emit_load_both(ctx, a, b, true),
        Const => memory::emit_const_store(ctx, a, b, false),
        ConstS => memory::emit_const_store(ctx, a, b, true),
        Zero => memory::emit_zero(ctx, a, false),
        ZeroS => memory::emit_zero(ctx, a, true),
        Movs => {
            let helper = ctx.helpers.copy_memory as usize;
            ctx.call_helper(helper, &[a]);
        }
        Fill => {
            let helper = ctx.helpers.fill_memory as usize;
            ctx.call_helper(helper, &[a]);
        }

        // Registers
        MovePri => ctx.asm.mov_rr(PRI, ALT),
        MoveAlt => ctx.asm.mov_rr(ALT, PRI),
        Xchg => ctx.asm.xchg_rr(PRI, ALT),
        ZeroPri => ctx.asm.alu_rr(AluOp::Xor, PRI, PRI),
        ZeroAlt => ctx.asm.alu_rr(AluOp::Xor, ALT, ALT),
        StradjustPri => {
            ctx.asm.alu_ri(AluOp::Add, PRI, 4);
            ctx.asm.shift_ri(ShiftOp::Sar, PRI, 2);
        }

        // Stack, frames and heap
        PushPri => stack::emit_push_reg(ctx, PRI),
        PushAlt => stack::emit_push_reg(ctx, ALT),
        PopPri => stack::emit_pop(ctx, PRI),
        PopAlt => stack::emit_pop(ctx, ALT),
        SwapPri => stack::emit_swap(ctx, PRI),
        SwapAlt => stack::emit_swap(ctx, ALT),
        Stack => stack::emit_stack(ctx, a),
        Stackadjust => stack::emit_stack_adjust(ctx, a),
        Heap => stack::emit_heap(ctx, a),
        Proc => stack::emit_proc(ctx),
        Retn => stack::emit_retn(ctx),
        TrackerPushC => stack::emit_tracker_push(ctx, a),
        TrackerPopSetheap => stack::emit_tracker_pop(ctx),
        Genarray => stack::emit_genarray(ctx, a, false),
        GenarrayZ => stack::emit_genarray(ctx, a, true),

        // Arithmetic
        Add => ctx.asm.alu_rr(AluOp::Add, PRI, ALT),
        Sub => ctx.asm.alu_rr(AluOp::Sub, PRI, ALT),
        SubAlt => arith::emit_sub_alt(ctx),
        And => ctx.asm.alu_rr(AluOp::And, PRI, ALT),
        Or => ctx.asm.alu_rr(AluOp::Or, PRI, ALT),
        Xor => ctx.asm.alu_rr(AluOp::Xor, PRI, ALT),
        Smul | Umul => ctx.asm.imul_rr(PRI, ALT),
        Sdiv => arith::emit_sdiv(ctx, false),
        SdivAlt => arith::emit_sdiv(ctx, true),
        Udiv => arith::emit_udiv(ctx, false),
        UdivAlt => arith::emit_udiv(ctx, true),
        Not => arith::emit_not(ctx),
        Neg => ctx.asm.unary(UnaryOp::Neg, PRI),
        Invert => ctx.asm.unary(UnaryOp::Not, PRI),
        AddC => ctx.asm.alu_ri(AluOp::Add, PRI, a),
        SmulC => ctx.asm.imul_rri(PRI, PRI, a),
        SignPri => ctx.asm.movsx_rr8(PRI, PRI),
        SignAlt => ctx.asm.movsx_rr8(ALT, ALT),
        Shl | Shr | Sshr | ShlCPri | ShlCAlt | ShrCPri | ShrCAlt => {
            arith::emit_shift(ctx, insn.op, a)
        }
        Eq | Neq | Less | Leq | Grtr | Geq | Sless | Sleq | Sgrtr | Sgeq => {
            arith::emit_compare(ctx, insn.op)
        }
        EqCPri => arith::emit_compare_const(ctx, PRI, a),
        EqCAlt => arith::emit_compare_const(ctx, ALT, a),
        IncPri => ctx.asm.alu_ri(AluOp::Add, PRI, 1),
        IncAlt => ctx.asm.alu_ri(AluOp::Add, ALT, 1),
        DecPri => ctx.asm.alu_ri(AluOp::Sub, PRI, 1),
        DecAlt => ctx.asm.alu_ri(AluOp::Sub, ALT, 1),
        Inc => arith::emit_step_global(ctx, AluOp::Add, a),
        Dec => arith::emit_step_global(ctx, AluOp::Sub, a),
        IncS => arith::emit_step_frame(ctx, AluOp::Add, a),
        DecS => arith::emit_step_frame(ctx, AluOp::Sub, a),
        IncI => arith::emit_step_indirect(ctx, AluOp::Add),
        DecI => arith::emit_step_indirect(ctx, AluOp::Sub),

        // Control
        Jump => ctx.branch(Option::None, a as u32),
        Jzer | Jnz | Jeq | Jneq | Jless | Jleq | Jgrtr | Jgeq | Jsless | Jsleq | Jsgrtr
        | Jsgeq => control::emit_conditional_jump(ctx, insn.op, a as u32),
        Switch => control::emit_switch(ctx, a as u32),
        Casetbl => ctx.raise(ErrorCode::InvalidInstruction),
        Halt => ctx.raise(ErrorCode::Aborted),
        Bounds => control::emit_bounds(ctx, a),
        Break => control::emit_break(ctx),
        Nop => {}

        // Calls
        Call => calls::emit_call(ctx, a as u32),
        SysreqC => calls::emit_sysreq(ctx, a, Option::None),
        SysreqN => calls::emit_sysreq(ctx, a, Some(b)),

        // Floats
        Fabs => float::emit_fabs(ctx),
        Float => float::emit_float(ctx),
        FloatAdd => float::emit_binary(ctx, SseOp::Add),
        FloatSub => float::emit_binary(ctx, SseOp::Sub),
        FloatMul => float::emit_binary(ctx, SseOp::Mul),
        FloatDiv => float::emit_binary(ctx, SseOp::Div),
        FloatCmp => float::emit_compare(ctx),
        RndToNearest => float::emit_round(ctx, pawn_core::RoundingMode::Nearest),
        RndToFloor => float::emit_round(ctx, pawn_core::RoundingMode::Floor),
        RndToCeil => float::emit_round(ctx, pawn_core::RoundingMode::Ceil),
        RndToZero => float::emit_round(ctx, pawn_core::RoundingMode::Zero),

        // Rejected while decoding.
        _ => ctx.raise(ErrorCode::InvalidInstruction),
    }
}
