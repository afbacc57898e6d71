//! Stack, frame and heap templates.

use pawn_core::{Cell, ErrorCode, PushKind, STACK_MARGIN};

use super::{field, frame_addr, guest, stack_slot, TemplateContext};
use crate::backend::x64::{AluOp, CodeSink, Condition, Gpr, MemOperand, Scale};
use crate::tier1::context::offsets;
use crate::tier1::{ALT, FRM, STK, TMP, TMP2};

/// `PUSH.pri` / `PUSH.alt`
pub fn emit_push_reg<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, reg: Gpr) {
    ctx.check_stack_space(4);
    ctx.push_reg(reg);
}

/// The `PUSH.x` and `PUSHn.x` families.
pub fn emit_push_n<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, kind: PushKind, values: &[Cell]) {
    ctx.check_stack_space(4 * values.len() as i32);
    for &value in values {
        match kind {
            PushKind::Const => ctx.push_imm(value),
            PushKind::Address => {
                ctx.asm.lea(TMP, frame_addr(value));
                ctx.push_reg(TMP);
            }
            PushKind::Global => {
                ctx.asm.mov_ri(TMP, value);
                ctx.check_address(TMP);
                ctx.asm.mov_rm(TMP, guest(TMP));
                ctx.push_reg(TMP);
            }
            PushKind::Frame => {
                ctx.asm.lea(TMP, frame_addr(value));
                ctx.check_address(TMP);
                ctx.asm.mov_rm(TMP, guest(TMP));
                ctx.push_reg(TMP);
            }
        }
    }
}

/// `POP.pri` / `POP.alt`
pub fn emit_pop<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, reg: Gpr) {
    ctx.check_stack_cells(1);
    ctx.asm.mov_rm(reg, stack_slot(0));
    ctx.asm.alu_ri(AluOp::Add, STK, 4);
}

/// `SWAP.pri` / `SWAP.alt`: exchange the register with the stack top.
pub fn emit_swap<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, reg: Gpr) {
    ctx.check_stack_cells(1);
    ctx.asm.mov_rm(TMP, stack_slot(0));
    ctx.asm.mov_mr(stack_slot(0), reg);
    ctx.asm.mov_rr(reg, TMP);
}

/// `STACK n`
pub fn emit_stack<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, amount: Cell) {
    if amount % 4 != 0 {
        ctx.raise(ErrorCode::InvalidInstruction);
        return;
    }
    // 64-bit arithmetic so that wrap-around shows up as out of range.
    ctx.asm.lea64(TMP, MemOperand::base_disp(STK, amount));
    if amount > 0 {
        ctx.asm.mov_rm(TMP2, field(offsets::MEM_SIZE));
        ctx.asm.alu_rr64(AluOp::Cmp, TMP, TMP2);
        ctx.check(Condition::AboveEqual, ErrorCode::StackMin);
    } else {
        ctx.asm.mov_rm(TMP2, field(offsets::HP));
        ctx.asm.alu_ri64(AluOp::Add, TMP2, STACK_MARGIN as i32);
        ctx.asm.alu_rr64(AluOp::Cmp, TMP, TMP2);
        ctx.check(Condition::Less, ErrorCode::StackLow);
    }
    ctx.asm.mov_rr(STK, TMP);
}

/// `STACKADJUST n`: `sp = frm + n` for non-positive, aligned `n`.
pub fn emit_stack_adjust<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, amount: Cell) {
    if amount % 4 != 0 || amount > 0 {
        ctx.raise(ErrorCode::InvalidInstruction);
        return;
    }
    ctx.asm.lea(TMP, frame_addr(amount));
    ctx.asm.alu_rm(AluOp::Cmp, TMP, field(offsets::MEM_SIZE));
    ctx.check(Condition::AboveEqual, ErrorCode::StackMin);
    ctx.asm.mov_rm(TMP2, field(offsets::HP));
    ctx.asm.alu_ri(AluOp::Add, TMP2, STACK_MARGIN as i32);
    ctx.asm.alu_rr(AluOp::Cmp, TMP, TMP2);
    ctx.check(Condition::Below, ErrorCode::StackLow);
    ctx.asm.mov_rr(STK, TMP);
}

/// `HEAP n`: `alt = hp; hp += n`
pub fn emit_heap<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, amount: Cell) {
    ctx.asm.mov_rm(ALT, field(offsets::HP));
    ctx.asm.mov_rr(TMP, ALT);
    ctx.asm.alu_ri64(AluOp::Add, TMP, amount);
    if amount > 0 {
        ctx.asm.mov_rr(TMP2, STK);
        ctx.asm.alu_rr64(AluOp::Cmp, TMP, TMP2);
        ctx.check(Condition::Above, ErrorCode::HeapLow);
    } else {
        ctx.asm.mov_rm(TMP2, field(offsets::DATA_SIZE));
        ctx.asm.alu_rr64(AluOp::Cmp, TMP, TMP2);
        ctx.check(Condition::Less, ErrorCode::HeapMin);
    }
    ctx.asm.mov_mr(field(offsets::HP), TMP);
}

/// `PROC`: push the caller's frame and a zero return slot, open a frame.
pub fn emit_proc<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.check_stack_space(8);
    ctx.push_reg(FRM);
    ctx.push_imm(0);
    ctx.asm.mov_rr(FRM, STK);
}

/// `RETN`: pop the frame record and the argument block, then return.
pub fn emit_retn<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.check_stack_cells(3);
    ctx.asm.mov_rm(FRM, stack_slot(4));
    ctx.asm.mov_rm(TMP, stack_slot(8));
    ctx.asm.lea64(TMP, MemOperand::indexed(STK, TMP, Scale::S4, 12));
    ctx.asm.mov_rm(TMP2, field(offsets::MEM_SIZE));
    ctx.asm.alu_rr64(AluOp::Cmp, TMP, TMP2);
    ctx.check(Condition::Above, ErrorCode::StackMin);
    ctx.asm.mov_rr(STK, TMP);
    let ret = ctx.return_path();
    ctx.asm.jmp(ret);
}

/// `TRACKER.PUSH.C n`
pub fn emit_tracker_push<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, cells: Cell) {
    let helper = ctx.helpers.tracker_push as usize;
    ctx.call_helper(helper, &[cells.wrapping_mul(4)]);
}

/// `TRACKER.POP.SETHEAP`
pub fn emit_tracker_pop<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    let helper = ctx.helpers.tracker_pop as usize;
    ctx.call_helper(helper, &[]);
}

/// `GENARRAY dims` / `GENARRAY.Z dims`
pub fn emit_genarray<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, dims: Cell, autozero: bool) {
    let helper = ctx.helpers.generate_array as usize;
    ctx.call_helper(helper, &[dims, autozero as i32]);
}
