//! Integer arithmetic, shifts and comparisons.

use pawn_core::{Cell, ErrorCode, Opcode};

use super::{frame_addr, guest, TemplateContext};
use crate::backend::x64::{AluOp, CodeSink, Condition, Gpr, ShiftOp, UnaryOp};
use crate::tier1::{ALT, PRI, TMP};

/// `SUB.ALT`: `pri = alt - pri`
pub fn emit_sub_alt<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.asm.unary(UnaryOp::Neg, PRI);
    ctx.asm.alu_rr(AluOp::Add, PRI, ALT);
}

/// Move dividend into PRI and divisor into TMP.
fn load_division_operands<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, swapped: bool) {
    if swapped {
        ctx.asm.mov_rr(TMP, PRI);
        ctx.asm.mov_rr(PRI, ALT);
    } else {
        ctx.asm.mov_rr(TMP, ALT);
    }
    ctx.asm.test_rr(TMP, TMP);
    ctx.check(Condition::Equal, ErrorCode::DivideByZero);
}

/// `SDIV` / `SDIV.ALT`: truncating signed division, remainder into ALT.
pub fn emit_sdiv<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, swapped: bool) {
    load_division_operands(ctx, swapped);
    let ok = ctx.asm.create_label();
    ctx.asm.alu_ri(AluOp::Cmp, TMP, -1);
    ctx.asm.jcc(Condition::NotEqual, ok);
    ctx.asm.alu_ri(AluOp::Cmp, PRI, i32::MIN);
    ctx.check(Condition::Equal, ErrorCode::IntegerOverflow);
    ctx.asm.bind_label(ok);
    ctx.asm.cdq();
    ctx.asm.unary(UnaryOp::Idiv, TMP);
}

/// `UDIV` / `UDIV.ALT`
pub fn emit_udiv<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, swapped: bool) {
    load_division_operands(ctx, swapped);
    ctx.asm.alu_rr(AluOp::Xor, ALT, ALT);
    ctx.asm.unary(UnaryOp::Div, TMP);
}

/// `NOT`: `pri = (pri == 0)`
pub fn emit_not<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.asm.test_rr(PRI, PRI);
    materialize(ctx, Condition::Equal);
}

/// Set PRI to 1 when `cond` holds for the preceding comparison, else 0.
fn materialize<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, cond: Condition) {
    ctx.asm.setcc(cond, TMP);
    ctx.asm.movzx_rr8(PRI, TMP);
}

/// The shift family. Register shift counts use the low five bits.
pub fn emit_shift<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, op: Opcode, amount: Cell) {
    let by_register = |ctx: &mut TemplateContext<'_, S>, shift: ShiftOp| {
        ctx.asm.mov_rr(TMP, ALT);
        ctx.asm.shift_cl(shift, PRI);
    };
    let count = (amount & 31) as u8;
    match op {
        Opcode::Shl => by_register(ctx, ShiftOp::Shl),
        Opcode::Shr => by_register(ctx, ShiftOp::Shr),
        Opcode::Sshr => by_register(ctx, ShiftOp::Sar),
        Opcode::ShlCPri => ctx.asm.shift_ri(ShiftOp::Shl, PRI, count),
        Opcode::ShlCAlt => ctx.asm.shift_ri(ShiftOp::Shl, ALT, count),
        Opcode::ShrCPri => ctx.asm.shift_ri(ShiftOp::Shr, PRI, count),
        Opcode::ShrCAlt => ctx.asm.shift_ri(ShiftOp::Shr, ALT, count),
        _ => ctx.raise(ErrorCode::InvalidInstruction),
    }
}

/// `EQ` .. `SGEQ`: compare PRI with ALT into PRI.
pub fn emit_compare<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, op: Opcode) {
    let cond = match op {
        Opcode::Eq => Condition::Equal,
        Opcode::Neq => Condition::NotEqual,
        Opcode::Less => Condition::Below,
        Opcode::Leq => Condition::BelowEqual,
        Opcode::Grtr => Condition::Above,
        Opcode::Geq => Condition::AboveEqual,
        Opcode::Sless => Condition::Less,
        Opcode::Sleq => Condition::LessEqual,
        Opcode::Sgrtr => Condition::Greater,
        Opcode::Sgeq => Condition::GreaterEqual,
        _ => {
            ctx.raise(ErrorCode::InvalidInstruction);
            return;
        }
    };
    ctx.asm.alu_rr(AluOp::Cmp, PRI, ALT);
    materialize(ctx, cond);
}

/// `EQ.C.pri` / `EQ.C.alt`
pub fn emit_compare_const<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, reg: Gpr, value: Cell) {
    ctx.asm.alu_ri(AluOp::Cmp, reg, value);
    materialize(ctx, Condition::Equal);
}

/// `INC addr` / `DEC addr`
pub fn emit_step_global<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, op: AluOp, addr: Cell) {
    ctx.asm.mov_ri(TMP, addr);
    step_at(ctx, op, TMP);
}

/// `INC.S offs` / `DEC.S offs`
pub fn emit_step_frame<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, op: AluOp, offset: Cell) {
    ctx.asm.lea(TMP, frame_addr(offset));
    step_at(ctx, op, TMP);
}

/// `INC.I` / `DEC.I`: step the cell at `[pri]`.
pub fn emit_step_indirect<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, op: AluOp) {
    step_at(ctx, op, PRI);
}

fn step_at<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, op: AluOp, addr: Gpr) {
    ctx.check_address(addr);
    ctx.asm.alu_mi(op, guest(addr), 1);
}
