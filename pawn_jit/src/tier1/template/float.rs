//! Float opcodes.
//!
//! Operands come from the stack and are popped; the result lands in PRI.

use pawn_core::RoundingMode;

use super::{stack_slot, TemplateContext};
use crate::backend::x64::{AluOp, CodeSink, Condition, SseOp, Xmm};
use crate::tier1::{PRI, STK, TMP};

/// `FABS`
pub fn emit_fabs<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.check_stack_cells(1);
    ctx.asm.mov_rm(PRI, stack_slot(0));
    ctx.asm.alu_ri(AluOp::And, PRI, 0x7FFF_FFFF);
    ctx.asm.alu_ri(AluOp::Add, STK, 4);
}

/// `FLOAT`: integer to float.
pub fn emit_float<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.check_stack_cells(1);
    ctx.asm.mov_rm(TMP, stack_slot(0));
    ctx.asm.cvtsi2ss(Xmm::Xmm0, TMP);
    ctx.asm.movd_rx(PRI, Xmm::Xmm0);
    ctx.asm.alu_ri(AluOp::Add, STK, 4);
}

/// Load the two float operands into `xmm0` and `xmm1` and pop them.
fn pop_pair<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.check_stack_cells(2);
    ctx.asm.movd_xm(Xmm::Xmm0, stack_slot(0));
    ctx.asm.movd_xm(Xmm::Xmm1, stack_slot(4));
    ctx.asm.alu_ri(AluOp::Add, STK, 8);
}

/// `FLOATADD`, `FLOATSUB`, `FLOATMUL`, `FLOATDIV`
pub fn emit_binary<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, op: SseOp) {
    pop_pair(ctx);
    ctx.asm.sse_ss(op, Xmm::Xmm0, Xmm::Xmm1);
    ctx.asm.movd_rx(PRI, Xmm::Xmm0);
}

/// `FLOATCMP`: 1, -1 or 0; unordered compares as 0.
pub fn emit_compare<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    pop_pair(ctx);
    let done = ctx.asm.create_label();
    ctx.asm.ucomiss(Xmm::Xmm0, Xmm::Xmm1);
    // mov leaves the flags alone.
    ctx.asm.mov_ri(PRI, 0);
    ctx.asm.jcc(Condition::Parity, done);
    ctx.asm.jcc(Condition::Equal, done);
    ctx.asm.mov_ri(PRI, 1);
    ctx.asm.jcc(Condition::Above, done);
    ctx.asm.mov_ri(PRI, -1);
    ctx.asm.bind_label(done);
}

/// `RND_TO_*`
pub fn emit_round<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, mode: RoundingMode) {
    let helper = ctx.helpers.round_float as usize;
    ctx.call_helper(helper, &[mode as i32]);
}
