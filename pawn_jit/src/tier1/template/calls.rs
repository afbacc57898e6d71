//! Bytecode calls and native calls.

use pawn_core::{Cell, ErrorCode, MAX_RETURN_STACK};

use super::{field, TemplateContext};
use crate::backend::x64::{AluOp, CodeSink, Condition, Gpr, MemOperand, Scale};
use crate::tier1::context::offsets;
use crate::tier1::{ALT, CTX, PRI, SAVED_ALT_SLOT, STK, TMP, TMP2};

/// `CALL target`
///
/// Records the call site on the return stack, then calls through the
/// site's slot. The slot starts out pointing at a thunk that compiles the
/// target and patches the slot, so later calls go straight to the callee.
/// PRI comes back from the callee; ALT survives the call.
pub fn emit_call<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, target: u32) {
    let slot = ctx.take_call_slot(target);

    ctx.asm.mov_rm(TMP, field(offsets::RP));
    ctx.asm.alu_ri(AluOp::Cmp, TMP, MAX_RETURN_STACK as i32);
    ctx.check(Condition::AboveEqual, ErrorCode::StackLow);
    ctx.asm.mov_rm64(TMP2, field(offsets::RSTK));
    ctx.asm
        .mov_mi(MemOperand::indexed(TMP2, TMP, Scale::S4, 0), ctx.cip as i32);
    ctx.asm.alu_ri(AluOp::Add, TMP, 1);
    ctx.asm.mov_mr(field(offsets::RP), TMP);

    let saved_alt = MemOperand::base_disp(Gpr::Rsp, SAVED_ALT_SLOT);
    ctx.asm.mov_mr(saved_alt, ALT);
    ctx.sync_out();
    ctx.asm.mov_rr64(Gpr::Rdi, CTX);
    ctx.asm.mov_ri64(Gpr::Rax, slot as u64);
    ctx.asm.call_m(MemOperand::base(Gpr::Rax));
    // On failure the return stack keeps the call site for the backtrace.
    ctx.propagate_status();
    ctx.asm.alu_mi(AluOp::Sub, field(offsets::RP), 1);

    ctx.asm.mov_rm(PRI, field(offsets::PRI));
    ctx.asm.mov_rm(STK, field(offsets::SP));
    ctx.asm.mov_rm(ALT, saved_alt);
}

/// `SYSREQ.C index` / `SYSREQ.N index argc`
///
/// The `.N` form pushes the argument count itself and pops the whole
/// argument block after the call.
pub fn emit_sysreq<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, index: Cell, argc: Option<Cell>) {
    let helper = ctx.helpers.invoke_native as usize;
    match argc {
        None => ctx.call_helper(helper, &[index]),
        Some(argc) => {
            ctx.check_stack_space(4);
            ctx.push_imm(argc);
            ctx.call_helper(helper, &[index]);
            let cells = argc.wrapping_add(1);
            ctx.asm.alu_ri(AluOp::Add, STK, cells.wrapping_mul(4));
        }
    }
}
