//! Loads, stores and address arithmetic.
//!
//! Every access goes through [`TemplateContext::check_address`] first, so a
//! template never touches guest memory outside `[0, mem_size)` or inside the
//! free gap between heap and stack.

use pawn_core::Cell;

use super::{frame_addr, guest, TemplateContext};
use crate::backend::x64::{AluOp, CodeSink, Gpr, MemOperand, Scale, ShiftOp};
use crate::tier1::{ALT, PRI, TMP};

/// Load `[reg]` into `dst` after checking the address.
fn load_checked<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, dst: Gpr, addr: Gpr) {
    ctx.check_address(addr);
    ctx.asm.mov_rm(dst, guest(addr));
}

/// `LOAD.pri/alt addr`
pub fn emit_load_global<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, dst: Gpr, addr: Cell) {
    ctx.asm.mov_ri(TMP, addr);
    load_checked(ctx, dst, TMP);
}

/// `LOAD.S.pri/alt offs`
pub fn emit_load_frame<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, dst: Gpr, offset: Cell) {
    ctx.asm.lea(TMP, frame_addr(offset));
    load_checked(ctx, dst, TMP);
}

/// `LREF.pri/alt addr`: load through a pointer stored at `addr`.
pub fn emit_lref_global<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, dst: Gpr, addr: Cell) {
    ctx.asm.mov_ri(TMP, addr);
    load_checked(ctx, TMP, TMP);
    load_checked(ctx, dst, TMP);
}

/// `LREF.S.pri/alt offs`
pub fn emit_lref_frame<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, dst: Gpr, offset: Cell) {
    ctx.asm.lea(TMP, frame_addr(offset));
    load_checked(ctx, TMP, TMP);
    load_checked(ctx, dst, TMP);
}

/// `LOAD.I`: `pri = [pri]`
pub fn emit_load_i<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    load_checked(ctx, PRI, PRI);
}

/// `LODB.I n`: load 1, 2 or 4 bytes from `[pri]`, zero-extended.
pub fn emit_lodb_i<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, width: Cell) {
    ctx.check_address(PRI);
    match width {
        1 => ctx.asm.movzx_rm8(PRI, guest(PRI)),
        2 => ctx.asm.movzx_rm16(PRI, guest(PRI)),
        _ => ctx.asm.mov_rm(PRI, guest(PRI)),
    }
}

/// `STOR.pri/alt addr`
pub fn emit_store_global<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, src: Gpr, addr: Cell) {
    ctx.asm.mov_ri(TMP, addr);
    ctx.check_address(TMP);
    ctx.asm.mov_mr(guest(TMP), src);
}

/// `STOR.S.pri/alt offs`
pub fn emit_store_frame<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, src: Gpr, offset: Cell) {
    ctx.asm.lea(TMP, frame_addr(offset));
    ctx.check_address(TMP);
    ctx.asm.mov_mr(guest(TMP), src);
}

/// `SREF.pri/alt addr`: store through a pointer stored at `addr`.
pub fn emit_sref_global<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, src: Gpr, addr: Cell) {
    ctx.asm.mov_ri(TMP, addr);
    load_checked(ctx, TMP, TMP);
    ctx.check_address(TMP);
    ctx.asm.mov_mr(guest(TMP), src);
}

/// `SREF.S.pri/alt offs`
pub fn emit_sref_frame<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, src: Gpr, offset: Cell) {
    ctx.asm.lea(TMP, frame_addr(offset));
    load_checked(ctx, TMP, TMP);
    ctx.check_address(TMP);
    ctx.asm.mov_mr(guest(TMP), src);
}

/// `STOR.I`: `[alt] = pri`
pub fn emit_stor_i<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    ctx.check_address(ALT);
    ctx.asm.mov_mr(guest(ALT), PRI);
}

/// `STRB.I n`: store the low 1, 2 or 4 bytes of PRI at `[alt]`.
///
/// Other widths store nothing.
pub fn emit_strb_i<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, width: Cell) {
    ctx.check_address(ALT);
    match width {
        1 => ctx.asm.mov_m8r(guest(ALT), PRI),
        2 => ctx.asm.mov_m16r(guest(ALT), PRI),
        4 => ctx.asm.mov_mr(guest(ALT), PRI),
        _ => {}
    }
}

/// Compute `alt + (pri << shift)` into `dst`.
fn index_address<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, dst: Gpr, shift: Option<Cell>) {
    match shift {
        None => ctx
            .asm
            .lea(dst, MemOperand::indexed(ALT, PRI, Scale::S4, 0)),
        Some(bits) => {
            if dst != PRI {
                ctx.asm.mov_rr(dst, PRI);
            }
            ctx.asm.shift_ri(ShiftOp::Shl, dst, (bits & 31) as u8);
            ctx.asm.alu_rr(AluOp::Add, dst, ALT);
        }
    }
}

/// `LIDX` / `LIDX.B n`: `pri = [alt + (pri << n)]`, `n` = 2 for `LIDX`.
pub fn emit_lidx<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, shift: Option<Cell>) {
    index_address(ctx, TMP, shift);
    load_checked(ctx, PRI, TMP);
}

/// `IDXADDR` / `IDXADDR.B n`: `pri = alt + (pri << n)`
pub fn emit_idxaddr<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, shift: Option<Cell>) {
    index_address(ctx, PRI, shift);
}

/// `LOAD.both a b` / `LOAD.S.both a b`
pub fn emit_load_both<S: CodeSink>(
    ctx: &mut TemplateContext<'_, S>,
    first: Cell,
    second: Cell,
    frame_relative: bool,
) {
    if frame_relative {
        emit_load_frame(ctx, PRI, first);
        emit_load_frame(ctx, ALT, second);
    } else {
        emit_load_global(ctx, PRI, first);
        emit_load_global(ctx, ALT, second);
    }
}

/// `CONST addr value` / `CONST.S offs value`
pub fn emit_const_store<S: CodeSink>(
    ctx: &mut TemplateContext<'_, S>,
    addr: Cell,
    value: Cell,
    frame_relative: bool,
) {
    if frame_relative {
        ctx.asm.lea(TMP, frame_addr(addr));
    } else {
        ctx.asm.mov_ri(TMP, addr);
    }
    ctx.check_address(TMP);
    ctx.asm.mov_mi(guest(TMP), value);
}

/// `ZERO addr` / `ZERO.S offs`
pub fn emit_zero<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, addr: Cell, frame_relative: bool) {
    emit_const_store(ctx, addr, 0, frame_relative);
}
