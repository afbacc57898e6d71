//! x64 assembler with label support over pluggable code sinks.
//!
//! Code is emitted twice. The first pass writes into a [`SizeCounter`] that
//! materializes nothing and only learns label positions; the second pass
//! writes into the final buffer through a [`SliceWriter`], resolving forward
//! references with the layout recorded by the first pass. All branches use
//! rel32 displacements, so both passes produce the same layout.

use super::encoder::{self, AluOp, Condition, EncodedInst, ShiftOp, SseOp, UnaryOp};
use super::registers::{Gpr, MemOperand, Xmm};

// =============================================================================
// Code Sinks
// =============================================================================

/// Destination for emitted bytes.
pub trait CodeSink {
    /// Append bytes.
    fn put(&mut self, bytes: &[u8]);

    /// Number of bytes emitted so far.
    fn position(&self) -> usize;
}

/// A sink that only counts bytes.
#[derive(Debug, Default)]
pub struct SizeCounter {
    len: usize,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodeSink for SizeCounter {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }

    #[inline]
    fn position(&self) -> usize {
        self.len
    }
}

/// A sink that writes into a fixed-size buffer.
///
/// Writes past the end are dropped and remembered; callers check
/// [`SliceWriter::overflowed`] once emission is complete.
#[derive(Debug)]
pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    overflowed: bool,
}

impl<'a> SliceWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        SliceWriter {
            buf,
            pos: 0,
            overflowed: false,
        }
    }

    /// Whether any write did not fit.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl CodeSink for SliceWriter<'_> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        match self.buf.get_mut(self.pos..end) {
            Some(dst) => dst.copy_from_slice(bytes),
            None => self.overflowed = true,
        }
        self.pos = end;
    }

    #[inline]
    fn position(&self) -> usize {
        self.pos
    }
}

impl CodeSink for Vec<u8> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }

    #[inline]
    fn position(&self) -> usize {
        self.len()
    }
}

// =============================================================================
// Labels
// =============================================================================

/// A position in the code, possibly not yet bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Label(id)
    }

    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Label positions learned by a previous pass.
pub type LabelLayout = Vec<Option<u32>>;

// =============================================================================
// Assembler
// =============================================================================

/// High-level x64 assembler.
pub struct Assembler<S: CodeSink> {
    sink: S,
    labels: Vec<Option<u32>>,
    layout: LabelLayout,
}

impl<S: CodeSink> Assembler<S> {
    /// Create an assembler for a first pass.
    pub fn new(sink: S) -> Self {
        Self::with_layout(sink, Vec::new())
    }

    /// Create an assembler that resolves forward labels from `layout`.
    pub fn with_layout(sink: S, layout: LabelLayout) -> Self {
        Assembler {
            sink,
            labels: Vec::with_capacity(layout.len()),
            layout,
        }
    }

    /// Current code offset.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.sink.position() as u32
    }

    /// Create a new unbound label.
    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label::new(self.labels.len() as u32 - 1)
    }

    /// Bind a label to the current offset.
    pub fn bind_label(&mut self, label: Label) {
        let here = self.offset();
        self.labels[label.id() as usize] = Some(here);
    }

    /// Offset of a label bound in this pass.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels.get(label.id() as usize).copied().flatten()
    }

    /// Offset a label resolves to: this pass if bound, else the previous.
    fn resolve(&self, label: Label) -> u32 {
        self.label_offset(label)
            .or_else(|| self.layout.get(label.id() as usize).copied().flatten())
            .unwrap_or(0)
    }

    /// Finish emission, returning the sink and the final label layout.
    pub fn finish(self) -> (S, LabelLayout) {
        (self.sink, self.labels)
    }

    /// Whether every label bound this pass agrees with the previous layout.
    pub fn layout_matches(&self) -> bool {
        self.layout.is_empty() || self.layout == self.labels
    }

    #[inline]
    fn emit(&mut self, inst: EncodedInst) {
        self.sink.put(inst.as_bytes());
    }

    /// Emit raw bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.sink.put(bytes);
    }

    // =========================================================================
    // Data movement
    // =========================================================================

    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::mov_rr(dst, src));
    }

    pub fn mov_rr64(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::mov_rr64(dst, src));
    }

    pub fn mov_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit(encoder::mov_ri(dst, imm));
    }

    pub fn mov_ri64(&mut self, dst: Gpr, imm: u64) {
        self.emit(encoder::mov_ri64(dst, imm));
    }

    pub fn mov_rm(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::mov_rm(dst, mem));
    }

    pub fn mov_rm64(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::mov_rm64(dst, mem));
    }

    pub fn mov_mr(&mut self, mem: MemOperand, src: Gpr) {
        self.emit(encoder::mov_mr(mem, src));
    }

    pub fn mov_mr64(&mut self, mem: MemOperand, src: Gpr) {
        self.emit(encoder::mov_mr64(mem, src));
    }

    pub fn mov_mi(&mut self, mem: MemOperand, imm: i32) {
        self.emit(encoder::mov_mi(mem, imm));
    }

    pub fn mov_m8r(&mut self, mem: MemOperand, src: Gpr) {
        self.emit(encoder::mov_m8r(mem, src));
    }

    pub fn mov_m16r(&mut self, mem: MemOperand, src: Gpr) {
        self.emit(encoder::mov_m16r(mem, src));
    }

    pub fn movzx_rm8(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::movzx_rm8(dst, mem));
    }

    pub fn movzx_rm16(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::movzx_rm16(dst, mem));
    }

    pub fn movzx_rr8(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::movzx_rr8(dst, src));
    }

    pub fn movsx_rr8(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::movsx_rr8(dst, src));
    }

    pub fn lea(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::lea(dst, mem));
    }

    pub fn lea64(&mut self, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::lea64(dst, mem));
    }

    pub fn xchg_rr(&mut self, a: Gpr, b: Gpr) {
        self.emit(encoder::xchg_rr(a, b));
    }

    pub fn push(&mut self, reg: Gpr) {
        self.emit(encoder::push(reg));
    }

    pub fn pop(&mut self, reg: Gpr) {
        self.emit(encoder::pop(reg));
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    pub fn alu_rr(&mut self, op: AluOp, dst: Gpr, src: Gpr) {
        self.emit(encoder::alu_rr(op, dst, src));
    }

    pub fn alu_rr64(&mut self, op: AluOp, dst: Gpr, src: Gpr) {
        self.emit(encoder::alu_rr64(op, dst, src));
    }

    pub fn alu_rm(&mut self, op: AluOp, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::alu_rm(op, dst, mem));
    }

    pub fn alu_rm64(&mut self, op: AluOp, dst: Gpr, mem: MemOperand) {
        self.emit(encoder::alu_rm64(op, dst, mem));
    }

    pub fn alu_ri(&mut self, op: AluOp, dst: Gpr, imm: i32) {
        self.emit(encoder::alu_ri(op, dst, imm));
    }

    pub fn alu_ri64(&mut self, op: AluOp, dst: Gpr, imm: i32) {
        self.emit(encoder::alu_ri64(op, dst, imm));
    }

    pub fn alu_mi(&mut self, op: AluOp, mem: MemOperand, imm: i32) {
        self.emit(encoder::alu_mi(op, mem, imm));
    }

    pub fn test_rr(&mut self, a: Gpr, b: Gpr) {
        self.emit(encoder::test_rr(a, b));
    }

    pub fn imul_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::imul_rr(dst, src));
    }

    pub fn imul_rri(&mut self, dst: Gpr, src: Gpr, imm: i32) {
        self.emit(encoder::imul_rri(dst, src, imm));
    }

    pub fn unary(&mut self, op: UnaryOp, reg: Gpr) {
        self.emit(encoder::unary(op, reg));
    }

    pub fn cdq(&mut self) {
        self.emit(encoder::cdq());
    }

    pub fn shift_cl(&mut self, op: ShiftOp, reg: Gpr) {
        self.emit(encoder::shift_cl(op, reg));
    }

    pub fn shift_ri(&mut self, op: ShiftOp, reg: Gpr, imm: u8) {
        self.emit(encoder::shift_ri(op, reg, imm));
    }

    pub fn setcc(&mut self, cond: Condition, reg: Gpr) {
        self.emit(encoder::setcc(cond, reg));
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// `jmp label`; returns the offset of the rel32 field.
    pub fn jmp(&mut self, label: Label) -> u32 {
        let target = self.resolve(label);
        let rel = target.wrapping_sub(self.offset() + 5) as i32;
        self.emit(encoder::jmp_rel32(rel));
        self.offset() - 4
    }

    /// `jcc label`; returns the offset of the rel32 field.
    pub fn jcc(&mut self, cond: Condition, label: Label) -> u32 {
        let target = self.resolve(label);
        let rel = target.wrapping_sub(self.offset() + 6) as i32;
        self.emit(encoder::jcc_rel32(cond, rel));
        self.offset() - 4
    }

    /// Pad with `nop` so that an instruction with an `opcode_len`-byte
    /// opcode starting here has a 4-byte aligned rel32 field.
    pub fn align_branch_field(&mut self, opcode_len: u32) {
        while (self.offset() + opcode_len) % 4 != 0 {
            self.nop();
        }
    }

    pub fn call_r(&mut self, reg: Gpr) {
        self.emit(encoder::call_r(reg));
    }

    pub fn call_m(&mut self, mem: MemOperand) {
        self.emit(encoder::call_m(mem));
    }

    pub fn jmp_r(&mut self, reg: Gpr) {
        self.emit(encoder::jmp_r(reg));
    }

    pub fn ret(&mut self) {
        self.emit(encoder::single(encoder::RET));
    }

    pub fn nop(&mut self) {
        self.emit(encoder::single(encoder::NOP));
    }

    pub fn int3(&mut self) {
        self.emit(encoder::single(encoder::INT3));
    }

    pub fn ud2(&mut self) {
        self.emit(encoder::ud2());
    }

    // =========================================================================
    // SSE
    // =========================================================================

    pub fn movd_xr(&mut self, dst: Xmm, src: Gpr) {
        self.emit(encoder::movd_xr(dst, src));
    }

    pub fn movd_rx(&mut self, dst: Gpr, src: Xmm) {
        self.emit(encoder::movd_rx(dst, src));
    }

    pub fn movd_xm(&mut self, dst: Xmm, mem: MemOperand) {
        self.emit(encoder::movd_xm(dst, mem));
    }

    pub fn sse_ss(&mut self, op: SseOp, dst: Xmm, src: Xmm) {
        self.emit(encoder::sse_ss(op, dst, src));
    }

    pub fn ucomiss(&mut self, a: Xmm, b: Xmm) {
        self.emit(encoder::ucomiss(a, b));
    }

    pub fn cvtsi2ss(&mut self, dst: Xmm, src: Gpr) {
        self.emit(encoder::cvtsi2ss(dst, src));
    }
}
