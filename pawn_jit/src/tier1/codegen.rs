//! Two-pass compilation driver.
//!
//! 1. Decode and validate the function
//! 2. Emit into a [`SizeCounter`], learning the code size and the native
//!    offset of every bytecode cell
//! 3. Allocate an executable buffer of exactly that size
//! 4. Emit again into the buffer, resolving every branch from pass one
//! 5. Point call slots at their thunks, record loop edges and the PC map

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use pawn_core::{ErrorCode, Image};
use tracing::debug;

use super::context::{CompileOptions, EntryFn, JitContext, RuntimeHelpers};
use super::decode::decode_function;
use super::template::{Emitted, TemplateContext};
use crate::backend::x64::{
    CodeAllocator, CodeSink, ExecutableBuffer, LabelLayout, SizeCounter, SliceWriter,
};

// =============================================================================
// Loop Edges
// =============================================================================

/// A backward branch the watchdog can redirect.
///
/// `field_offset` is 4-byte aligned, so the displacement can be swapped with
/// a single atomic store while other threads execute the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEdge {
    /// Offset of the rel32 field in the function's code.
    pub field_offset: u32,
    /// Bytecode offset of the branch.
    pub cip: u32,
    /// Displacement to the loop header.
    pub normal_rel: i32,
    /// Displacement to the timeout stub.
    pub trap_rel: i32,
}

// =============================================================================
// Compiled Function
// =============================================================================

/// Native code for one bytecode function.
pub struct CompiledFunction {
    code_offset: u32,
    code_end: u32,
    buffer: ExecutableBuffer,
    /// Indirect call targets, one per `CALL` site.
    slots: Box<[AtomicUsize]>,
    loop_edges: Vec<LoopEdge>,
    /// `(native offset, bytecode offset)` per instruction, ascending.
    pc_map: Vec<(u32, u32)>,
    patched: AtomicBool,
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("code_offset", &self.code_offset)
            .field("native_size", &self.buffer.len())
            .field("loop_edges", &self.loop_edges.len())
            .field("patched", &self.is_patched())
            .finish()
    }
}

impl CompiledFunction {
    /// Bytecode offset of the function's `PROC`.
    #[inline]
    pub fn code_offset(&self) -> u32 {
        self.code_offset
    }

    /// One past the function's last bytecode cell.
    #[inline]
    pub fn code_end(&self) -> u32 {
        self.code_end
    }

    /// Address of the native entry point.
    #[inline]
    pub fn entry_address(&self) -> usize {
        self.buffer.as_ptr() as usize
    }

    /// The native entry point.
    #[inline]
    pub fn entry(&self) -> EntryFn {
        // SAFETY: the buffer starts with the prologue emitted for `EntryFn`.
        unsafe { std::mem::transmute::<*const u8, EntryFn>(self.buffer.as_ptr()) }
    }

    /// Run the function against `ctx`, returning the raw status.
    ///
    /// # Safety
    ///
    /// `ctx` must describe live guest memory of `mem_size + 4` bytes and a
    /// return stack of `MAX_RETURN_STACK` entries, with `sp` positioned at
    /// the argument count, and the helpers the function was compiled with
    /// must accept `ctx.runtime`.
    pub unsafe fn invoke(&self, ctx: &mut JitContext) -> i32 {
        if !crate::is_supported() {
            return ErrorCode::Fatal.as_i32();
        }
        // SAFETY: upheld by the caller.
        unsafe { (self.entry())(ctx) }
    }

    /// Loop edges in emission order.
    #[inline]
    pub fn loop_edges(&self) -> &[LoopEdge] {
        &self.loop_edges
    }

    /// Number of `CALL` sites.
    #[inline]
    pub fn call_sites(&self) -> usize {
        self.slots.len()
    }

    /// Whether the loop edges currently lead to the timeout stubs.
    #[inline]
    pub fn is_patched(&self) -> bool {
        self.patched.load(Ordering::Acquire)
    }

    /// Redirect every loop edge to its timeout stub.
    ///
    /// Returns the number of edges written; zero when already patched.
    pub fn patch_loop_edges(&self) -> usize {
        if self.patched.swap(true, Ordering::AcqRel) {
            return 0;
        }
        for edge in &self.loop_edges {
            self.write_field(edge.field_offset, edge.trap_rel);
        }
        self.loop_edges.len()
    }

    /// Restore every loop edge to its loop header.
    pub fn unpatch_loop_edges(&self) -> usize {
        if !self.patched.swap(false, Ordering::AcqRel) {
            return 0;
        }
        for edge in &self.loop_edges {
            self.write_field(edge.field_offset, edge.normal_rel);
        }
        self.loop_edges.len()
    }

    fn write_field(&self, offset: u32, rel: i32) {
        let addr = self.buffer.as_ptr() as usize + offset as usize;
        debug_assert!(addr % 4 == 0 && offset as usize + 4 <= self.buffer.len());
        // SAFETY: the field lies inside the mapping and is 4-byte aligned.
        let field = unsafe { &*(addr as *const AtomicI32) };
        field.store(rel, Ordering::SeqCst);
    }

    /// Bytecode offset of the instruction containing native address `pc`.
    pub fn lookup_cip(&self, pc: usize) -> Option<u32> {
        if !self.buffer.contains(pc) {
            return None;
        }
        let offset = (pc - self.buffer.as_ptr() as usize) as u32;
        let index = self.pc_map.partition_point(|&(native, _)| native <= offset);
        index.checked_sub(1).map(|i| self.pc_map[i].1)
    }

    /// Native offset of the instruction at bytecode offset `cip`.
    pub fn native_offset(&self, cip: u32) -> Option<u32> {
        self.pc_map
            .iter()
            .find(|&&(_, c)| c == cip)
            .map(|&(native, _)| native)
    }

    /// Whether native address `pc` lies in this function.
    #[inline]
    pub fn contains_pc(&self, pc: usize) -> bool {
        self.buffer.contains(pc)
    }

    /// The generated code.
    ///
    /// Loop-edge fields may be rewritten concurrently; compare snapshots only
    /// while holding the lock that serializes patching.
    #[inline]
    pub fn code_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Size of the generated code in bytes.
    #[inline]
    pub fn native_size(&self) -> usize {
        self.buffer.len()
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Compile the function whose `PROC` is at `offset`.
pub fn compile(
    image: &Image,
    offset: u32,
    helpers: &RuntimeHelpers,
    options: CompileOptions,
    allocator: &CodeAllocator,
) -> Result<CompiledFunction, ErrorCode> {
    let body = decode_function(image, offset)?;
    let slots: Box<[AtomicUsize]> = (0..body.call_sites())
        .map(|_| AtomicUsize::new(0))
        .collect();

    // Pass one: sizes and label positions.
    let sizing = SizeCounter::new();
    let ctx = TemplateContext::new(sizing, LabelLayout::new(), &body, helpers, options, &slots);
    let (counter, layout, _, _) = ctx.emit_function();
    let size = counter.position();

    let mut buffer = allocator.allocate(size)?;

    // Pass two: the real thing.
    let (overflowed, written, final_layout, matched, emitted) = {
        let sink = SliceWriter::new(buffer.as_mut_slice());
        let ctx = TemplateContext::new(sink, layout, &body, helpers, options, &slots);
        let (writer, final_layout, matched, emitted) = ctx.emit_function();
        (writer.overflowed(), writer.position(), final_layout, matched, emitted)
    };
    if overflowed || written != size || !matched {
        debug!(offset, size, written, matched, "code layout diverged between passes");
        return Err(ErrorCode::Fatal);
    }

    let base = buffer.as_ptr() as usize;
    let at = |id: u32| -> Result<u32, ErrorCode> {
        final_layout
            .get(id as usize)
            .copied()
            .flatten()
            .ok_or(ErrorCode::Fatal)
    };

    let Emitted { loop_edges, calls } = emitted;
    for call in &calls {
        let thunk = at(call.thunk.id())?;
        let slot = slots.get(call.slot).ok_or(ErrorCode::Fatal)?;
        slot.store(base + thunk as usize, Ordering::Release);
    }

    let loop_edges = loop_edges
        .iter()
        .map(|edge| {
            let field_end = edge.field + 4;
            Ok(LoopEdge {
                field_offset: edge.field,
                cip: edge.cip,
                normal_rel: at(edge.target.id())?.wrapping_sub(field_end) as i32,
                trap_rel: at(edge.stub.id())?.wrapping_sub(field_end) as i32,
            })
        })
        .collect::<Result<Vec<_>, ErrorCode>>()?;

    let pc_map = body
        .instructions
        .iter()
        .filter_map(|insn| {
            let index = body.cell_index(insn.cip)?;
            final_layout.get(index).copied().flatten().map(|native| (native, insn.cip))
        })
        .collect::<Vec<_>>();

    debug!(
        offset,
        end = body.end,
        size,
        loop_edges = loop_edges.len(),
        call_sites = slots.len(),
        "compiled function"
    );

    Ok(CompiledFunction {
        code_offset: body.start,
        code_end: body.end,
        buffer,
        slots,
        loop_edges,
        pc_map,
        patched: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier1::context::CheckMode;
    use pawn_core::{ImageBuilder, Opcode};

    unsafe extern "C" fn nop_helper(_: *mut JitContext) -> i32 {
        0
    }
    unsafe extern "C" fn nop_helper1(_: *mut JitContext, _: i32) -> i32 {
        0
    }
    unsafe extern "C" fn nop_helper2(_: *mut JitContext, _: i32, _: i32) -> i32 {
        0
    }
    unsafe extern "C" fn timeout_helper(_: *mut JitContext) -> i32 {
        ErrorCode::Timeout.as_i32()
    }
    unsafe extern "C" fn call_helper(_: *mut JitContext, _: u32, _: *const AtomicUsize) -> i32 {
        ErrorCode::InvalidNative.as_i32()
    }

    fn helpers() -> RuntimeHelpers {
        RuntimeHelpers {
            invoke_native: nop_helper1,
            compile_call: call_helper,
            timeout: timeout_helper,
            generate_array: nop_helper2,
            tracker_push: nop_helper1,
            tracker_pop: nop_helper,
            copy_memory: nop_helper1,
            fill_memory: nop_helper1,
            round_float: nop_helper1,
            debug_break: nop_helper,
        }
    }

    fn add_image() -> Image {
        let mut b = ImageBuilder::new("add");
        b.begin_function("main");
        b.op1(Opcode::ConstPri, 5)
            .op1(Opcode::ConstAlt, 7)
            .op(Opcode::Add)
            .op(Opcode::Retn);
        b.build().unwrap()
    }

    fn loop_image() -> Image {
        let mut b = ImageBuilder::new("loop");
        b.begin_function("spin");
        let top = b.label_here();
        b.op(Opcode::IncPri);
        b.jump(Opcode::Jump, top);
        b.build().unwrap()
    }

    #[test]
    fn test_compile_rejects_bad_offset() {
        let image = add_image();
        let err = compile(&image, 4, &helpers(), CompileOptions::default(), &CodeAllocator::new())
            .unwrap_err();
        assert_eq!(err, ErrorCode::InvalidInstruction);
    }

    #[test]
    #[cfg(unix)]
    fn test_pc_map_covers_instructions() {
        let image = add_image();
        let f = compile(&image, 0, &helpers(), CompileOptions::default(), &CodeAllocator::new())
            .unwrap();
        assert_eq!(f.code_offset(), 0);
        assert_eq!(f.code_end(), 28);
        assert_eq!(f.call_sites(), 0);
        assert!(f.loop_edges().is_empty());

        let base = f.entry_address();
        for cip in [0u32, 4, 12, 20] {
            let native = f.native_offset(cip).unwrap();
            assert_eq!(f.lookup_cip(base + native as usize), Some(cip));
        }
        assert_eq!(f.lookup_cip(base + f.native_size()), None);
        assert!(f.contains_pc(base));
    }

    #[test]
    #[cfg(unix)]
    fn test_patch_unpatch_restores_code() {
        let image = loop_image();
        let f = compile(&image, 0, &helpers(), CompileOptions::default(), &CodeAllocator::new())
            .unwrap();
        assert_eq!(f.loop_edges().len(), 1);
        let edge = f.loop_edges()[0];
        assert_eq!(edge.field_offset % 4, 0);
        assert_ne!(edge.normal_rel, edge.trap_rel);

        let before = f.code_bytes().to_vec();
        assert_eq!(f.patch_loop_edges(), 1);
        assert_eq!(f.patch_loop_edges(), 0);
        assert!(f.is_patched());
        assert_ne!(f.code_bytes(), &before[..]);

        assert_eq!(f.unpatch_loop_edges(), 1);
        assert_eq!(f.unpatch_loop_edges(), 0);
        assert_eq!(f.code_bytes(), &before[..]);
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    fn run(f: &CompiledFunction, memory: &mut Vec<u8>) -> (i32, JitContext) {
        let mut rstk = vec![0u32; pawn_core::MAX_RETURN_STACK];
        let mem_size = (memory.len() - 4) as u32;
        let mut ctx = JitContext::new(memory.as_mut_ptr(), rstk.as_mut_ptr(), std::ptr::null_mut());
        ctx.mem_size = mem_size;
        ctx.sp = mem_size - 4;
        ctx.frm = 0;
        let status = unsafe { f.invoke(&mut ctx) };
        (status, ctx)
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", unix))]
    fn test_execute_add() {
        for check_mode in [CheckMode::Inline, CheckMode::OutOfLine] {
            let options = CompileOptions {
                check_mode,
                debug: false,
            };
            let image = add_image();
            let f = compile(&image, 0, &helpers(), options, &CodeAllocator::new()).unwrap();
            let mut memory = vec![0u8; 1024 + 4];
            let (status, ctx) = run(&f, &mut memory);
            assert_eq!(status, 0);
            assert_eq!(ctx.pri, 12);
            assert_eq!(ctx.alt, 7);
            assert_eq!(ctx.sp, 1024);
            assert_eq!(ctx.frm, 0);
        }
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", unix))]
    fn test_execute_divide_by_zero() {
        let mut b = ImageBuilder::new("div");
        b.begin_function("main");
        b.op1(Opcode::ConstPri, 10)
            .op1(Opcode::ConstAlt, 0)
            .op(Opcode::Sdiv)
            .op(Opcode::Retn);
        let image = b.build().unwrap();
        let f = compile(&image, 0, &helpers(), CompileOptions::default(), &CodeAllocator::new())
            .unwrap();
        let mut memory = vec![0u8; 1024 + 4];
        let (status, ctx) = run(&f, &mut memory);
        assert_eq!(status, ErrorCode::DivideByZero.as_i32());
        assert_eq!(ctx.cip, 20);
        assert_eq!(ctx.frm, 0);
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", unix))]
    fn test_patched_loop_reaches_timeout_helper() {
        let image = loop_image();
        let f = compile(&image, 0, &helpers(), CompileOptions::default(), &CodeAllocator::new())
            .unwrap();
        f.patch_loop_edges();
        let mut memory = vec![0u8; 1024 + 4];
        let (status, ctx) = run(&f, &mut memory);
        assert_eq!(status, ErrorCode::Timeout.as_i32());
        assert_eq!(ctx.pri, 1);
        assert_eq!(ctx.cip, f.loop_edges()[0].cip);
    }
}
