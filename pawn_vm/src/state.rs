//! Per-runtime guest memory and execution cursors.
//!
//! # Layout
//!
//! ```text
//! 0          data_size          hp                    sp          mem_size
//! ┌────────────┬──────────────────┬─────────────────────┬─────────────┐
//! │    data    │  heap (grows →)  │      free gap       │(← grows) stk│
//! └────────────┴──────────────────┴─────────────────────┴─────────────┘
//! ```
//!
//! An address is valid below `mem_size` and outside the free gap. The buffer
//! carries one padding cell past `mem_size` so a cell access at any valid
//! address stays in bounds.
//!
//! Both executors and the JIT helpers mutate the cursors only through this
//! module, which keeps `hp <= sp` and the stack margin intact.

use std::ffi::c_void;

use pawn_core::{round_cell, Cell, ErrorCode, RoundingMode, MAX_RETURN_STACK, STACK_MARGIN};
use pawn_jit::JitContext;
use smallvec::SmallVec;

// =============================================================================
// Constants
// =============================================================================

/// Memory reserved beyond the data segment when the image asks for less.
pub const MIN_FREE_MEMORY: u32 = 16 * 1024;

/// Largest guest memory a runtime may request.
pub const MAX_MEMORY: u32 = 256 * 1024 * 1024;

/// Initial heap tracker capacity in entries.
pub const TRACKER_CAPACITY: usize = 256;

/// Most dimensions `GENARRAY` accepts.
pub const MAX_ARRAY_DIMS: usize = 16;

#[inline]
fn align_cell(value: u64) -> u64 {
    (value + 3) & !3
}

// =============================================================================
// Saved Cursors
// =============================================================================

/// Cursor values captured around an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    pub sp: u32,
    pub hp: u32,
    pub frm: u32,
    pub rp: u32,
    pub cip: u32,
}

/// An error a native raised explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFault {
    pub code: ErrorCode,
    pub message: String,
}

// =============================================================================
// Heap Tracker
// =============================================================================

/// LIFO record of heap growth, in bytes.
#[derive(Debug, Clone)]
pub struct HeapTracker {
    entries: Vec<u32>,
}

impl HeapTracker {
    fn new() -> Self {
        HeapTracker {
            entries: Vec::with_capacity(TRACKER_CAPACITY),
        }
    }

    #[inline]
    fn push(&mut self, bytes: u32) {
        self.entries.push(bytes);
    }

    #[inline]
    fn pop(&mut self) -> Option<u32> {
        self.entries.pop()
    }

    #[inline]
    fn last(&self) -> Option<u32> {
        self.entries.last().copied()
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Runtime State
// =============================================================================

/// Guest memory, cursors, return stack and heap tracker of one runtime.
#[derive(Debug)]
pub struct RuntimeState {
    memory: Vec<u8>,
    mem_size: u32,
    data_size: u32,
    pub(crate) hp: u32,
    pub(crate) sp: u32,
    pub(crate) frm: u32,
    /// Bytecode offset of the instruction that last faulted or left the
    /// executor.
    pub(crate) cip: u32,
    rstk: Box<[u32]>,
    pub(crate) rp: u32,
    tracker: HeapTracker,
    last_native: Option<u32>,
    native_fault: Option<NativeFault>,
    last_break: Option<u32>,
}

impl RuntimeState {
    /// Lay out memory for a data template and a requested total size.
    ///
    /// The total is raised to leave at least [`MIN_FREE_MEMORY`] bytes past
    /// the data segment.
    pub fn new(data: &[u8], memory_size: u32) -> Result<Self, ErrorCode> {
        let data_size = align_cell(data.len() as u64);
        let wanted = (memory_size as u64).max(data_size + MIN_FREE_MEMORY as u64);
        let mem_size = align_cell(wanted);
        if mem_size > MAX_MEMORY as u64 {
            return Err(ErrorCode::OutOfMemory);
        }
        let mem_size = mem_size as u32;
        let data_size = data_size as u32;

        let mut memory = vec![0u8; mem_size as usize + 4];
        memory[..data.len()].copy_from_slice(data);

        Ok(RuntimeState {
            memory,
            mem_size,
            data_size,
            hp: data_size,
            sp: mem_size,
            frm: mem_size,
            cip: 0,
            rstk: vec![0u32; MAX_RETURN_STACK].into_boxed_slice(),
            rp: 0,
            tracker: HeapTracker::new(),
            last_native: None,
            native_fault: None,
            last_break: None,
        })
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    /// Addressable memory in bytes.
    #[inline]
    pub fn mem_size(&self) -> u32 {
        self.mem_size
    }

    /// Size of the data segment, the lowest legal heap pointer.
    #[inline]
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    #[inline]
    pub fn hp(&self) -> u32 {
        self.hp
    }

    #[inline]
    pub fn sp(&self) -> u32 {
        self.sp
    }

    #[inline]
    pub fn frm(&self) -> u32 {
        self.frm
    }

    #[inline]
    pub fn cip(&self) -> u32 {
        self.cip
    }

    /// Return-address stack depth.
    #[inline]
    pub fn rp(&self) -> u32 {
        self.rp
    }

    /// Live heap tracker entries.
    #[inline]
    pub fn tracker_depth(&self) -> usize {
        self.tracker.len()
    }

    /// Capture the cursors for later restoration.
    pub fn save_cursors(&self) -> Cursors {
        Cursors {
            sp: self.sp,
            hp: self.hp,
            frm: self.frm,
            rp: self.rp,
            cip: self.cip,
        }
    }

    /// Restore saved cursors and drop tracker entries above the saved heap.
    pub fn restore_cursors(&mut self, saved: Cursors) {
        self.unwind_tracker(saved.hp);
        self.sp = saved.sp;
        self.hp = saved.hp;
        self.frm = saved.frm;
        self.rp = saved.rp;
        self.cip = saved.cip;
    }

    /// Pop tracker entries recorded for heap above `hp`.
    fn unwind_tracker(&mut self, hp: u32) {
        let mut top = self.hp;
        while top > hp {
            match self.tracker.pop() {
                Some(bytes) => top = top.saturating_sub(bytes),
                None => break,
            }
        }
    }

    /// Call sites currently on the return stack, outermost first.
    pub fn call_sites(&self) -> &[u32] {
        let depth = (self.rp as usize).min(self.rstk.len());
        &self.rstk[..depth]
    }

    /// Record a call site.
    pub fn push_return(&mut self, cip: u32) -> Result<(), ErrorCode> {
        let slot = self
            .rstk
            .get_mut(self.rp as usize)
            .ok_or(ErrorCode::StackLow)?;
        *slot = cip;
        self.rp += 1;
        Ok(())
    }

    /// Drop the most recent call site.
    pub fn pop_return(&mut self) {
        self.rp = self.rp.saturating_sub(1);
    }

    // =========================================================================
    // Address Checks
    // =========================================================================

    /// Whether `addr` may be read or written.
    #[inline]
    pub fn is_valid_address(&self, addr: u32) -> bool {
        addr < self.mem_size && !(addr >= self.hp && addr < self.sp)
    }

    #[inline]
    pub fn check_address(&self, addr: u32) -> Result<(), ErrorCode> {
        if self.is_valid_address(addr) {
            Ok(())
        } else {
            Err(ErrorCode::MemAccess)
        }
    }

    /// Check that `[addr, addr + len)` lies wholly in the data and heap
    /// region or wholly in the stack.
    pub fn check_range(&self, addr: u32, len: u32) -> Result<(), ErrorCode> {
        if len == 0 {
            return Ok(());
        }
        let end = addr as u64 + len as u64;
        let below_gap = end <= self.hp as u64;
        let above_gap = addr >= self.sp && end <= self.mem_size as u64;
        if below_gap || above_gap {
            Ok(())
        } else {
            Err(ErrorCode::MemAccess)
        }
    }

    // =========================================================================
    // Memory Access
    // =========================================================================

    #[inline]
    fn raw_cell(&self, addr: u32) -> Cell {
        let at = addr as usize;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.memory[at..at + 4]);
        Cell::from_le_bytes(bytes)
    }

    #[inline]
    fn set_raw_cell(&mut self, addr: u32, value: Cell) {
        let at = addr as usize;
        self.memory[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read the cell at `addr`.
    #[inline]
    pub fn read_cell(&self, addr: u32) -> Result<Cell, ErrorCode> {
        self.check_address(addr)?;
        Ok(self.raw_cell(addr))
    }

    /// Write the cell at `addr`.
    #[inline]
    pub fn write_cell(&mut self, addr: u32, value: Cell) -> Result<(), ErrorCode> {
        self.check_address(addr)?;
        self.set_raw_cell(addr, value);
        Ok(())
    }

    /// Read 1, 2 or 4 bytes at `addr`, zero-extended; other widths read a
    /// whole cell.
    pub fn read_sized(&self, addr: u32, width: Cell) -> Result<Cell, ErrorCode> {
        self.check_address(addr)?;
        let at = addr as usize;
        Ok(match width {
            1 => self.memory[at] as Cell,
            2 => u16::from_le_bytes([self.memory[at], self.memory[at + 1]]) as Cell,
            _ => self.raw_cell(addr),
        })
    }

    /// Store the low 1, 2 or 4 bytes of `value` at `addr`; other widths
    /// store nothing.
    pub fn write_sized(&mut self, addr: u32, width: Cell, value: Cell) -> Result<(), ErrorCode> {
        self.check_address(addr)?;
        let at = addr as usize;
        let bytes = value.to_le_bytes();
        match width {
            1 => self.memory[at] = bytes[0],
            2 => self.memory[at..at + 2].copy_from_slice(&bytes[..2]),
            4 => self.memory[at..at + 4].copy_from_slice(&bytes),
            _ => {}
        }
        Ok(())
    }

    /// Borrow `len` bytes at `addr`.
    pub fn bytes(&self, addr: u32, len: u32) -> Result<&[u8], ErrorCode> {
        self.check_range(addr, len)?;
        let at = addr as usize;
        Ok(&self.memory[at..at + len as usize])
    }

    /// Mutably borrow `len` bytes at `addr`.
    pub fn bytes_mut(&mut self, addr: u32, len: u32) -> Result<&mut [u8], ErrorCode> {
        self.check_range(addr, len)?;
        let at = addr as usize;
        Ok(&mut self.memory[at..at + len as usize])
    }

    /// Read a NUL-terminated string at `addr`.
    ///
    /// The string may not run into the free gap or past memory.
    pub fn read_string(&self, addr: u32) -> Result<String, ErrorCode> {
        self.check_address(addr)?;
        let limit = if addr < self.hp { self.hp } else { self.mem_size };
        let region = &self.memory[addr as usize..limit as usize];
        let len = region
            .iter()
            .position(|&b| b == 0)
            .ok_or(ErrorCode::MemAccess)?;
        Ok(String::from_utf8_lossy(&region[..len]).into_owned())
    }

    /// Write `text` plus a terminator at `addr`, truncated to `max_bytes`
    /// including the terminator.
    pub fn write_string(&mut self, addr: u32, text: &str, max_bytes: u32) -> Result<u32, ErrorCode> {
        if max_bytes == 0 {
            return Ok(0);
        }
        let len = text.len().min(max_bytes as usize - 1) as u32;
        let dest = self.bytes_mut(addr, len + 1)?;
        dest[..len as usize].copy_from_slice(&text.as_bytes()[..len as usize]);
        dest[len as usize] = 0;
        Ok(len)
    }

    /// `MOVS`: copy `len` bytes from `src` to `dst`.
    pub fn copy_memory(&mut self, src: u32, dst: u32, len: u32) -> Result<(), ErrorCode> {
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        let (src, dst) = (src as usize, dst as usize);
        self.memory
            .copy_within(src..src + len as usize, dst);
        Ok(())
    }

    /// `FILL`: write `value` repeatedly over `len` bytes at `dst`.
    pub fn fill_memory(&mut self, dst: u32, len: u32, value: Cell) -> Result<(), ErrorCode> {
        let dest = self.bytes_mut(dst, len)?;
        let pattern = value.to_le_bytes();
        for chunk in dest.chunks_mut(4) {
            chunk.copy_from_slice(&pattern[..chunk.len()]);
        }
        Ok(())
    }

    // =========================================================================
    // Operand Stack
    // =========================================================================

    /// Fail unless `bytes` more can be pushed without crossing `hp`.
    #[inline]
    pub fn check_stack_space(&self, bytes: u32) -> Result<(), ErrorCode> {
        if (self.sp as u64) < self.hp as u64 + bytes as u64 {
            Err(ErrorCode::StackLow)
        } else {
            Ok(())
        }
    }

    /// Fail unless `cells` cells can be read at the stack pointer.
    #[inline]
    pub fn check_stack_cells(&self, cells: u32) -> Result<(), ErrorCode> {
        if self.sp as u64 + 4 * cells as u64 > self.mem_size as u64 {
            Err(ErrorCode::StackMin)
        } else {
            Ok(())
        }
    }

    /// Push a cell.
    #[inline]
    pub fn push(&mut self, value: Cell) -> Result<(), ErrorCode> {
        self.check_stack_space(4)?;
        self.push_unchecked(value);
        Ok(())
    }

    /// Push a cell after the caller checked the space.
    #[inline]
    pub(crate) fn push_unchecked(&mut self, value: Cell) {
        self.sp -= 4;
        self.set_raw_cell(self.sp, value);
    }

    /// Pop a cell.
    #[inline]
    pub fn pop(&mut self) -> Result<Cell, ErrorCode> {
        self.check_stack_cells(1)?;
        let value = self.raw_cell(self.sp);
        self.sp += 4;
        Ok(value)
    }

    /// The cell `index` slots above the stack pointer.
    #[inline]
    pub fn peek(&self, index: u32) -> Result<Cell, ErrorCode> {
        self.check_stack_cells(index + 1)?;
        Ok(self.raw_cell(self.sp + 4 * index))
    }

    /// Overwrite the cell `index` slots above the stack pointer.
    #[inline]
    pub fn poke(&mut self, index: u32, value: Cell) -> Result<(), ErrorCode> {
        self.check_stack_cells(index + 1)?;
        self.set_raw_cell(self.sp + 4 * index, value);
        Ok(())
    }

    /// Move the stack pointer by `amount` bytes (`STACK n`).
    pub fn adjust_stack(&mut self, amount: Cell) -> Result<(), ErrorCode> {
        if amount % 4 != 0 {
            return Err(ErrorCode::InvalidInstruction);
        }
        let target = self.sp as i64 + amount as i64;
        if amount > 0 {
            if target >= self.mem_size as i64 {
                return Err(ErrorCode::StackMin);
            }
        } else if target < self.hp as i64 + STACK_MARGIN as i64 {
            return Err(ErrorCode::StackLow);
        }
        self.sp = target as u32;
        Ok(())
    }

    /// Set the stack pointer relative to the frame (`STACKADJUST n`).
    pub fn set_stack_from_frame(&mut self, amount: Cell) -> Result<(), ErrorCode> {
        if amount % 4 != 0 || amount > 0 {
            return Err(ErrorCode::InvalidInstruction);
        }
        let target = self.frm.wrapping_add(amount as u32);
        if target >= self.mem_size {
            return Err(ErrorCode::StackMin);
        }
        if target < self.hp.wrapping_add(STACK_MARGIN) {
            return Err(ErrorCode::StackLow);
        }
        self.sp = target;
        Ok(())
    }

    // =========================================================================
    // Heap
    // =========================================================================

    /// Move the heap pointer by `amount` bytes (`HEAP n`); returns the old
    /// heap pointer.
    pub fn adjust_heap(&mut self, amount: Cell) -> Result<u32, ErrorCode> {
        let old = self.hp;
        let target = old as i64 + amount as i64;
        if amount > 0 {
            if target > self.sp as i64 {
                return Err(ErrorCode::HeapLow);
            }
        } else if target < self.data_size as i64 {
            return Err(ErrorCode::HeapMin);
        }
        self.hp = target as u32;
        Ok(old)
    }

    /// Allocate `cells` cells on the heap and record them on the tracker.
    pub fn heap_alloc(&mut self, cells: u32) -> Result<u32, ErrorCode> {
        let bytes = cells.checked_mul(4).ok_or(ErrorCode::HeapLow)?;
        if self.hp as u64 + bytes as u64 + STACK_MARGIN as u64 > self.sp as u64 {
            return Err(ErrorCode::HeapLow);
        }
        let addr = self.hp;
        self.hp += bytes;
        self.tracker.push(bytes);
        Ok(addr)
    }

    /// Free the most recent allocation, which must start at `addr`.
    pub fn heap_pop(&mut self, addr: u32) -> Result<(), ErrorCode> {
        let bytes = self.tracker.last().ok_or(ErrorCode::InvalidAddress)?;
        if self.hp.checked_sub(bytes) != Some(addr) || addr < self.data_size {
            return Err(ErrorCode::InvalidAddress);
        }
        self.tracker.pop();
        self.hp = addr;
        Ok(())
    }

    /// Drop the heap back to `addr` along with every allocation above it.
    pub fn heap_release(&mut self, addr: u32) -> Result<(), ErrorCode> {
        if addr < self.data_size || addr > self.hp {
            return Err(ErrorCode::InvalidAddress);
        }
        self.unwind_tracker(addr);
        self.hp = addr;
        Ok(())
    }

    /// `TRACKER.PUSH.C`
    pub fn tracker_push(&mut self, bytes: u32) {
        self.tracker.push(bytes);
    }

    /// `TRACKER.POP.SETHEAP`: pop the tracker and lower the heap.
    pub fn tracker_pop_set_heap(&mut self) -> Result<(), ErrorCode> {
        let bytes = self.tracker.pop().ok_or(ErrorCode::TrackerBounds)?;
        if bytes > self.hp - self.data_size {
            return Err(ErrorCode::HeapMin);
        }
        self.hp -= bytes;
        Ok(())
    }

    /// `GENARRAY[.Z] dims`
    ///
    /// Dimension sizes sit on the stack innermost first. The block holds the
    /// indirection vectors followed by the data; its address replaces the
    /// outermost size and the other sizes are popped.
    pub fn generate_array(&mut self, dims: Cell, autozero: bool) -> Result<(), ErrorCode> {
        let count = usize::try_from(dims)
            .ok()
            .filter(|&n| n >= 1 && n <= MAX_ARRAY_DIMS)
            .ok_or(ErrorCode::InstructionParam)?;
        self.check_stack_cells(count as u32)?;

        let argv: SmallVec<[Cell; MAX_ARRAY_DIMS]> =
            (0..count as u32).map(|i| self.raw_cell(self.sp + 4 * i)).collect();
        let cells = array_cells(&argv)?;
        let bytes = cells.checked_mul(4).ok_or(ErrorCode::ArrayTooBig)?;
        let new_hp = self.hp as u64 + bytes as u64;
        if new_hp + STACK_MARGIN as u64 > self.sp as u64 {
            return Err(ErrorCode::HeapLow);
        }

        let base = self.hp;
        if autozero {
            self.memory[base as usize..new_hp as usize].fill(0);
        }
        if count > 1 {
            // Outermost dimension first.
            let sizes: SmallVec<[u32; MAX_ARRAY_DIMS]> =
                argv.iter().rev().map(|&d| d as u32).collect();
            let mut builder = ArrayBuilder {
                memory: &mut self.memory,
                base,
                sizes: &sizes,
                data: indirection_cells(&sizes, 0),
            };
            builder.fill(0, 0);
        }

        self.tracker.push(bytes);
        self.set_raw_cell(self.sp + 4 * (count as u32 - 1), base as Cell);
        self.hp = new_hp as u32;
        self.sp += 4 * (count as u32 - 1);
        Ok(())
    }

    // =========================================================================
    // Floats
    // =========================================================================

    /// `RND_TO_*`: pop a float cell and round it.
    pub fn round_float(&mut self, mode: RoundingMode) -> Result<Cell, ErrorCode> {
        let value = self.pop()?;
        Ok(round_cell(value, mode))
    }

    // =========================================================================
    // Natives and Debugging
    // =========================================================================

    /// Index of the most recently invoked native.
    pub fn last_native(&self) -> Option<u32> {
        self.last_native
    }

    pub(crate) fn set_last_native(&mut self, index: u32) {
        self.last_native = Some(index);
    }

    /// Record an error raised by a native; the first one wins.
    pub fn set_native_fault(&mut self, code: ErrorCode, message: impl Into<String>) {
        if self.native_fault.is_none() {
            self.native_fault = Some(NativeFault {
                code,
                message: message.into(),
            });
        }
    }

    pub fn has_native_fault(&self) -> bool {
        self.native_fault.is_some()
    }

    pub(crate) fn take_native_fault(&mut self) -> Option<NativeFault> {
        self.native_fault.take()
    }

    /// Location of the last `BREAK` reached while debugging.
    pub fn last_break(&self) -> Option<u32> {
        self.last_break
    }

    pub(crate) fn record_break(&mut self, cip: u32) {
        self.last_break = Some(cip);
    }

    // =========================================================================
    // JIT Context Exchange
    // =========================================================================

    /// Build a context over this state for generated code.
    pub(crate) fn jit_context(&mut self, runtime: *mut c_void) -> JitContext {
        let mut ctx = JitContext::new(self.memory.as_mut_ptr(), self.rstk.as_mut_ptr(), runtime);
        ctx.mem_size = self.mem_size;
        ctx.data_size = self.data_size;
        ctx.cip = self.cip;
        self.store_to_jit(&mut ctx);
        ctx
    }

    /// Adopt the cursors generated code left in `ctx`.
    pub(crate) fn load_from_jit(&mut self, ctx: &JitContext) {
        self.hp = ctx.hp;
        self.sp = ctx.sp;
        self.frm = ctx.frm;
        self.rp = ctx.rp;
        self.cip = ctx.cip;
    }

    /// Publish the cursors to generated code.
    pub(crate) fn store_to_jit(&self, ctx: &mut JitContext) {
        ctx.hp = self.hp;
        ctx.sp = self.sp;
        ctx.frm = self.frm;
        ctx.rp = self.rp;
    }
}

// =============================================================================
// Array Generation
// =============================================================================

/// Total cells of an array with the given sizes, innermost first,
/// counting the indirection vectors.
fn array_cells(argv: &[Cell]) -> Result<u32, ErrorCode> {
    let first = argv.first().copied().unwrap_or(0);
    if first <= 0 {
        return Err(ErrorCode::ArrayTooBig);
    }
    let mut cells = first as u32;
    for &dim in &argv[1..] {
        if dim <= 0 {
            return Err(ErrorCode::ArrayTooBig);
        }
        cells = cells
            .checked_mul(dim as u32)
            .and_then(|c| c.checked_add(dim as u32))
            .ok_or(ErrorCode::ArrayTooBig)?;
    }
    Ok(cells)
}

/// Cells of indirection vectors from dimension `dim` down.
fn indirection_cells(sizes: &[u32], dim: usize) -> u32 {
    let mut cells = sizes[dim];
    if dim + 2 < sizes.len() {
        cells = cells.wrapping_add(sizes[dim].wrapping_mul(indirection_cells(sizes, dim + 1)));
    }
    cells
}

/// Writes the indirection vectors of a multi-dimensional array.
///
/// Each vector entry holds the byte distance from itself to the sub-array
/// it indexes. Vectors of the second-to-last dimension point into one
/// contiguous data block.
struct ArrayBuilder<'a> {
    memory: &'a mut [u8],
    base: u32,
    sizes: &'a [u32],
    /// Next free data cell, relative to `base`.
    data: u32,
}

impl ArrayBuilder<'_> {
    fn write(&mut self, cell: u32, value: u32) {
        let at = (self.base + cell * 4) as usize;
        self.memory[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Fill the vector at `offset` for dimension `dim`; returns the next free
    /// vector cell.
    fn fill(&mut self, dim: usize, offset: u32) -> u32 {
        let len = self.sizes[dim];
        let mut write = offset;
        let mut next = offset + len;
        if dim + 2 < self.sizes.len() {
            for _ in 0..len {
                self.write(write, (next - write) * 4);
                write += 1;
                next = self.fill(dim + 1, next);
            }
        } else {
            let stride = self.sizes[dim + 1];
            for _ in 0..len {
                let data = self.data;
                self.write(write, (data - write) * 4);
                write += 1;
                self.data += stride;
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RuntimeState {
        RuntimeState::new(&[1, 0, 0, 0, 2, 0, 0, 0], 1024).unwrap()
    }

    #[test]
    fn test_layout() {
        let st = state();
        assert_eq!(st.data_size(), 8);
        assert_eq!(st.mem_size(), 8 + MIN_FREE_MEMORY);
        assert_eq!(st.hp(), 8);
        assert_eq!(st.sp(), st.mem_size());
        assert_eq!(st.read_cell(4).unwrap(), 2);
    }

    #[test]
    fn test_memory_limit() {
        assert_eq!(
            RuntimeState::new(&[], MAX_MEMORY + 4).unwrap_err(),
            ErrorCode::OutOfMemory
        );
    }

    #[test]
    fn test_gap_is_invalid() {
        let mut st = state();
        st.push(7).unwrap();
        let sp = st.sp();
        assert!(st.is_valid_address(0));
        assert!(!st.is_valid_address(8));
        assert!(!st.is_valid_address(sp - 4));
        assert!(st.is_valid_address(sp));
        assert!(!st.is_valid_address(st.mem_size()));
        assert_eq!(st.read_cell(sp - 4).unwrap_err(), ErrorCode::MemAccess);
        assert_eq!(st.read_cell(sp).unwrap(), 7);
    }

    #[test]
    fn test_push_pop() {
        let mut st = state();
        st.push(1).unwrap();
        st.push(2).unwrap();
        assert_eq!(st.peek(1).unwrap(), 1);
        assert_eq!(st.pop().unwrap(), 2);
        assert_eq!(st.pop().unwrap(), 1);
        assert_eq!(st.pop().unwrap_err(), ErrorCode::StackMin);
    }

    #[test]
    fn test_stack_low() {
        let mut st = state();
        st.sp = st.hp + 4;
        st.push(1).unwrap();
        assert_eq!(st.push(2).unwrap_err(), ErrorCode::StackLow);
    }

    #[test]
    fn test_adjust_stack_bounds() {
        let mut st = state();
        assert_eq!(st.adjust_stack(2).unwrap_err(), ErrorCode::InvalidInstruction);
        assert_eq!(st.adjust_stack(4).unwrap_err(), ErrorCode::StackMin);
        st.adjust_stack(-16).unwrap();
        assert_eq!(st.sp(), st.mem_size() - 16);
        let too_far = -((st.sp() - st.hp()) as Cell);
        assert_eq!(st.adjust_stack(too_far).unwrap_err(), ErrorCode::StackLow);
    }

    #[test]
    fn test_heap_alloc_and_pop() {
        let mut st = state();
        let a = st.heap_alloc(4).unwrap();
        let b = st.heap_alloc(2).unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 24);
        assert_eq!(st.heap_pop(a).unwrap_err(), ErrorCode::InvalidAddress);
        st.heap_pop(b).unwrap();
        st.heap_pop(a).unwrap();
        assert_eq!(st.hp(), 8);
        assert!(st.heap_pop(a).is_err());
    }

    #[test]
    fn test_heap_release_unwinds_tracker() {
        let mut st = state();
        let a = st.heap_alloc(1).unwrap();
        st.heap_alloc(1).unwrap();
        st.heap_alloc(1).unwrap();
        st.heap_release(a).unwrap();
        assert_eq!(st.hp(), a);
        assert_eq!(st.tracker_depth(), 0);
        assert_eq!(st.heap_release(a + 4).unwrap_err(), ErrorCode::InvalidAddress);
    }

    #[test]
    fn test_heap_alloc_respects_margin() {
        let mut st = state();
        let free = (st.sp() - st.hp() - STACK_MARGIN) / 4;
        assert_eq!(st.heap_alloc(free + 1).unwrap_err(), ErrorCode::HeapLow);
        st.heap_alloc(free).unwrap();
    }

    #[test]
    fn test_adjust_heap() {
        let mut st = state();
        assert_eq!(st.adjust_heap(16).unwrap(), 8);
        assert_eq!(st.hp(), 24);
        assert_eq!(st.adjust_heap(-32).unwrap_err(), ErrorCode::HeapMin);
        let over = (st.sp() - st.hp() + 4) as Cell;
        assert_eq!(st.adjust_heap(over).unwrap_err(), ErrorCode::HeapLow);
        assert_eq!(st.hp(), 24);
    }

    #[test]
    fn test_tracker_pop_set_heap() {
        let mut st = state();
        assert_eq!(st.tracker_pop_set_heap().unwrap_err(), ErrorCode::TrackerBounds);
        st.adjust_heap(8).unwrap();
        st.tracker_push(8);
        st.tracker_pop_set_heap().unwrap();
        assert_eq!(st.hp(), 8);
        st.tracker_push(64);
        assert_eq!(st.tracker_pop_set_heap().unwrap_err(), ErrorCode::HeapMin);
    }

    #[test]
    fn test_generate_single_dimension() {
        let mut st = state();
        st.push(3).unwrap();
        st.generate_array(1, true).unwrap();
        assert_eq!(st.pop().unwrap(), 8);
        assert_eq!(st.hp(), 20);
        assert_eq!(st.tracker_depth(), 1);
    }

    #[test]
    fn test_generate_two_dimensions() {
        let mut st = state();
        // int a[2][3]: outer size pushed first, inner size on top.
        st.push(2).unwrap();
        st.push(3).unwrap();
        st.generate_array(2, true).unwrap();
        let base = st.pop().unwrap() as u32;
        assert_eq!(base, 8);
        // 2 vector cells + 6 data cells.
        assert_eq!(st.hp(), 8 + 8 * 4);
        // Vector entries point at rows 0 and 1 of the data block.
        assert_eq!(st.read_cell(base).unwrap(), 8);
        assert_eq!(st.read_cell(base + 4).unwrap(), 16);
    }

    #[test]
    fn test_generate_three_dimensions() {
        let mut st = state();
        st.push(2).unwrap();
        st.push(2).unwrap();
        st.push(2).unwrap();
        st.generate_array(3, false).unwrap();
        let base = st.pop().unwrap() as u32;
        // 2 + 2*2 vector cells, 8 data cells.
        assert_eq!(st.hp() - base, (2 + 4 + 8) * 4);
        // a[1] -> second sub-vector at cell 4.
        let sub = base + 4 + st.read_cell(base + 4).unwrap() as u32;
        assert_eq!(sub, base + 16);
        // a[1][1][0] is data cell 6 of 8.
        let row = sub + 4 + st.read_cell(sub + 4).unwrap() as u32;
        assert_eq!(row, base + (6 + 6) * 4);
    }

    #[test]
    fn test_generate_rejects_bad_sizes() {
        let mut st = state();
        st.push(0).unwrap();
        assert_eq!(st.generate_array(1, false).unwrap_err(), ErrorCode::ArrayTooBig);
        st.poke(0, 0x4000_0000).unwrap();
        assert_eq!(st.generate_array(1, false).unwrap_err(), ErrorCode::ArrayTooBig);
        st.poke(0, 0x1000_0000).unwrap();
        assert_eq!(st.generate_array(1, false).unwrap_err(), ErrorCode::HeapLow);
        assert_eq!(st.generate_array(0, false).unwrap_err(), ErrorCode::InstructionParam);
    }

    #[test]
    fn test_copy_and_fill() {
        let mut st = state();
        let a = st.heap_alloc(2).unwrap();
        let b = st.heap_alloc(2).unwrap();
        st.fill_memory(a, 8, 0x0102_0304).unwrap();
        st.copy_memory(a, b, 8).unwrap();
        assert_eq!(st.read_cell(b + 4).unwrap(), 0x0102_0304);
        assert_eq!(st.copy_memory(a, st.hp(), 4).unwrap_err(), ErrorCode::MemAccess);
        st.fill_memory(b, 2, 0).unwrap();
        assert_eq!(st.read_cell(b).unwrap(), 0x0102_0000);
    }

    #[test]
    fn test_sized_access() {
        let mut st = state();
        st.write_cell(0, -1).unwrap();
        assert_eq!(st.read_sized(0, 1).unwrap(), 0xFF);
        assert_eq!(st.read_sized(0, 2).unwrap(), 0xFFFF);
        assert_eq!(st.read_sized(0, 4).unwrap(), -1);
        st.write_sized(0, 1, 0).unwrap();
        assert_eq!(st.read_cell(0).unwrap(), -256);
        st.write_sized(0, 3, 0).unwrap();
        assert_eq!(st.read_cell(0).unwrap(), -256);
    }

    #[test]
    fn test_strings() {
        let mut st = state();
        let addr = st.heap_alloc(4).unwrap();
        assert_eq!(st.write_string(addr, "hello world", 6).unwrap(), 5);
        assert_eq!(st.read_string(addr).unwrap(), "hello");
    }

    #[test]
    fn test_restore_cursors_unwinds_tracker() {
        let mut st = state();
        let saved = st.save_cursors();
        st.heap_alloc(4).unwrap();
        st.push(1).unwrap();
        st.push_return(12).unwrap();
        st.restore_cursors(saved);
        assert_eq!(st.save_cursors(), saved);
        assert_eq!(st.tracker_depth(), 0);
    }

    #[test]
    fn test_return_stack_bounds() {
        let mut st = state();
        for i in 0..MAX_RETURN_STACK as u32 {
            st.push_return(i * 4).unwrap();
        }
        assert_eq!(st.push_return(0).unwrap_err(), ErrorCode::StackLow);
        assert_eq!(st.call_sites().len(), MAX_RETURN_STACK);
    }

    #[test]
    fn test_native_fault_first_wins() {
        let mut st = state();
        st.set_native_fault(ErrorCode::Native, "first");
        st.set_native_fault(ErrorCode::Param, "second");
        let fault = st.take_native_fault().unwrap();
        assert_eq!(fault.message, "first");
        assert!(!st.has_native_fault());
    }
}
