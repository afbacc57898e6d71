//! The ABI shared by generated code and the runtime.
//!
//! Generated code keeps its hot state in registers and spills it into a
//! [`JitContext`] around every helper call. Helpers are plain `extern "C"`
//! functions that receive the context, do their work against the runtime
//! the context points at, and return an error code (zero on success).

use std::ffi::c_void;
use std::mem::offset_of;
use std::sync::atomic::AtomicUsize;

/// Execution state shared between generated code and runtime helpers.
#[repr(C)]
#[derive(Debug)]
pub struct JitContext {
    /// Base of guest memory.
    pub memory: *mut u8,
    /// Base of the return-address stack.
    pub rstk: *mut u32,
    /// Opaque pointer to the owning runtime, for helpers.
    pub runtime: *mut c_void,
    /// Size of addressable guest memory in bytes.
    pub mem_size: u32,
    /// Size of the data segment, the lowest legal heap pointer.
    pub data_size: u32,
    pub hp: u32,
    pub sp: u32,
    pub frm: u32,
    /// Return-address stack depth.
    pub rp: u32,
    pub pri: i32,
    pub alt: i32,
    /// Bytecode offset of the instruction that last left generated code.
    pub cip: u32,
    _pad: u32,
}

impl JitContext {
    /// A context over caller-owned memory and return stack.
    pub fn new(memory: *mut u8, rstk: *mut u32, runtime: *mut c_void) -> Self {
        JitContext {
            memory,
            rstk,
            runtime,
            mem_size: 0,
            data_size: 0,
            hp: 0,
            sp: 0,
            frm: 0,
            rp: 0,
            pri: 0,
            alt: 0,
            cip: 0,
            _pad: 0,
        }
    }
}

/// Field offsets used by the templates.
pub mod offsets {
    use super::*;

    pub const MEMORY: i32 = offset_of!(JitContext, memory) as i32;
    pub const RSTK: i32 = offset_of!(JitContext, rstk) as i32;
    pub const MEM_SIZE: i32 = offset_of!(JitContext, mem_size) as i32;
    pub const DATA_SIZE: i32 = offset_of!(JitContext, data_size) as i32;
    pub const HP: i32 = offset_of!(JitContext, hp) as i32;
    pub const SP: i32 = offset_of!(JitContext, sp) as i32;
    pub const FRM: i32 = offset_of!(JitContext, frm) as i32;
    pub const RP: i32 = offset_of!(JitContext, rp) as i32;
    pub const PRI: i32 = offset_of!(JitContext, pri) as i32;
    pub const ALT: i32 = offset_of!(JitContext, alt) as i32;
    pub const CIP: i32 = offset_of!(JitContext, cip) as i32;
}

/// Entry point of a compiled function.
///
/// The context must describe a frame positioned just before the function's
/// `PROC`: arguments and their count pushed, return slot reserved. On
/// success PRI, ALT and the cursors are written back into the context.
pub type EntryFn = unsafe extern "C" fn(*mut JitContext) -> i32;

/// A helper taking only the context.
pub type ContextHelper = unsafe extern "C" fn(*mut JitContext) -> i32;
/// A helper taking one immediate.
pub type ContextHelper1 = unsafe extern "C" fn(*mut JitContext, i32) -> i32;
/// A helper taking two immediates.
pub type ContextHelper2 = unsafe extern "C" fn(*mut JitContext, i32, i32) -> i32;
/// The lazy-compile helper reached through a call thunk.
///
/// Receives the target bytecode offset and the call slot to patch with the
/// target's entry point; runs the target and returns its status.
pub type CallHelper = unsafe extern "C" fn(*mut JitContext, u32, *const AtomicUsize) -> i32;

/// Runtime entry points generated code calls out to.
///
/// Every helper reads its inputs from the context, writes results back into
/// it (PRI in `pri`) and returns an error code.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHelpers {
    /// Invoke native `index` with its parameters at `sp`.
    pub invoke_native: ContextHelper1,
    /// Compile or look up a callee, patch the call slot and run it.
    pub compile_call: CallHelper,
    /// Reached from a patched loop edge.
    pub timeout: ContextHelper,
    /// `GENARRAY[.Z] dims`; the second argument is nonzero for `.Z`.
    pub generate_array: ContextHelper2,
    /// Push a byte count onto the heap tracker.
    pub tracker_push: ContextHelper1,
    /// Pop the heap tracker and lower the heap pointer.
    pub tracker_pop: ContextHelper,
    /// Copy `n` bytes from `[pri]` to `[alt]`.
    pub copy_memory: ContextHelper1,
    /// Fill `n` bytes at `[alt]` with PRI.
    pub fill_memory: ContextHelper1,
    /// Pop a float cell and round it with the given mode into PRI.
    pub round_float: ContextHelper1,
    /// Record a `BREAK` location.
    pub debug_break: ContextHelper,
}

/// Where compiled checks put their failure paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckMode {
    /// Each check carries its own error exit.
    #[default]
    Inline,
    /// Checks branch once to a per-site stub that jumps to a shared
    /// trampoline for the error code.
    OutOfLine,
}

/// Compilation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileOptions {
    pub check_mode: CheckMode,
    /// Call the debug hook at every `BREAK`.
    pub debug: bool,
}
