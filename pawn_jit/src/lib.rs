//! Template JIT for pawn bytecode.
//!
//! Translates one bytecode function at a time into x86-64 machine code:
//! - Label-aware assembler over size-only and writing code sinks
//! - Executable memory owned per compiled function
//! - Two-pass compilation with a dense bytecode to native offset table
//! - Loop-edge patch tables for cooperative timeouts
//! - A reverse native PC to bytecode map for fault attribution
//!
//! The generated code talks to the VM only through a `#[repr(C)]`
//! [`JitContext`] and a table of [`RuntimeHelpers`]; this crate knows
//! nothing about runtimes or natives.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod tier1;

pub use backend::x64::{CodeAllocator, CodeCacheStats};
pub use tier1::{
    compile, CheckMode, CompileOptions, CompiledFunction, EntryFn, JitContext, LoopEdge,
    RuntimeHelpers,
};

/// Whether generated code can run on this target.
///
/// The code generator itself is portable so that images can be sized and
/// inspected anywhere; only System V x86-64 hosts execute the result.
#[inline]
pub const fn is_supported() -> bool {
    cfg!(all(target_arch = "x86_64", unix))
}
