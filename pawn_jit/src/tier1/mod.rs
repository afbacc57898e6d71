//! Template JIT code generation.
//!
//! Every bytecode instruction maps to a small fixed native template. Code is
//! emitted twice: once into a size counter to learn the exact length and the
//! native offset of every bytecode cell, then into the final buffer with all
//! branches resolved from that table.
//!
//! Register assignment inside generated code:
//!
//! | register | role                         |
//! |----------|------------------------------|
//! | `eax`    | PRI                          |
//! | `edx`    | ALT                          |
//! | `r12`    | guest memory base            |
//! | `r13d`   | stack pointer (byte offset)  |
//! | `r14d`   | frame pointer (byte offset)  |
//! | `r15`    | `*mut JitContext`            |
//! | `ecx`, `r8`-`r11` | scratch             |

pub mod codegen;
pub mod context;
pub mod decode;
pub mod template;

pub use codegen::{compile, CompiledFunction, LoopEdge};
pub use context::{
    CallHelper, CheckMode, CompileOptions, ContextHelper, ContextHelper1, ContextHelper2,
    EntryFn, JitContext, RuntimeHelpers,
};
pub use decode::{decode_function, FunctionBody, Instruction};

use crate::backend::x64::Gpr;

/// PRI register.
pub const PRI: Gpr = Gpr::Rax;
/// ALT register.
pub const ALT: Gpr = Gpr::Rdx;
/// Scratch register.
pub const TMP: Gpr = Gpr::Rcx;
/// Second scratch register.
pub const TMP2: Gpr = Gpr::R8;
/// Guest memory base.
pub const MEM: Gpr = Gpr::R12;
/// Guest stack pointer.
pub const STK: Gpr = Gpr::R13;
/// Guest frame pointer.
pub const FRM: Gpr = Gpr::R14;
/// Context pointer.
pub const CTX: Gpr = Gpr::R15;

/// Bytes reserved below the saved registers in every activation.
///
/// `[rsp + 8]` holds the frame pointer at entry and `[rsp + 16]` spills ALT
/// across calls. With six pushes plus the return address this keeps `rsp`
/// 16-byte aligned at helper calls.
pub const SPILL_AREA: i32 = 24;

/// Spill slot for the entry frame pointer.
pub const ENTRY_FRM_SLOT: i32 = 8;

/// Spill slot for ALT across calls.
pub const SAVED_ALT_SLOT: i32 = 16;
