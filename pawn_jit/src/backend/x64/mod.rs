//! x64 backend modules.
//!
//! - `registers`: GPR/XMM definitions and memory operands
//! - `encoder`: Low-level instruction encoding
//! - `assembler`: Label-aware emission over size-only or writing sinks
//! - `memory`: Executable memory allocation and accounting

pub mod assembler;
pub mod encoder;
pub mod memory;
pub mod registers;

pub use assembler::{Assembler, CodeSink, Label, LabelLayout, SizeCounter, SliceWriter};
pub use encoder::{AluOp, Condition, EncodedInst, Mod, Rex, ShiftOp, SseOp, UnaryOp};
pub use memory::{CodeAllocator, CodeCacheStats, ExecutableBuffer};
pub use registers::{Gpr, MemOperand, Scale, Xmm};
