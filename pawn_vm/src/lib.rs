//! Execution engine for pawn bytecode.
//!
//! Runs validated images either by interpretation or through the template
//! JIT, with identical observable behavior:
//!
//! - **Runtimes**: per-instance guest memory, cursors and native bindings
//! - **Executors**: the interpreter and lazily compiled native code
//! - **Native bridge**: host calls with stack and heap leak detection
//! - **Watchdog**: cooperative timeouts by patching loop edges
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   Environment                    │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────┐  │
//! │  │CodeAllocator │ │ CodeRegistry │◀┤ Watchdog │  │
//! │  └──────────────┘ └──────────────┘ └──────────┘  │
//! ├──────────────────────────────────────────────────┤
//! │  Runtime ─┬─ RuntimeState (memory, sp/hp/frm)    │
//! │           ├─ NativeTable                         │
//! │           └─ Executor ─┬─ Interpreter            │
//! │                        └─ CompiledFunction (JIT) │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pawn_vm::{EngineConfig, Environment};
//!
//! let env = Environment::new(EngineConfig::default());
//! env.install_watchdog_timer(5000);
//! let mut rt = env.load_binary("plugin.smx")?;
//! rt.bind_native("print", |rt, params| {
//!     let text = rt.read_string(params[1] as u32).unwrap_or_default();
//!     println!("{text}");
//!     0
//! })?;
//! let mut f = rt.find_function("OnPluginStart").unwrap();
//! f.push_cell(1)?;
//! let result = f.execute()?;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Engine surface
pub mod backtrace;
pub mod config;
pub mod environment;
pub mod function;
pub mod runtime;

// Execution
pub mod executor;
mod interpreter;
pub mod native;
pub mod state;
pub mod watchdog;

mod jit_bridge;

pub use backtrace::{Backtrace, ErrorListener, ErrorReport, StackFrame};
pub use config::EngineConfig;
pub use environment::{CodeRegistry, CodeStats, Environment};
pub use executor::Executor;
pub use function::Function;
pub use native::{BindError, NativeEntry, NativeFlags, NativeFn, NativeTable};
pub use runtime::Runtime;
pub use state::{Cursors, HeapTracker, RuntimeState};
pub use watchdog::{ExecutionMonitor, WatchdogPhase, WatchdogTimer};

pub use pawn_core::{Cell, ErrorCode, Image, PawnError, PawnResult};
pub use pawn_jit::CheckMode;
