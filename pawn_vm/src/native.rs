//! Native function bindings and the call bridge.
//!
//! A native is a host function the script calls by index. The bridge copies
//! its parameters off the guest stack, calls it, and then verifies the
//! native left the stack and heap pointers where they were. An error the
//! native raised through [`Runtime::throw_native_error`] wins over leak
//! detection.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use pawn_core::{Cell, ErrorCode, Image, PawnError};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::trace;

use crate::runtime::Runtime;

/// A bound host function.
///
/// `params[0]` holds the argument count, the arguments follow.
pub type NativeFn = Arc<dyn Fn(&mut Runtime, &[Cell]) -> Cell + Send + Sync>;

bitflags! {
    /// How a binding behaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NativeFlags: u32 {
        /// The script loads without it; calls fail with `InvalidNative`.
        const OPTIONAL = 1 << 0;
        /// The host may replace or remove the binding at any time.
        const EPHEMERAL = 1 << 1;
    }
}

/// Why a binding could not be changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("native index {index} out of range ({count} natives)")]
    OutOfRange { index: u32, count: usize },

    #[error("image imports no native named `{0}`")]
    NotFound(String),
}

impl From<BindError> for PawnError {
    fn from(err: BindError) -> Self {
        let code = match err {
            BindError::OutOfRange { .. } => ErrorCode::Index,
            BindError::NotFound(_) => ErrorCode::NotFound,
        };
        PawnError::Vm {
            code,
            message: err.to_string(),
        }
    }
}

// =============================================================================
// Native Table
// =============================================================================

/// One imported native and its binding.
#[derive(Clone)]
pub struct NativeEntry {
    name: String,
    func: Option<NativeFn>,
    flags: NativeFlags,
    user_data: usize,
}

impl NativeEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.func.is_some()
    }

    pub fn flags(&self) -> NativeFlags {
        self.flags
    }

    /// Opaque value the host attached to the binding.
    pub fn user_data(&self) -> usize {
        self.user_data
    }
}

impl fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEntry")
            .field("name", &self.name)
            .field("bound", &self.is_bound())
            .field("flags", &self.flags)
            .field("user_data", &self.user_data)
            .finish()
    }
}

/// Per-runtime binding slots, one per native the image imports.
#[derive(Debug, Clone, Default)]
pub struct NativeTable {
    entries: Vec<NativeEntry>,
}

impl NativeTable {
    /// Unbound slots for every native `image` imports.
    pub fn new(image: &Image) -> Self {
        let entries = image
            .natives()
            .iter()
            .map(|n| NativeEntry {
                name: n.name.clone(),
                func: None,
                flags: NativeFlags::empty(),
                user_data: 0,
            })
            .collect();
        NativeTable { entries }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&NativeEntry> {
        self.entries.get(index as usize)
    }

    /// Index of the native named `name`.
    pub fn find(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as u32)
    }

    /// Replace the binding at `index`; `None` unbinds it.
    pub fn bind(
        &mut self,
        index: u32,
        func: Option<NativeFn>,
        flags: NativeFlags,
        user_data: usize,
    ) -> Result<(), BindError> {
        let count = self.entries.len();
        let entry = self
            .entries
            .get_mut(index as usize)
            .ok_or(BindError::OutOfRange { index, count })?;
        entry.func = func;
        entry.flags = flags;
        entry.user_data = user_data;
        Ok(())
    }

    /// Names of required natives that are still unbound.
    pub fn missing(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_bound() && !e.flags.contains(NativeFlags::OPTIONAL))
            .map(|e| e.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &NativeEntry> + '_ {
        self.entries.iter()
    }
}

// =============================================================================
// Call Bridge
// =============================================================================

/// Invoke native `index` with the parameter block at the stack pointer.
///
/// The block is the argument count followed by the arguments. Both
/// executors and the JIT helper come through here.
pub(crate) fn invoke_native(rt: &mut Runtime, index: u32) -> Result<Cell, ErrorCode> {
    let entry = rt.natives.get(index).ok_or(ErrorCode::InstructionParam)?;
    let func = entry.func.clone().ok_or(ErrorCode::InvalidNative)?;

    let argc = u32::try_from(rt.state.peek(0)?).map_err(|_| ErrorCode::Param)?;
    let cells = argc.checked_add(1).ok_or(ErrorCode::Param)?;
    rt.state.check_stack_cells(cells)?;
    let params = (0..cells)
        .map(|i| rt.state.peek(i))
        .collect::<Result<SmallVec<[Cell; 16]>, _>>()?;
    trace!(index, native = entry.name(), argc, "native call");

    rt.state.set_last_native(index);
    let (sp, hp) = (rt.state.sp(), rt.state.hp());
    let result = func(rt, &params);

    if let Some(fault) = rt.state.take_native_fault() {
        rt.set_error_message(fault.message);
        return Err(fault.code);
    }
    if rt.state.sp() != sp {
        rt.set_error_message(format!(
            "native left the stack pointer at {:#x}, expected {:#x}",
            rt.state.sp(),
            sp
        ));
        return Err(ErrorCode::StackLeak);
    }
    if rt.state.hp() != hp {
        rt.set_error_message(format!(
            "native left the heap pointer at {:#x}, expected {:#x}",
            rt.state.hp(),
            hp
        ));
        return Err(ErrorCode::HeapLeak);
    }
    Ok(result)
}
