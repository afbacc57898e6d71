//! Execution strategy selection.

use pawn_core::{Cell, ErrorCode};

use crate::runtime::Runtime;
use crate::{interpreter, jit_bridge};

/// How a runtime executes bytecode. Chosen once when the runtime is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    /// Walk the bytecode directly.
    Interpreted,
    /// Compile each function on first use and run native code.
    Jitted,
}

impl Executor {
    /// The JIT when it is enabled and the host can run generated code.
    #[inline]
    pub fn select(jit_enabled: bool) -> Self {
        if jit_enabled && pawn_jit::is_supported() {
            Executor::Jitted
        } else {
            Executor::Interpreted
        }
    }

    /// Run the function whose `PROC` is at `offset` and return PRI.
    ///
    /// Arguments must already be pushed.
    pub(crate) fn run(self, rt: &mut Runtime, offset: u32) -> Result<Cell, ErrorCode> {
        match self {
            Executor::Interpreted => interpreter::execute(rt, offset),
            Executor::Jitted => jit_bridge::execute(rt, offset),
        }
    }

    pub fn is_jitted(self) -> bool {
        self == Executor::Jitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select() {
        assert_eq!(Executor::select(false), Executor::Interpreted);
        let jitted = Executor::select(true);
        assert_eq!(jitted.is_jitted(), pawn_jit::is_supported());
    }
}
