//! # Pawn Core
//!
//! Core types shared by every pawn engine component:
//!
//! - **Cells**: the 4-byte unit of bytecode and guest memory
//! - **Error codes**: the stable error enumeration and its message table
//! - **Opcodes**: the stack-machine instruction set
//! - **Images**: validated bytecode containers with their symbol tables
//! - **Loading**: the SMX container reader and a builder for hand-made images

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod debug;
pub mod error;
pub mod image;
pub mod opcode;
pub mod smx;

pub use builder::{ImageBuilder, Label};
pub use debug::{DebugInfo, FunctionSymbol};
pub use error::{ErrorCode, PawnError, PawnResult};
pub use image::{CodeFlags, Image, NativeInfo, PublicInfo, PubvarInfo};
pub use opcode::{Opcode, PushKind};

/// A signed guest cell.
pub type Cell = i32;

/// An unsigned guest cell.
pub type UCell = u32;

/// Width of a cell in bytes.
pub const CELL_SIZE: u32 = 4;

/// Bytes kept free between heap and stack for native-call setup.
pub const STACK_MARGIN: u32 = 64;

/// Capacity of the return-address stack.
pub const MAX_RETURN_STACK: usize = 1024;

/// Most arguments a host may push before one invocation.
pub const MAX_EXEC_PARAMS: usize = 32;

/// Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reinterpret a cell as an `f32`.
#[inline]
pub fn cell_to_float(cell: Cell) -> f32 {
    f32::from_bits(cell as u32)
}

/// Reinterpret an `f32` as a cell.
#[inline]
pub fn float_to_cell(value: f32) -> Cell {
    value.to_bits() as Cell
}

/// Float-to-integer rounding modes of the `RND_TO_*` opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RoundingMode {
    Nearest = 0,
    Floor = 1,
    Ceil = 2,
    Zero = 3,
}

impl RoundingMode {
    /// Decode the raw mode passed through generated code.
    pub fn from_i32(raw: i32) -> Option<RoundingMode> {
        match raw {
            0 => Some(RoundingMode::Nearest),
            1 => Some(RoundingMode::Floor),
            2 => Some(RoundingMode::Ceil),
            3 => Some(RoundingMode::Zero),
            _ => None,
        }
    }
}

/// Round a float cell to an integer cell.
///
/// Nearest rounds halves up (`floor(x + 0.5)`). Values that do not fit in a
/// cell, and NaN, produce `i32::MIN` like the hardware conversion does.
pub fn round_cell(cell: Cell, mode: RoundingMode) -> Cell {
    let value = cell_to_float(cell);
    let rounded = match mode {
        RoundingMode::Nearest => (value + 0.5).floor(),
        RoundingMode::Floor => value.floor(),
        RoundingMode::Ceil => value.ceil(),
        RoundingMode::Zero => value.trunc(),
    };
    if rounded.is_nan() || rounded < i32::MIN as f32 || rounded >= 2_147_483_648.0 {
        return i32::MIN;
    }
    rounded as Cell
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_cell_modes() {
        let c = float_to_cell(2.5);
        assert_eq!(round_cell(c, RoundingMode::Nearest), 3);
        assert_eq!(round_cell(c, RoundingMode::Floor), 2);
        assert_eq!(round_cell(c, RoundingMode::Ceil), 3);
        assert_eq!(round_cell(float_to_cell(-2.5), RoundingMode::Zero), -2);
        assert_eq!(round_cell(float_to_cell(-2.5), RoundingMode::Nearest), -2);
    }

    #[test]
    fn test_round_cell_out_of_range() {
        assert_eq!(round_cell(float_to_cell(f32::NAN), RoundingMode::Floor), i32::MIN);
        assert_eq!(round_cell(float_to_cell(3.0e9), RoundingMode::Zero), i32::MIN);
        assert_eq!(round_cell(float_to_cell(-3.0e9), RoundingMode::Zero), i32::MIN);
    }

    #[test]
    fn test_float_cell_bits() {
        assert_eq!(float_to_cell(1.0), 0x3F80_0000);
        assert_eq!(cell_to_float(0x3F80_0000), 1.0);
    }
}
