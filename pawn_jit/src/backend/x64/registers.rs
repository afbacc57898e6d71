//! x64 register definitions and memory operands.

// =============================================================================
// General Purpose Registers
// =============================================================================

/// x64 general purpose registers, numbered by their hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Full 4-bit encoding.
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low three bits, as placed in ModRM/SIB fields.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self as u8 & 0b111
    }

    /// Whether the register needs a REX extension bit.
    #[inline(always)]
    pub const fn is_extended(self) -> bool {
        self as u8 >= 8
    }

    /// Registers the System V ABI requires a callee to preserve.
    pub const CALLEE_SAVED: [Gpr; 6] = [Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];
}

// =============================================================================
// SSE Registers
// =============================================================================

/// SSE registers used for scalar float operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

impl Xmm {
    /// Hardware encoding.
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// Memory Operands
// =============================================================================

/// Index scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    S1 = 0,
    S2 = 1,
    S4 = 2,
    S8 = 3,
}

/// A `[base + index*scale + disp]` memory operand.
///
/// Operands always encode with a 32-bit displacement so that an
/// instruction's length never depends on the displacement value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Gpr,
    pub index: Option<(Gpr, Scale)>,
    pub disp: i32,
}

impl MemOperand {
    /// `[base]`
    #[inline]
    pub const fn base(base: Gpr) -> Self {
        MemOperand {
            base,
            index: None,
            disp: 0,
        }
    }

    /// `[base + disp]`
    #[inline]
    pub const fn base_disp(base: Gpr, disp: i32) -> Self {
        MemOperand {
            base,
            index: None,
            disp,
        }
    }

    /// `[base + index*scale + disp]`
    #[inline]
    pub const fn indexed(base: Gpr, index: Gpr, scale: Scale, disp: i32) -> Self {
        MemOperand {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_encoding() {
        assert_eq!(Gpr::Rax.encoding(), 0);
        assert_eq!(Gpr::R12.low_bits(), 4);
        assert!(Gpr::R13.is_extended());
        assert!(!Gpr::Rdi.is_extended());
    }

    #[test]
    fn test_mem_operand_constructors() {
        let m = MemOperand::indexed(Gpr::R12, Gpr::R13, Scale::S1, 8);
        assert_eq!(m.index, Some((Gpr::R13, Scale::S1)));
        assert_eq!(MemOperand::base(Gpr::Rax).disp, 0);
    }
}
