//! x64 instruction encoder.
//!
//! Encodes the subset of the x64 instruction set the template compiler
//! emits. Every function returns an [`EncodedInst`]; lengths depend only on
//! the registers involved, never on immediate or displacement values, which
//! is what lets the sizing pass predict the emitting pass exactly.

use super::registers::{Gpr, MemOperand, Xmm};

// =============================================================================
// Condition Codes
// =============================================================================

/// x64 condition codes, numbered as in the `Jcc`/`SETcc` opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,
    NoOverflow = 0x1,
    /// Unsigned less than (CF == 1)
    Below = 0x2,
    /// Unsigned greater or equal (CF == 0)
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    /// Unsigned less or equal
    BelowEqual = 0x6,
    /// Unsigned greater than
    Above = 0x7,
    Sign = 0x8,
    NotSign = 0x9,
    Parity = 0xA,
    NoParity = 0xB,
    /// Signed less than
    Less = 0xC,
    /// Signed greater or equal
    GreaterEqual = 0xD,
    /// Signed less or equal
    LessEqual = 0xE,
    /// Signed greater than
    Greater = 0xF,
}

impl Condition {
    const ALL: [Condition; 16] = [
        Condition::Overflow,
        Condition::NoOverflow,
        Condition::Below,
        Condition::AboveEqual,
        Condition::Equal,
        Condition::NotEqual,
        Condition::BelowEqual,
        Condition::Above,
        Condition::Sign,
        Condition::NotSign,
        Condition::Parity,
        Condition::NoParity,
        Condition::Less,
        Condition::GreaterEqual,
        Condition::LessEqual,
        Condition::Greater,
    ];

    /// The 4-bit encoding.
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// The logically opposite condition.
    #[inline]
    pub const fn invert(self) -> Self {
        Self::ALL[(self as u8 ^ 1) as usize]
    }
}

// =============================================================================
// Operation Families
// =============================================================================

/// Two-operand integer ALU operations (`/digit` in the 0x81 group).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift operations (`/digit` in the 0xC1/0xD3 groups).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Single-operand operations in the 0xF7 group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnaryOp {
    Not = 2,
    Neg = 3,
    /// Unsigned `edx:eax = eax * r`
    Mul = 4,
    /// Unsigned `eax, edx = edx:eax / r`
    Div = 6,
    /// Signed `eax, edx = edx:eax / r`
    Idiv = 7,
}

/// Scalar single-precision SSE operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SseOp {
    Add = 0x58,
    Mul = 0x59,
    Sub = 0x5C,
    Div = 0x5E,
}

// =============================================================================
// Encoded Instruction
// =============================================================================

/// An encoded instruction (at most 15 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedInst {
    bytes: [u8; 15],
    len: u8,
}

impl EncodedInst {
    #[inline]
    const fn new() -> Self {
        EncodedInst {
            bytes: [0; 15],
            len: 0,
        }
    }

    #[inline]
    fn push(&mut self, byte: u8) {
        self.bytes[self.len as usize] = byte;
        self.len += 1;
    }

    #[inline]
    fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    /// The encoded bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Encoded length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether nothing was encoded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// =============================================================================
// Prefixes and ModRM
// =============================================================================

/// REX prefix fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    /// The prefix byte.
    #[inline]
    pub const fn byte(self) -> u8 {
        0x40 | (self.w as u8) << 3 | (self.r as u8) << 2 | (self.x as u8) << 1 | self.b as u8
    }

    /// Whether any bit is set, i.e. whether the prefix must be emitted.
    #[inline]
    pub const fn is_needed(self) -> bool {
        self.w || self.r || self.x || self.b
    }
}

/// ModRM addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mod {
    Indirect = 0b00,
    Disp8 = 0b01,
    Disp32 = 0b10,
    Direct = 0b11,
}

#[inline]
const fn modrm(md: Mod, reg: u8, rm: u8) -> u8 {
    (md as u8) << 6 | (reg & 7) << 3 | (rm & 7)
}

/// The r/m side of a ModRM-encoded instruction.
#[derive(Debug, Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem(MemOperand),
}

/// Encode `prefix* REX? opcode ModRM SIB? disp32?`.
fn encode_modrm(prefix: &[u8], w: bool, opcode: &[u8], reg: u8, rm: Rm) -> EncodedInst {
    let mut inst = EncodedInst::new();
    inst.extend(prefix);

    let (x, b) = match rm {
        Rm::Reg(r) => (false, r >= 8),
        Rm::Mem(m) => (
            m.index.is_some_and(|(i, _)| i.is_extended()),
            m.base.is_extended(),
        ),
    };
    let rex = Rex {
        w,
        r: reg >= 8,
        x,
        b,
    };
    if rex.is_needed() {
        inst.push(rex.byte());
    }
    inst.extend(opcode);

    match rm {
        Rm::Reg(r) => inst.push(modrm(Mod::Direct, reg, r)),
        Rm::Mem(m) => {
            if m.index.is_some() || m.base.low_bits() == 0b100 {
                inst.push(modrm(Mod::Disp32, reg, 0b100));
                let (index, scale) = match m.index {
                    Some((i, s)) => {
                        debug_assert_ne!(i, Gpr::Rsp, "rsp cannot be an index");
                        (i.low_bits(), s as u8)
                    }
                    None => (0b100, 0),
                };
                inst.push(scale << 6 | index << 3 | m.base.low_bits());
            } else {
                inst.push(modrm(Mod::Disp32, reg, m.base.low_bits()));
            }
            inst.extend(&m.disp.to_le_bytes());
        }
    }
    inst
}

#[inline]
fn with_imm32(mut inst: EncodedInst, imm: i32) -> EncodedInst {
    inst.extend(&imm.to_le_bytes());
    inst
}

#[inline]
fn byte_reg(r: Gpr) -> u8 {
    debug_assert!(
        r.encoding() < 4,
        "byte access is limited to al, cl, dl and bl"
    );
    r.encoding()
}

// =============================================================================
// Data Movement
// =============================================================================

/// `mov dst32, src32`
pub fn mov_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x89], src.encoding(), Rm::Reg(dst.encoding()))
}

/// `mov dst64, src64`
pub fn mov_rr64(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_modrm(&[], true, &[0x89], src.encoding(), Rm::Reg(dst.encoding()))
}

/// `mov dst32, imm32`
pub fn mov_ri(dst: Gpr, imm: i32) -> EncodedInst {
    let mut inst = EncodedInst::new();
    if dst.is_extended() {
        inst.push(Rex {
            b: true,
            ..Rex::default()
        }
        .byte());
    }
    inst.push(0xB8 + dst.low_bits());
    with_imm32(inst, imm)
}

/// `mov dst64, imm64` (always the 10-byte form)
pub fn mov_ri64(dst: Gpr, imm: u64) -> EncodedInst {
    let mut inst = EncodedInst::new();
    inst.push(
        Rex {
            w: true,
            b: dst.is_extended(),
            ..Rex::default()
        }
        .byte(),
    );
    inst.push(0xB8 + dst.low_bits());
    inst.extend(&imm.to_le_bytes());
    inst
}

/// `mov dst32, [mem]`
pub fn mov_rm(dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(&[], false, &[0x8B], dst.encoding(), Rm::Mem(mem))
}

/// `mov dst64, [mem]`
pub fn mov_rm64(dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(&[], true, &[0x8B], dst.encoding(), Rm::Mem(mem))
}

/// `mov [mem], src32`
pub fn mov_mr(mem: MemOperand, src: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x89], src.encoding(), Rm::Mem(mem))
}

/// `mov [mem], src64`
pub fn mov_mr64(mem: MemOperand, src: Gpr) -> EncodedInst {
    encode_modrm(&[], true, &[0x89], src.encoding(), Rm::Mem(mem))
}

/// `mov dword [mem], imm32`
pub fn mov_mi(mem: MemOperand, imm: i32) -> EncodedInst {
    with_imm32(encode_modrm(&[], false, &[0xC7], 0, Rm::Mem(mem)), imm)
}

/// `mov byte [mem], src8`
pub fn mov_m8r(mem: MemOperand, src: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x88], byte_reg(src), Rm::Mem(mem))
}

/// `mov word [mem], src16`
pub fn mov_m16r(mem: MemOperand, src: Gpr) -> EncodedInst {
    encode_modrm(&[0x66], false, &[0x89], src.encoding(), Rm::Mem(mem))
}

/// `movzx dst32, byte [mem]`
pub fn movzx_rm8(dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(&[], false, &[0x0F, 0xB6], dst.encoding(), Rm::Mem(mem))
}

/// `movzx dst32, word [mem]`
pub fn movzx_rm16(dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(&[], false, &[0x0F, 0xB7], dst.encoding(), Rm::Mem(mem))
}

/// `movzx dst32, src8`
pub fn movzx_rr8(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x0F, 0xB6], dst.encoding(), Rm::Reg(byte_reg(src)))
}

/// `movsx dst32, src8`
pub fn movsx_rr8(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x0F, 0xBE], dst.encoding(), Rm::Reg(byte_reg(src)))
}

/// `lea dst32, [mem]`
pub fn lea(dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(&[], false, &[0x8D], dst.encoding(), Rm::Mem(mem))
}

/// `lea dst64, [mem]`
pub fn lea64(dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(&[], true, &[0x8D], dst.encoding(), Rm::Mem(mem))
}

/// `xchg a32, b32`
pub fn xchg_rr(a: Gpr, b: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x87], b.encoding(), Rm::Reg(a.encoding()))
}

/// `push r64`
pub fn push(reg: Gpr) -> EncodedInst {
    let mut inst = EncodedInst::new();
    if reg.is_extended() {
        inst.push(0x41);
    }
    inst.push(0x50 + reg.low_bits());
    inst
}

/// `pop r64`
pub fn pop(reg: Gpr) -> EncodedInst {
    let mut inst = EncodedInst::new();
    if reg.is_extended() {
        inst.push(0x41);
    }
    inst.push(0x58 + reg.low_bits());
    inst
}

// =============================================================================
// Arithmetic
// =============================================================================

/// `op dst32, src32`
pub fn alu_rr(op: AluOp, dst: Gpr, src: Gpr) -> EncodedInst {
    encode_modrm(
        &[],
        false,
        &[(op as u8) << 3 | 0x01],
        src.encoding(),
        Rm::Reg(dst.encoding()),
    )
}

/// `op dst64, src64`
pub fn alu_rr64(op: AluOp, dst: Gpr, src: Gpr) -> EncodedInst {
    encode_modrm(
        &[],
        true,
        &[(op as u8) << 3 | 0x01],
        src.encoding(),
        Rm::Reg(dst.encoding()),
    )
}

/// `op dst32, [mem]`
pub fn alu_rm(op: AluOp, dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(
        &[],
        false,
        &[(op as u8) << 3 | 0x03],
        dst.encoding(),
        Rm::Mem(mem),
    )
}

/// `op dst64, [mem]`
pub fn alu_rm64(op: AluOp, dst: Gpr, mem: MemOperand) -> EncodedInst {
    encode_modrm(
        &[],
        true,
        &[(op as u8) << 3 | 0x03],
        dst.encoding(),
        Rm::Mem(mem),
    )
}

/// `op dst32, imm32` (always the 0x81 form)
pub fn alu_ri(op: AluOp, dst: Gpr, imm: i32) -> EncodedInst {
    with_imm32(
        encode_modrm(&[], false, &[0x81], op as u8, Rm::Reg(dst.encoding())),
        imm,
    )
}

/// `op dst64, imm32` sign-extended
pub fn alu_ri64(op: AluOp, dst: Gpr, imm: i32) -> EncodedInst {
    with_imm32(
        encode_modrm(&[], true, &[0x81], op as u8, Rm::Reg(dst.encoding())),
        imm,
    )
}

/// `op dword [mem], imm32`
pub fn alu_mi(op: AluOp, mem: MemOperand, imm: i32) -> EncodedInst {
    with_imm32(encode_modrm(&[], false, &[0x81], op as u8, Rm::Mem(mem)), imm)
}

/// `test a32, b32`
pub fn test_rr(a: Gpr, b: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x85], b.encoding(), Rm::Reg(a.encoding()))
}

/// `imul dst32, src32`
pub fn imul_rr(dst: Gpr, src: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0x0F, 0xAF], dst.encoding(), Rm::Reg(src.encoding()))
}

/// `imul dst32, src32, imm32`
pub fn imul_rri(dst: Gpr, src: Gpr, imm: i32) -> EncodedInst {
    with_imm32(
        encode_modrm(&[], false, &[0x69], dst.encoding(), Rm::Reg(src.encoding())),
        imm,
    )
}

/// Group 3 operations on a 32-bit register.
pub fn unary(op: UnaryOp, reg: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0xF7], op as u8, Rm::Reg(reg.encoding()))
}

/// `cdq`
pub fn cdq() -> EncodedInst {
    let mut inst = EncodedInst::new();
    inst.push(0x99);
    inst
}

/// `op reg32, cl`
pub fn shift_cl(op: ShiftOp, reg: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0xD3], op as u8, Rm::Reg(reg.encoding()))
}

/// `op reg32, imm8`
pub fn shift_ri(op: ShiftOp, reg: Gpr, imm: u8) -> EncodedInst {
    let mut inst = encode_modrm(&[], false, &[0xC1], op as u8, Rm::Reg(reg.encoding()));
    inst.push(imm);
    inst
}

/// `setcc reg8`
pub fn setcc(cond: Condition, reg: Gpr) -> EncodedInst {
    encode_modrm(
        &[],
        false,
        &[0x0F, 0x90 + cond.encoding()],
        0,
        Rm::Reg(byte_reg(reg)),
    )
}

// =============================================================================
// Control Flow
// =============================================================================

/// `jmp rel32`
pub fn jmp_rel32(rel: i32) -> EncodedInst {
    let mut inst = EncodedInst::new();
    inst.push(0xE9);
    with_imm32(inst, rel)
}

/// `jcc rel32`
pub fn jcc_rel32(cond: Condition, rel: i32) -> EncodedInst {
    let mut inst = EncodedInst::new();
    inst.extend(&[0x0F, 0x80 + cond.encoding()]);
    with_imm32(inst, rel)
}

/// `call reg64`
pub fn call_r(reg: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0xFF], 2, Rm::Reg(reg.encoding()))
}

/// `call qword [mem]`
pub fn call_m(mem: MemOperand) -> EncodedInst {
    encode_modrm(&[], false, &[0xFF], 2, Rm::Mem(mem))
}

/// `jmp reg64`
pub fn jmp_r(reg: Gpr) -> EncodedInst {
    encode_modrm(&[], false, &[0xFF], 4, Rm::Reg(reg.encoding()))
}

/// Single-byte instructions.
pub fn single(byte: u8) -> EncodedInst {
    let mut inst = EncodedInst::new();
    inst.push(byte);
    inst
}

/// `ud2`
pub fn ud2() -> EncodedInst {
    let mut inst = EncodedInst::new();
    inst.extend(&[0x0F, 0x0B]);
    inst
}

pub const RET: u8 = 0xC3;
pub const NOP: u8 = 0x90;
pub const INT3: u8 = 0xCC;

// =============================================================================
// SSE
// =============================================================================

/// `movd xmm, r32`
pub fn movd_xr(dst: Xmm, src: Gpr) -> EncodedInst {
    encode_modrm(&[0x66], false, &[0x0F, 0x6E], dst.encoding(), Rm::Reg(src.encoding()))
}

/// `movd r32, xmm`
pub fn movd_rx(dst: Gpr, src: Xmm) -> EncodedInst {
    encode_modrm(&[0x66], false, &[0x0F, 0x7E], src.encoding(), Rm::Reg(dst.encoding()))
}

/// `movd xmm, dword [mem]`
pub fn movd_xm(dst: Xmm, mem: MemOperand) -> EncodedInst {
    encode_modrm(&[0x66], false, &[0x0F, 0x6E], dst.encoding(), Rm::Mem(mem))
}

/// Scalar single arithmetic, `op dst, src`.
pub fn sse_ss(op: SseOp, dst: Xmm, src: Xmm) -> EncodedInst {
    encode_modrm(&[0xF3], false, &[0x0F, op as u8], dst.encoding(), Rm::Reg(src.encoding()))
}

/// `ucomiss a, b`
pub fn ucomiss(a: Xmm, b: Xmm) -> EncodedInst {
    encode_modrm(&[], false, &[0x0F, 0x2E], a.encoding(), Rm::Reg(b.encoding()))
}

/// `cvtsi2ss xmm, r32`
pub fn cvtsi2ss(dst: Xmm, src: Gpr) -> EncodedInst {
    encode_modrm(&[0xF3], false, &[0x0F, 0x2A], dst.encoding(), Rm::Reg(src.encoding()))
}
