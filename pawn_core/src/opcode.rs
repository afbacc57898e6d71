//! The bytecode instruction set.
//!
//! Instructions are a sequence of 4-byte cells: one opcode cell followed by
//! zero or more operand cells. Numbering is fixed by the container format and
//! must match the compiler that produced the image.

use crate::Cell;

macro_rules! define_opcodes {
    ($(($variant:ident, $name:literal, $operands:expr)),* $(,)?) => {
        /// A bytecode opcode.
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        const OPCODE_TABLE: &[(Opcode, &str, i8)] = &[
            $((Opcode::$variant, $name, $operands),)*
        ];
    };
}

// Operand count -1 marks instructions with a variable-length payload.
define_opcodes! {
    (None, "none", 0),
    (LoadPri, "load.pri", 1),
    (LoadAlt, "load.alt", 1),
    (LoadSPri, "load.s.pri", 1),
    (LoadSAlt, "load.s.alt", 1),
    (LrefPri, "lref.pri", 1),
    (LrefAlt, "lref.alt", 1),
    (LrefSPri, "lref.s.pri", 1),
    (LrefSAlt, "lref.s.alt", 1),
    (LoadI, "load.i", 0),
    (LodbI, "lodb.i", 1),
    (ConstPri, "const.pri", 1),
    (ConstAlt, "const.alt", 1),
    (AddrPri, "addr.pri", 1),
    (AddrAlt, "addr.alt", 1),
    (StorPri, "stor.pri", 1),
    (StorAlt, "stor.alt", 1),
    (StorSPri, "stor.s.pri", 1),
    (StorSAlt, "stor.s.alt", 1),
    (SrefPri, "sref.pri", 1),
    (SrefAlt, "sref.alt", 1),
    (SrefSPri, "sref.s.pri", 1),
    (SrefSAlt, "sref.s.alt", 1),
    (StorI, "stor.i", 0),
    (StrbI, "strb.i", 1),
    (Lidx, "lidx", 0),
    (LidxB, "lidx.b", 1),
    (Idxaddr, "idxaddr", 0),
    (IdxaddrB, "idxaddr.b", 1),
    (AlignPri, "align.pri", 1),
    (AlignAlt, "align.alt", 1),
    (Lctrl, "lctrl", 1),
    (Sctrl, "sctrl", 1),
    (MovePri, "move.pri", 0),
    (MoveAlt, "move.alt", 0),
    (Xchg, "xchg", 0),
    (PushPri, "push.pri", 0),
    (PushAlt, "push.alt", 0),
    (PushR, "push.r", 1),
    (PushC, "push.c", 1),
    (Push, "push", 1),
    (PushS, "push.s", 1),
    (PopPri, "pop.pri", 0),
    (PopAlt, "pop.alt", 0),
    (Stack, "stack", 1),
    (Heap, "heap", 1),
    (Proc, "proc", 0),
    (Ret, "ret", 0),
    (Retn, "retn", 0),
    (Call, "call", 1),
    (CallPri, "call.pri", 0),
    (Jump, "jump", 1),
    (Jrel, "jrel", 1),
    (Jzer, "jzer", 1),
    (Jnz, "jnz", 1),
    (Jeq, "jeq", 1),
    (Jneq, "jneq", 1),
    (Jless, "jless", 1),
    (Jleq, "jleq", 1),
    (Jgrtr, "jgrtr", 1),
    (Jgeq, "jgeq", 1),
    (Jsless, "jsless", 1),
    (Jsleq, "jsleq", 1),
    (Jsgrtr, "jsgrtr", 1),
    (Jsgeq, "jsgeq", 1),
    (Shl, "shl", 0),
    (Shr, "shr", 0),
    (Sshr, "sshr", 0),
    (ShlCPri, "shl.c.pri", 1),
    (ShlCAlt, "shl.c.alt", 1),
    (ShrCPri, "shr.c.pri", 1),
    (ShrCAlt, "shr.c.alt", 1),
    (Smul, "smul", 0),
    (Sdiv, "sdiv", 0),
    (SdivAlt, "sdiv.alt", 0),
    (Umul, "umul", 0),
    (Udiv, "udiv", 0),
    (UdivAlt, "udiv.alt", 0),
    (Add, "add", 0),
    (Sub, "sub", 0),
    (SubAlt, "sub.alt", 0),
    (And, "and", 0),
    (Or, "or", 0),
    (Xor, "xor", 0),
    (Not, "not", 0),
    (Neg, "neg", 0),
    (Invert, "invert", 0),
    (AddC, "add.c", 1),
    (SmulC, "smul.c", 1),
    (ZeroPri, "zero.pri", 0),
    (ZeroAlt, "zero.alt", 0),
    (Zero, "zero", 1),
    (ZeroS, "zero.s", 1),
    (SignPri, "sign.pri", 0),
    (SignAlt, "sign.alt", 0),
    (Eq, "eq", 0),
    (Neq, "neq", 0),
    (Less, "less", 0),
    (Leq, "leq", 0),
    (Grtr, "grtr", 0),
    (Geq, "geq", 0),
    (Sless, "sless", 0),
    (Sleq, "sleq", 0),
    (Sgrtr, "sgrtr", 0),
    (Sgeq, "sgeq", 0),
    (EqCPri, "eq.c.pri", 1),
    (EqCAlt, "eq.c.alt", 1),
    (IncPri, "inc.pri", 0),
    (IncAlt, "inc.alt", 0),
    (Inc, "inc", 1),
    (IncS, "inc.s", 1),
    (IncI, "inc.i", 0),
    (DecPri, "dec.pri", 0),
    (DecAlt, "dec.alt", 0),
    (Dec, "dec", 1),
    (DecS, "dec.s", 1),
    (DecI, "dec.i", 0),
    (Movs, "movs", 1),
    (Cmps, "cmps", 1),
    (Fill, "fill", 1),
    (Halt, "halt", 1),
    (Bounds, "bounds", 1),
    (SysreqPri, "sysreq.pri", 0),
    (SysreqC, "sysreq.c", 1),
    (File, "file", -1),
    (Line, "line", 2),
    (Symbol, "symbol", -1),
    (Srange, "srange", 2),
    (JumpPri, "jump.pri", 0),
    (Switch, "switch", 1),
    (Casetbl, "casetbl", -1),
    (SwapPri, "swap.pri", 0),
    (SwapAlt, "swap.alt", 0),
    (PushAdr, "push.adr", 1),
    (Nop, "nop", 0),
    (SysreqN, "sysreq.n", 2),
    (Symtag, "symtag", 1),
    (Break, "break", 0),
    (Push2C, "push2.c", 2),
    (Push2, "push2", 2),
    (Push2S, "push2.s", 2),
    (Push2Adr, "push2.adr", 2),
    (Push3C, "push3.c", 3),
    (Push3, "push3", 3),
    (Push3S, "push3.s", 3),
    (Push3Adr, "push3.adr", 3),
    (Push4C, "push4.c", 4),
    (Push4, "push4", 4),
    (Push4S, "push4.s", 4),
    (Push4Adr, "push4.adr", 4),
    (Push5C, "push5.c", 5),
    (Push5, "push5", 5),
    (Push5S, "push5.s", 5),
    (Push5Adr, "push5.adr", 5),
    (LoadBoth, "load.both", 2),
    (LoadSBoth, "load.s.both", 2),
    (Const, "const", 2),
    (ConstS, "const.s", 2),
    (SysreqD, "sysreq.d", 1),
    (SysreqNd, "sysreq.nd", 2),
    (TrackerPushC, "tracker.push.c", 1),
    (TrackerPopSetheap, "tracker.pop.setheap", 0),
    (Genarray, "genarray", 1),
    (GenarrayZ, "genarray.z", 1),
    (StradjustPri, "stradjust.pri", 0),
    (Stackadjust, "stackadjust", 1),
    (Fabs, "fabs", 0),
    (Float, "float", 0),
    (FloatAdd, "float.add", 0),
    (FloatSub, "float.sub", 0),
    (FloatMul, "float.mul", 0),
    (FloatDiv, "float.div", 0),
    (RndToNearest, "round.nearest", 0),
    (RndToFloor, "round.floor", 0),
    (RndToCeil, "round.ceil", 0),
    (RndToZero, "round.zero", 0),
    (FloatCmp, "float.cmp", 0),
}

/// Number of defined opcodes.
pub const NUM_OPCODES: usize = OPCODE_TABLE.len();

/// Which family a `PUSHn` opcode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// Push constants.
    Const,
    /// Push cells loaded from global addresses.
    Global,
    /// Push cells loaded from frame-relative addresses.
    Frame,
    /// Push frame-relative addresses.
    Address,
}

impl Opcode {
    /// Decode a raw opcode cell.
    #[inline]
    pub fn from_cell(cell: Cell) -> Option<Opcode> {
        let idx = usize::try_from(cell).ok()?;
        OPCODE_TABLE.get(idx).map(|entry| entry.0)
    }

    /// Assembler mnemonic.
    pub fn name(self) -> &'static str {
        OPCODE_TABLE[self as usize].1
    }

    /// Number of operand cells, or `None` for variable-length payloads.
    pub fn operand_count(self) -> Option<usize> {
        match OPCODE_TABLE[self as usize].2 {
            n if n >= 0 => Some(n as usize),
            _ => None,
        }
    }

    /// Legacy and debug-only opcodes neither executor implements.
    pub fn is_unsupported(self) -> bool {
        matches!(
            self,
            Opcode::None
                | Opcode::AlignPri
                | Opcode::AlignAlt
                | Opcode::Lctrl
                | Opcode::Sctrl
                | Opcode::PushR
                | Opcode::Ret
                | Opcode::CallPri
                | Opcode::Jrel
                | Opcode::Cmps
                | Opcode::SysreqPri
                | Opcode::File
                | Opcode::Line
                | Opcode::Symbol
                | Opcode::Srange
                | Opcode::JumpPri
                | Opcode::Symtag
                | Opcode::SysreqD
                | Opcode::SysreqNd
        )
    }

    /// Whether the single operand is a code address to branch to.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::Jzer
                | Opcode::Jnz
                | Opcode::Jeq
                | Opcode::Jneq
                | Opcode::Jless
                | Opcode::Jleq
                | Opcode::Jgrtr
                | Opcode::Jgeq
                | Opcode::Jsless
                | Opcode::Jsleq
                | Opcode::Jsgrtr
                | Opcode::Jsgeq
        )
    }

    /// Decode the `PUSH.x` / `PUSHn.x` families into (kind, count).
    pub fn push_shape(self) -> Option<(PushKind, usize)> {
        let single = match self {
            Opcode::PushC => Some(PushKind::Const),
            Opcode::Push => Some(PushKind::Global),
            Opcode::PushS => Some(PushKind::Frame),
            Opcode::PushAdr => Some(PushKind::Address),
            _ => None,
        };
        if let Some(kind) = single {
            return Some((kind, 1));
        }

        let op = self as u32;
        let first = Opcode::Push2C as u32;
        let last = Opcode::Push5Adr as u32;
        if op < first || op > last {
            return None;
        }
        let rel = op - first;
        let kind = match rel % 4 {
            0 => PushKind::Const,
            1 => PushKind::Global,
            2 => PushKind::Frame,
            _ => PushKind::Address,
        };
        Some((kind, (rel / 4) as usize + 2))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Length in cells of the `CASETBL` payload starting at `ncases`.
#[inline]
pub fn casetbl_cells(ncases: u32) -> usize {
    ncases as usize * 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbering_is_stable() {
        assert_eq!(Opcode::None as u32, 0);
        assert_eq!(Opcode::LoadPri as u32, 1);
        assert_eq!(Opcode::Proc as u32, 46);
        assert_eq!(Opcode::Retn as u32, 48);
        assert_eq!(Opcode::Call as u32, 49);
        assert_eq!(Opcode::Add as u32, 78);
        assert_eq!(Opcode::Halt as u32, 120);
        assert_eq!(Opcode::SysreqC as u32, 123);
        assert_eq!(Opcode::Switch as u32, 129);
        assert_eq!(Opcode::SysreqN as u32, 135);
        assert_eq!(Opcode::Break as u32, 137);
        assert_eq!(Opcode::TrackerPushC as u32, 160);
        assert_eq!(Opcode::FloatCmp as u32, 176);
        assert_eq!(NUM_OPCODES, 177);
    }

    #[test]
    fn test_from_cell() {
        assert_eq!(Opcode::from_cell(78), Some(Opcode::Add));
        assert_eq!(Opcode::from_cell(NUM_OPCODES as Cell), None);
        assert_eq!(Opcode::from_cell(-1), None);
    }

    #[test]
    fn test_push_shape() {
        assert_eq!(Opcode::PushC.push_shape(), Some((PushKind::Const, 1)));
        assert_eq!(Opcode::Push2S.push_shape(), Some((PushKind::Frame, 2)));
        assert_eq!(Opcode::Push4Adr.push_shape(), Some((PushKind::Address, 4)));
        assert_eq!(Opcode::Push5.push_shape(), Some((PushKind::Global, 5)));
        assert_eq!(Opcode::Add.push_shape(), None);
    }

    #[test]
    fn test_operand_counts() {
        assert_eq!(Opcode::Proc.operand_count(), Some(0));
        assert_eq!(Opcode::SysreqN.operand_count(), Some(2));
        assert_eq!(Opcode::Push5C.operand_count(), Some(5));
        assert_eq!(Opcode::Casetbl.operand_count(), None);
    }
}
