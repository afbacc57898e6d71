//! Function discovery and instruction decoding.
//!
//! A function starts at a `PROC` and runs up to the next `PROC` or the end
//! of the code section. Decoding walks it once, checks every opcode and
//! branch target, and hands the compiler a flat instruction list.

use pawn_core::opcode::casetbl_cells;
use pawn_core::{Cell, ErrorCode, Image, Opcode, CELL_SIZE};
use smallvec::SmallVec;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Bytecode offset of the opcode cell.
    pub cip: u32,
    pub op: Opcode,
    /// Operand cells; for `CASETBL` the whole payload.
    pub operands: SmallVec<[Cell; 4]>,
}

impl Instruction {
    /// Operand `i`, or zero when absent.
    #[inline]
    pub fn operand(&self, i: usize) -> Cell {
        self.operands.get(i).copied().unwrap_or(0)
    }

    /// Offset of the following instruction.
    #[inline]
    pub fn next_cip(&self) -> u32 {
        self.cip + CELL_SIZE * (1 + self.operands.len() as u32)
    }
}

/// The instructions of one function.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    /// Offset of the `PROC`.
    pub start: u32,
    /// One past the last code byte.
    pub end: u32,
    pub instructions: Vec<Instruction>,
    starts: Vec<bool>,
}

impl FunctionBody {
    /// Number of code cells the function spans.
    #[inline]
    pub fn cells(&self) -> usize {
        self.starts.len()
    }

    /// Cell index of `cip` within the function.
    #[inline]
    pub fn cell_index(&self, cip: u32) -> Option<usize> {
        if cip < self.start || cip >= self.end || cip % CELL_SIZE != 0 {
            return None;
        }
        Some(((cip - self.start) / CELL_SIZE) as usize)
    }

    /// Whether an instruction begins at `cip`.
    pub fn is_instruction_start(&self, cip: u32) -> bool {
        self.cell_index(cip).map_or(false, |i| self.starts[i])
    }

    /// Number of `CALL` instructions.
    pub fn call_sites(&self) -> usize {
        self.instructions
            .iter()
            .filter(|insn| insn.op == Opcode::Call)
            .count()
    }

    /// The `CASETBL` a `SWITCH` refers to.
    pub fn case_table(&self, table: u32) -> Option<&Instruction> {
        self.instructions
            .binary_search_by_key(&table, |insn| insn.cip)
            .ok()
            .map(|i| &self.instructions[i])
            .filter(|insn| insn.op == Opcode::Casetbl)
    }
}

/// Decode the function whose `PROC` is at `start`.
pub fn decode_function(image: &Image, start: u32) -> Result<FunctionBody, ErrorCode> {
    if !image.is_valid_code_offset(start) {
        return Err(ErrorCode::InvalidInstruction);
    }
    let code_size = image.code_size();
    let mut instructions = Vec::new();
    let mut cip = start;

    while cip < code_size {
        let raw = image
            .code_cell(cip)
            .ok_or(ErrorCode::InvalidInstruction)?;
        let op = Opcode::from_cell(raw).ok_or(ErrorCode::InvalidInstruction)?;
        if instructions.is_empty() {
            if op != Opcode::Proc {
                return Err(ErrorCode::InvalidInstruction);
            }
        } else if op == Opcode::Proc {
            break;
        }
        if op.is_unsupported() {
            return Err(ErrorCode::InvalidInstruction);
        }

        let count = match op.operand_count() {
            Some(n) => n,
            None => {
                let ncases = image
                    .code_cell(cip + CELL_SIZE)
                    .ok_or(ErrorCode::InvalidInstruction)?;
                let ncases = u32::try_from(ncases).map_err(|_| ErrorCode::InvalidInstruction)?;
                1 + casetbl_cells(ncases)
            }
        };

        let mut operands = SmallVec::with_capacity(count);
        for i in 0..count as u32 {
            let at = cip + CELL_SIZE * (1 + i);
            operands.push(image.code_cell(at).ok_or(ErrorCode::InvalidInstruction)?);
        }
        let insn = Instruction { cip, op, operands };
        cip = insn.next_cip();
        instructions.push(insn);
    }

    let end = cip;
    let mut starts = vec![false; ((end - start) / CELL_SIZE) as usize];
    for insn in &instructions {
        starts[((insn.cip - start) / CELL_SIZE) as usize] = true;
    }
    let body = FunctionBody {
        start,
        end,
        instructions,
        starts,
    };
    validate(image, &body)?;
    Ok(body)
}

fn validate(image: &Image, body: &FunctionBody) -> Result<(), ErrorCode> {
    let branch_ok = |target: Cell| {
        u32::try_from(target).map_or(false, |t| body.is_instruction_start(t))
    };

    for insn in &body.instructions {
        match insn.op {
            op if op.is_jump() => {
                if !branch_ok(insn.operand(0)) {
                    return Err(ErrorCode::InstructionParam);
                }
            }
            Opcode::Call => {
                let valid = u32::try_from(insn.operand(0))
                    .map_or(false, |t| image.is_valid_code_offset(t));
                if !valid {
                    return Err(ErrorCode::InstructionParam);
                }
            }
            Opcode::Switch => {
                let table = u32::try_from(insn.operand(0))
                    .ok()
                    .and_then(|t| body.case_table(t))
                    .ok_or(ErrorCode::InstructionParam)?;
                if !case_targets(table).all(branch_ok) {
                    return Err(ErrorCode::InstructionParam);
                }
            }
            Opcode::SysreqC | Opcode::SysreqN => {
                let index = usize::try_from(insn.operand(0)).ok();
                if !index.map_or(false, |i| i < image.natives().len()) {
                    return Err(ErrorCode::InstructionParam);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Default and case targets of a `CASETBL`.
fn case_targets(table: &Instruction) -> impl Iterator<Item = Cell> + '_ {
    let cases = table.operands.get(2..).unwrap_or(&[]);
    std::iter::once(table.operand(1)).chain(cases.chunks_exact(2).map(|pair| pair[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawn_core::ImageBuilder;

    #[test]
    fn test_decode_stops_at_next_proc() {
        let mut b = ImageBuilder::new("t");
        b.begin_function("a");
        b.op1(Opcode::ConstPri, 1).op(Opcode::Retn);
        let second = b.begin_function("b");
        b.op(Opcode::Retn);
        let image = b.build().unwrap();

        let body = decode_function(&image, 0).unwrap();
        assert_eq!(body.end, second);
        assert_eq!(body.instructions.len(), 3);
        assert_eq!(body.cells(), 4);
        assert!(body.is_instruction_start(4));
        assert!(!body.is_instruction_start(8));
    }

    #[test]
    fn test_decode_requires_proc() {
        let mut b = ImageBuilder::new("t");
        b.op1(Opcode::ConstPri, 1).op(Opcode::Retn);
        let image = b.build().unwrap();
        assert_eq!(
            decode_function(&image, 0).unwrap_err(),
            ErrorCode::InvalidInstruction
        );
        assert_eq!(
            decode_function(&image, 2).unwrap_err(),
            ErrorCode::InvalidInstruction
        );
    }

    #[test]
    fn test_decode_rejects_legacy_and_truncated() {
        let mut b = ImageBuilder::new("t");
        b.begin_function("a");
        b.op(Opcode::Lctrl);
        let image = b.build().unwrap();
        assert_eq!(
            decode_function(&image, 0).unwrap_err(),
            ErrorCode::InvalidInstruction
        );

        let mut b = ImageBuilder::new("t");
        b.begin_function("a");
        b.op(Opcode::ConstPri);
        let image = b.build().unwrap();
        assert_eq!(
            decode_function(&image, 0).unwrap_err(),
            ErrorCode::InvalidInstruction
        );
    }

    #[test]
    fn test_decode_checks_branch_targets() {
        let mut b = ImageBuilder::new("t");
        b.begin_function("a");
        b.op1(Opcode::Jump, 6).op(Opcode::Retn);
        let image = b.build().unwrap();
        assert_eq!(
            decode_function(&image, 0).unwrap_err(),
            ErrorCode::InstructionParam
        );
    }

    #[test]
    fn test_decode_switch_table() {
        let mut b = ImageBuilder::new("t");
        b.begin_function("a");
        let done = b.new_label();
        let one = b.new_label();
        b.switch(done, &[(1, one)]);
        b.bind(one);
        b.op1(Opcode::ConstPri, 10);
        b.bind(done);
        b.op(Opcode::Retn);
        let image = b.build().unwrap();

        let body = decode_function(&image, 0).unwrap();
        let switch = &body.instructions[1];
        assert_eq!(switch.op, Opcode::Switch);
        let table = body.case_table(switch.operand(0) as u32).unwrap();
        assert_eq!(table.operands.len(), 4);
        assert_eq!(case_targets(table).count(), 2);
    }

    #[test]
    fn test_decode_checks_native_index() {
        let mut b = ImageBuilder::new("t");
        b.begin_function("a");
        b.op1(Opcode::SysreqC, 0).op(Opcode::Retn);
        let image = b.build().unwrap();
        assert_eq!(
            decode_function(&image, 0).unwrap_err(),
            ErrorCode::InstructionParam
        );
    }
}
