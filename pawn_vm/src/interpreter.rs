//! The bytecode interpreter.
//!
//! Executes one function per native call frame: `CALL` recurses into
//! [`Interpreter::run_function`], so the return-address stack and the Rust
//! stack unwind together. Every opcode behaves exactly like its compiled
//! template, including the order of checks and which code a fault reports,
//! so either executor can run any function.

use std::sync::Arc;

use pawn_core::{
    cell_to_float, float_to_cell, Cell, ErrorCode, Opcode, PushKind, RoundingMode, CELL_SIZE,
};

use crate::native;
use crate::runtime::Runtime;

/// What the dispatch loop does after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Continue at the given offset.
    Next(u32),
    /// `RETN` completed; the function returns.
    Return,
}

/// Run the function whose `PROC` is at `offset` and return PRI.
///
/// On failure the state's `cip` names the faulting instruction.
pub(crate) fn execute(rt: &mut Runtime, offset: u32) -> Result<Cell, ErrorCode> {
    let image = Arc::clone(rt.image());
    let mut interp = Interpreter::new(rt, image.code());
    match interp.run_function(offset) {
        Ok(()) => Ok(interp.pri),
        Err(code) => {
            let cip = interp.fault_cip.unwrap_or(offset);
            interp.rt.state.cip = cip;
            Err(code)
        }
    }
}

struct Interpreter<'a> {
    rt: &'a mut Runtime,
    code: &'a [Cell],
    pri: Cell,
    alt: Cell,
    /// Innermost faulting instruction, set once.
    fault_cip: Option<u32>,
    debug_breaks: bool,
}

impl<'a> Interpreter<'a> {
    fn new(rt: &'a mut Runtime, code: &'a [Cell]) -> Self {
        let debug_breaks = rt.debug_breaks();
        Interpreter {
            rt,
            code,
            pri: 0,
            alt: 0,
            fault_cip: None,
            debug_breaks,
        }
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    #[inline]
    fn cell(&self, offset: u32) -> Result<Cell, ErrorCode> {
        self.code
            .get((offset / CELL_SIZE) as usize)
            .copied()
            .ok_or(ErrorCode::InvalidInstruction)
    }

    #[inline]
    fn operands(&self, cip: u32, count: usize) -> Result<&'a [Cell], ErrorCode> {
        let first = (cip / CELL_SIZE) as usize + 1;
        let code: &'a [Cell] = self.code;
        code.get(first..first + count)
            .ok_or(ErrorCode::InvalidInstruction)
    }

    fn opcode_at(&self, cip: u32) -> Result<Opcode, ErrorCode> {
        Opcode::from_cell(self.cell(cip)?).ok_or(ErrorCode::InvalidInstruction)
    }

    /// A code address operand.
    fn code_target(&self, target: Cell) -> Result<u32, ErrorCode> {
        u32::try_from(target)
            .ok()
            .filter(|&t| t % CELL_SIZE == 0 && ((t / CELL_SIZE) as usize) < self.code.len())
            .ok_or(ErrorCode::InstructionParam)
    }

    // =========================================================================
    // Function Execution
    // =========================================================================

    /// Execute from the `PROC` at `start` until its `RETN`.
    fn run_function(&mut self, start: u32) -> Result<(), ErrorCode> {
        self.rt.verify_function(start)?;
        let entry_frm = self.rt.state.frm;
        let mut cip = start;
        loop {
            match self.step(cip, start) {
                Ok(Flow::Next(next)) => cip = next,
                Ok(Flow::Return) => return Ok(()),
                Err(code) => {
                    self.fault_cip.get_or_insert(cip);
                    self.rt.state.frm = entry_frm;
                    return Err(code);
                }
            }
        }
    }

    /// Take a branch from `cip` to `target`.
    ///
    /// Backward branches are loop edges and poll for a pending timeout.
    #[inline]
    fn branch(&self, cip: u32, target: Cell) -> Result<Flow, ErrorCode> {
        let target = self.code_target(target)?;
        if target <= cip && self.rt.env().poll_timeout() {
            return Err(ErrorCode::Timeout);
        }
        Ok(Flow::Next(target))
    }

    #[inline]
    fn frame(&self, offset: Cell) -> u32 {
        self.rt.state.frm.wrapping_add(offset as u32)
    }

    #[inline]
    fn load(&self, addr: u32) -> Result<Cell, ErrorCode> {
        self.rt.state.read_cell(addr)
    }

    #[inline]
    fn store(&mut self, addr: u32, value: Cell) -> Result<(), ErrorCode> {
        self.rt.state.write_cell(addr, value)
    }

    fn step_cell(&mut self, addr: u32, delta: Cell) -> Result<(), ErrorCode> {
        let value = self.load(addr)?;
        self.store(addr, value.wrapping_add(delta))
    }

    fn push_values(&mut self, kind: PushKind, values: &[Cell]) -> Result<(), ErrorCode> {
        self.rt.state.check_stack_space(4 * values.len() as u32)?;
        for &value in values {
            let cell = match kind {
                PushKind::Const => value,
                PushKind::Address => self.frame(value) as Cell,
                PushKind::Global => self.load(value as u32)?,
                PushKind::Frame => self.load(self.frame(value))?,
            };
            self.rt.state.push_unchecked(cell);
        }
        Ok(())
    }

    /// Pop the two float operands of a binary float opcode.
    fn pop_float_pair(&mut self) -> Result<(f32, f32), ErrorCode> {
        let state = &mut self.rt.state;
        state.check_stack_cells(2)?;
        let a = cell_to_float(state.peek(0)?);
        let b = cell_to_float(state.peek(1)?);
        state.sp += 8;
        Ok((a, b))
    }

    fn divide(&mut self, swapped: bool, signed: bool) -> Result<(), ErrorCode> {
        let (dividend, divisor) = if swapped {
            (self.alt, self.pri)
        } else {
            (self.pri, self.alt)
        };
        if divisor == 0 {
            return Err(ErrorCode::DivideByZero);
        }
        if signed {
            if divisor == -1 && dividend == i32::MIN {
                return Err(ErrorCode::IntegerOverflow);
            }
            self.pri = dividend / divisor;
            self.alt = dividend % divisor;
        } else {
            let (n, d) = (dividend as u32, divisor as u32);
            self.pri = (n / d) as Cell;
            self.alt = (n % d) as Cell;
        }
        Ok(())
    }

    fn call(&mut self, cip: u32, target: Cell) -> Result<(), ErrorCode> {
        let target = self.code_target(target)?;
        self.rt.state.push_return(cip)?;
        let sp = self.rt.state.sp;
        let alt = self.alt;
        if let Err(code) = self.run_function(target) {
            // The call site stays on the return stack for the backtrace.
            self.rt.state.sp = sp;
            return Err(code);
        }
        self.rt.state.pop_return();
        self.alt = alt;
        Ok(())
    }

    /// Execute the instruction at `cip`.
    fn step(&mut self, cip: u32, start: u32) -> Result<Flow, ErrorCode> {
        use Opcode::*;

        let op = self.opcode_at(cip)?;
        if op.is_unsupported() {
            return Err(ErrorCode::InvalidInstruction);
        }
        let count = match op {
            Casetbl => return Err(ErrorCode::InvalidInstruction),
            _ => op.operand_count().unwrap_or(0),
        };
        let ops = self.operands(cip, count)?;
        let a = ops.first().copied().unwrap_or(0);
        let b = ops.get(1).copied().unwrap_or(0);
        let next = Flow::Next(cip + CELL_SIZE * (1 + count as u32));

        if let Some((kind, n)) = op.push_shape() {
            self.push_values(kind, &ops[..n])?;
            return Ok(next);
        }

        match op {
            // Loads and stores
            LoadPri => self.pri = self.load(a as u32)?,
            LoadAlt => self.alt = self.load(a as u32)?,
            LoadSPri => self.pri = self.load(self.frame(a))?,
            LoadSAlt => self.alt = self.load(self.frame(a))?,
            LrefPri => self.pri = self.load(self.load(a as u32)? as u32)?,
            LrefAlt => self.alt = self.load(self.load(a as u32)? as u32)?,
            LrefSPri => self.pri = self.load(self.load(self.frame(a))? as u32)?,
            LrefSAlt => self.alt = self.load(self.load(self.frame(a))? as u32)?,
            LoadI => self.pri = self.load(self.pri as u32)?,
            LodbI => self.pri = self.rt.state.read_sized(self.pri as u32, a)?,
            ConstPri => self.pri = a,
            ConstAlt => self.alt = a,
            AddrPri => self.pri = self.frame(a) as Cell,
            AddrAlt => self.alt = self.frame(a) as Cell,
            StorPri => self.store(a as u32, self.pri)?,
            StorAlt => self.store(a as u32, self.alt)?,
            StorSPri => self.store(self.frame(a), self.pri)?,
            StorSAlt => self.store(self.frame(a), self.alt)?,
            SrefPri | SrefAlt | SrefSPri | SrefSAlt => {
                let slot = match op {
                    SrefPri | SrefAlt => a as u32,
                    _ => self.frame(a),
                };
                let value = if matches!(op, SrefPri | SrefSPri) {
                    self.pri
                } else {
                    self.alt
                };
                let target = self.load(slot)? as u32;
                self.store(target, value)?;
            }
            StorI => self.store(self.alt as u32, self.pri)?,
            StrbI => self.rt.state.write_sized(self.alt as u32, a, self.pri)?,
            Lidx => {
                let addr = self.alt.wrapping_add(self.pri.wrapping_mul(4));
                self.pri = self.load(addr as u32)?;
            }
            LidxB => {
                let addr = (self.pri as u32).wrapping_shl(a as u32 & 31);
                self.pri = self.load(addr.wrapping_add(self.alt as u32))?;
            }
            Idxaddr => self.pri = self.alt.wrapping_add(self.pri.wrapping_mul(4)),
            IdxaddrB => {
                let scaled = (self.pri as u32).wrapping_shl(a as u32 & 31);
                self.pri = scaled.wrapping_add(self.alt as u32) as Cell;
            }
            LoadBoth => {
                self.pri = self.load(a as u32)?;
                self.alt = self.load(b as u32)?;
            }
            LoadSBoth => {
                self.pri = self.load(self.frame(a))?;
                self.alt = self.load(self.frame(b))?;
            }
            Const => self.store(a as u32, b)?,
            ConstS => self.store(self.frame(a), b)?,
            Zero => self.store(a as u32, 0)?,
            ZeroS => self.store(self.frame(a), 0)?,
            Movs => self
                .rt
                .state
                .copy_memory(self.pri as u32, self.alt as u32, a as u32)?,
            Fill => self
                .rt
                .state
                .fill_memory(self.alt as u32, a as u32, self.pri)?,

            // Registers
            MovePri => self.pri = self.alt,
            MoveAlt => self.alt = self.pri,
            Xchg => std::mem::swap(&mut self.pri, &mut self.alt),
            ZeroPri => self.pri = 0,
            ZeroAlt => self.alt = 0,
            StradjustPri => self.pri = self.pri.wrapping_add(4) >> 2,

            // Stack, frames and heap
            PushPri => self.rt.state.push(self.pri)?,
            PushAlt => self.rt.state.push(self.alt)?,
            PopPri => self.pri = self.rt.state.pop()?,
            PopAlt => self.alt = self.rt.state.pop()?,
            SwapPri | SwapAlt => {
                let state = &mut self.rt.state;
                state.check_stack_cells(1)?;
                let top = state.peek(0)?;
                let reg = if op == SwapPri {
                    &mut self.pri
                } else {
                    &mut self.alt
                };
                state.poke(0, *reg)?;
                *reg = top;
            }
            Stack => self.rt.state.adjust_stack(a)?,
            Stackadjust => self.rt.state.set_stack_from_frame(a)?,
            Heap => self.alt = self.rt.state.adjust_heap(a)? as Cell,
            Proc => {
                if cip != start {
                    return Err(ErrorCode::InvalidInstruction);
                }
                let state = &mut self.rt.state;
                state.check_stack_space(8)?;
                let frm = state.frm;
                state.push_unchecked(frm as Cell);
                state.push_unchecked(0);
                state.frm = state.sp;
            }
            Retn => {
                let state = &mut self.rt.state;
                state.check_stack_cells(3)?;
                state.frm = state.peek(1)? as u32;
                let argc = state.peek(2)? as u32;
                let top = state.sp as u64 + 12 + 4 * argc as u64;
                if top > state.mem_size() as u64 {
                    return Err(ErrorCode::StackMin);
                }
                state.sp = top as u32;
                return Ok(Flow::Return);
            }
            TrackerPushC => self.rt.state.tracker_push(a.wrapping_mul(4) as u32),
            TrackerPopSetheap => self.rt.state.tracker_pop_set_heap()?,
            Genarray => self.rt.state.generate_array(a, false)?,
            GenarrayZ => self.rt.state.generate_array(a, true)?,

            // Arithmetic
            Add => self.pri = self.pri.wrapping_add(self.alt),
            Sub => self.pri = self.pri.wrapping_sub(self.alt),
            SubAlt => self.pri = self.alt.wrapping_sub(self.pri),
            And => self.pri &= self.alt,
            Or => self.pri |= self.alt,
            Xor => self.pri ^= self.alt,
            Smul | Umul => self.pri = self.pri.wrapping_mul(self.alt),
            Sdiv => self.divide(false, true)?,
            SdivAlt => self.divide(true, true)?,
            Udiv => self.divide(false, false)?,
            UdivAlt => self.divide(true, false)?,
            Not => self.pri = (self.pri == 0) as Cell,
            Neg => self.pri = self.pri.wrapping_neg(),
            Invert => self.pri = !self.pri,
            AddC => self.pri = self.pri.wrapping_add(a),
            SmulC => self.pri = self.pri.wrapping_mul(a),
            SignPri => self.pri = self.pri as i8 as Cell,
            SignAlt => self.alt = self.alt as i8 as Cell,
            Shl => self.pri = self.pri.wrapping_shl(self.alt as u32 & 31),
            Shr => self.pri = ((self.pri as u32) >> (self.alt as u32 & 31)) as Cell,
            Sshr => self.pri >>= self.alt as u32 & 31,
            ShlCPri => self.pri = self.pri.wrapping_shl(a as u32 & 31),
            ShlCAlt => self.alt = self.alt.wrapping_shl(a as u32 & 31),
            ShrCPri => self.pri = ((self.pri as u32) >> (a as u32 & 31)) as Cell,
            ShrCAlt => self.alt = ((self.alt as u32) >> (a as u32 & 31)) as Cell,
            Eq | Neq | Less | Leq | Grtr | Geq | Sless | Sleq | Sgrtr | Sgeq => {
                self.pri = compare(op, self.pri, self.alt) as Cell;
            }
            EqCPri => self.pri = (self.pri == a) as Cell,
            EqCAlt => self.pri = (self.alt == a) as Cell,
            IncPri => self.pri = self.pri.wrapping_add(1),
            IncAlt => self.alt = self.alt.wrapping_add(1),
            DecPri => self.pri = self.pri.wrapping_sub(1),
            DecAlt => self.alt = self.alt.wrapping_sub(1),
            Inc => self.step_cell(a as u32, 1)?,
            Dec => self.step_cell(a as u32, -1)?,
            IncS => self.step_cell(self.frame(a), 1)?,
            DecS => self.step_cell(self.frame(a), -1)?,
            IncI => self.step_cell(self.pri as u32, 1)?,
            DecI => self.step_cell(self.pri as u32, -1)?,

            // Control
            Jump => return self.branch(cip, a),
            Jzer => {
                if self.pri == 0 {
                    return self.branch(cip, a);
                }
            }
            Jnz => {
                if self.pri != 0 {
                    return self.branch(cip, a);
                }
            }
            Jeq | Jneq | Jless | Jleq | Jgrtr | Jgeq | Jsless | Jsleq | Jsgrtr | Jsgeq => {
                if compare(op, self.pri, self.alt) {
                    return self.branch(cip, a);
                }
            }
            Switch => return self.switch(a),
            Halt => return Err(ErrorCode::Aborted),
            Bounds => {
                if self.pri as u32 > a as u32 {
                    return Err(ErrorCode::ArrayBounds);
                }
            }
            Break => {
                if self.debug_breaks {
                    self.rt.state.record_break(cip);
                }
            }
            Nop => {}

            // Calls
            Call => self.call(cip, a)?,
            SysreqC => self.pri = native::invoke_native(self.rt, a as u32)?,
            SysreqN => {
                self.rt.state.push(b)?;
                self.pri = native::invoke_native(self.rt, a as u32)?;
                let cells = b.wrapping_add(1).wrapping_mul(4) as u32;
                self.rt.state.sp = self.rt.state.sp.wrapping_add(cells);
            }

            // Floats
            Fabs => self.pri = self.rt.state.pop()? & 0x7FFF_FFFF,
            Float => self.pri = float_to_cell(self.rt.state.pop()? as f32),
            FloatAdd | FloatSub | FloatMul | FloatDiv => {
                let (x, y) = self.pop_float_pair()?;
                let result = match op {
                    FloatAdd => x + y,
                    FloatSub => x - y,
                    FloatMul => x * y,
                    _ => x / y,
                };
                self.pri = float_to_cell(result);
            }
            FloatCmp => {
                let (x, y) = self.pop_float_pair()?;
                self.pri = if x > y {
                    1
                } else if x < y {
                    -1
                } else {
                    0
                };
            }
            RndToNearest => self.pri = self.rt.state.round_float(RoundingMode::Nearest)?,
            RndToFloor => self.pri = self.rt.state.round_float(RoundingMode::Floor)?,
            RndToCeil => self.pri = self.rt.state.round_float(RoundingMode::Ceil)?,
            RndToZero => self.pri = self.rt.state.round_float(RoundingMode::Zero)?,

            _ => return Err(ErrorCode::InvalidInstruction),
        }
        Ok(next)
    }

    /// `SWITCH`: jump to the matching case or the default.
    fn switch(&self, table: Cell) -> Result<Flow, ErrorCode> {
        let table = self.code_target(table)?;
        if self.opcode_at(table)? != Opcode::Casetbl {
            return Err(ErrorCode::InstructionParam);
        }
        let ncases = u32::try_from(self.cell(table + CELL_SIZE)?)
            .map_err(|_| ErrorCode::InstructionParam)?;
        let payload = self.operands(table, 1 + pawn_core::opcode::casetbl_cells(ncases))?;
        let target = payload[2..]
            .chunks_exact(2)
            .find(|case| case[0] == self.pri)
            .map_or(payload[1], |case| case[1]);
        // Case edges are not loop edges.
        Ok(Flow::Next(self.code_target(target)?))
    }
}

/// Evaluate a comparison opcode; unsigned unless the mnemonic says `s`.
#[inline]
fn compare(op: Opcode, pri: Cell, alt: Cell) -> bool {
    use Opcode::*;
    let (upri, ualt) = (pri as u32, alt as u32);
    match op {
        Eq | Jeq => pri == alt,
        Neq | Jneq => pri != alt,
        Less | Jless => upri < ualt,
        Leq | Jleq => upri <= ualt,
        Grtr | Jgrtr => upri > ualt,
        Geq | Jgeq => upri >= ualt,
        Sless | Jsless => pri < alt,
        Sleq | Jsleq => pri <= alt,
        Sgrtr | Jsgrtr => pri > alt,
        _ => pri >= alt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, Environment};
    use pawn_core::{float_to_cell, ImageBuilder, Image, PawnError};

    fn run(image: Image, params: &[Cell]) -> Result<Cell, PawnError> {
        let env = Environment::new(EngineConfig::interpreter_only());
        let mut rt = env.load_image(image)?;
        let main = rt.public_offset("main").unwrap();
        rt.invoke(main, params)
    }

    fn function(body: impl FnOnce(&mut ImageBuilder)) -> Image {
        let mut b = ImageBuilder::new("interp");
        b.public("main");
        b.begin_function("main");
        body(&mut b);
        b.end_function();
        b.build().unwrap()
    }

    #[test]
    fn test_compare_signedness() {
        assert!(compare(Opcode::Less, 1, -1));
        assert!(!compare(Opcode::Sless, 1, -1));
        assert!(compare(Opcode::Jsgeq, 0, -5));
        assert!(compare(Opcode::Jgeq, -5, 0));
    }

    #[test]
    fn test_arguments_are_frame_relative() {
        let image = function(|b| {
            b.op1(Opcode::LoadSPri, 12);
            b.op1(Opcode::LoadSAlt, 16);
            b.op(Opcode::Sub);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[10, 3]).unwrap(), 7);
    }

    #[test]
    fn test_division_results() {
        let image = function(|b| {
            b.op1(Opcode::ConstPri, -7);
            b.op1(Opcode::ConstAlt, 2);
            b.op(Opcode::Sdiv);
            // pri = quotient * 10 + remainder
            b.op(Opcode::PushAlt);
            b.op1(Opcode::SmulC, 10);
            b.op(Opcode::PopAlt);
            b.op(Opcode::Add);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[]).unwrap(), -31);
    }

    #[test]
    fn test_integer_overflow() {
        let image = function(|b| {
            b.op1(Opcode::ConstPri, i32::MIN);
            b.op1(Opcode::ConstAlt, -1);
            b.op(Opcode::Sdiv);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[]).unwrap_err().code(), ErrorCode::IntegerOverflow);
    }

    #[test]
    fn test_unsigned_division() {
        let image = function(|b| {
            b.op1(Opcode::ConstPri, -2);
            b.op1(Opcode::ConstAlt, 2);
            b.op(Opcode::Udiv);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[]).unwrap(), 0x7FFF_FFFF);
    }

    #[test]
    fn test_shifts_mask_count() {
        let image = function(|b| {
            b.op1(Opcode::ConstPri, -16);
            b.op1(Opcode::ConstAlt, 33);
            b.op(Opcode::Sshr);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[]).unwrap(), -8);
    }

    #[test]
    fn test_push_families() {
        let image = function(|b| {
            b.op_n(Opcode::Push3C, &[1, 2, 3]);
            b.op(Opcode::PopPri);
            b.op(Opcode::PopAlt);
            b.op(Opcode::Sub);
            b.op(Opcode::PopAlt);
            b.op(Opcode::Add);
            b.op(Opcode::Retn);
        });
        // 3 - 2 + 1
        assert_eq!(run(image, &[]).unwrap(), 2);
    }

    #[test]
    fn test_loop_and_backward_branch() {
        let image = function(|b| {
            // sum = 0; for i = n; i != 0; i-- sum += i
            b.op1(Opcode::LoadSPri, 12);
            b.op(Opcode::ZeroAlt);
            let top = b.label_here();
            let done = b.new_label();
            b.jump(Opcode::Jzer, done);
            b.op(Opcode::Xchg);
            b.op(Opcode::Add);
            b.op(Opcode::Xchg);
            b.op(Opcode::DecPri);
            b.jump(Opcode::Jump, top);
            b.bind(done);
            b.op(Opcode::MovePri);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[100]).unwrap(), 5050);
    }

    #[test]
    fn test_switch_dispatch() {
        let image = function(|b| {
            let one = b.new_label();
            let two = b.new_label();
            let default = b.new_label();
            b.op1(Opcode::LoadSPri, 12);
            b.switch(default, &[(1, one), (2, two)]);
            b.bind(one);
            b.op1(Opcode::ConstPri, 10);
            b.op(Opcode::Retn);
            b.bind(two);
            b.op1(Opcode::ConstPri, 20);
            b.op(Opcode::Retn);
            b.bind(default);
            b.op1(Opcode::ConstPri, -1);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image.clone(), &[2]).unwrap(), 20);
        assert_eq!(run(image.clone(), &[1]).unwrap(), 10);
        assert_eq!(run(image, &[9]).unwrap(), -1);
    }

    #[test]
    fn test_float_ops() {
        let image = function(|b| {
            b.op1(Opcode::PushC, float_to_cell(0.5));
            b.op1(Opcode::PushC, float_to_cell(2.0));
            b.op(Opcode::FloatAdd);
            b.op(Opcode::PushPri);
            b.op(Opcode::RndToFloor);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[]).unwrap(), 2);
    }

    #[test]
    fn test_float_compare_nan() {
        let image = function(|b| {
            b.op1(Opcode::PushC, float_to_cell(f32::NAN));
            b.op1(Opcode::PushC, float_to_cell(1.0));
            b.op(Opcode::FloatCmp);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[]).unwrap(), 0);
    }

    #[test]
    fn test_running_off_the_end() {
        let image = function(|b| {
            b.op1(Opcode::ConstPri, 1);
        });
        assert_eq!(
            run(image, &[]).unwrap_err().code(),
            ErrorCode::InvalidInstruction
        );
    }

    #[test]
    fn test_halt_and_bounds() {
        let halt = function(|b| {
            b.op1(Opcode::Halt, 0);
        });
        assert_eq!(run(halt, &[]).unwrap_err().code(), ErrorCode::Aborted);

        let bounds = function(|b| {
            b.op1(Opcode::ConstPri, -1);
            b.op1(Opcode::Bounds, 10);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(bounds, &[]).unwrap_err().code(), ErrorCode::ArrayBounds);
    }

    #[test]
    fn test_gap_access_faults() {
        let image = function(|b| {
            // One cell below the stack pointer is inside the gap.
            b.op1(Opcode::AddrPri, -8);
            b.op(Opcode::LoadI);
            b.op(Opcode::Retn);
        });
        assert_eq!(run(image, &[]).unwrap_err().code(), ErrorCode::MemAccess);
    }
}
