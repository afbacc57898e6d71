//! Branches, switches and bounds checks.

use pawn_core::{Cell, ErrorCode, Opcode};

use super::TemplateContext;
use crate::backend::x64::{AluOp, CodeSink, Condition};
use crate::tier1::{ALT, PRI};

/// `JZER` .. `JSGEQ`
pub fn emit_conditional_jump<S: CodeSink>(
    ctx: &mut TemplateContext<'_, S>,
    op: Opcode,
    target: u32,
) {
    let cond = match op {
        Opcode::Jzer | Opcode::Jnz => {
            ctx.asm.test_rr(PRI, PRI);
            if op == Opcode::Jzer {
                Condition::Equal
            } else {
                Condition::NotEqual
            }
        }
        _ => {
            ctx.asm.alu_rr(AluOp::Cmp, PRI, ALT);
            match op {
                Opcode::Jeq => Condition::Equal,
                Opcode::Jneq => Condition::NotEqual,
                Opcode::Jless => Condition::Below,
                Opcode::Jleq => Condition::BelowEqual,
                Opcode::Jgrtr => Condition::Above,
                Opcode::Jgeq => Condition::AboveEqual,
                Opcode::Jsless => Condition::Less,
                Opcode::Jsleq => Condition::LessEqual,
                Opcode::Jsgrtr => Condition::Greater,
                _ => Condition::GreaterEqual,
            }
        }
    };
    ctx.branch(Some(cond), target);
}

/// `SWITCH table`: compare PRI against every case, then take the default.
///
/// Case edges are never treated as loop edges even when they point
/// backwards; a loop built from a switch still passes through a jump.
pub fn emit_switch<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, table: u32) {
    let body = ctx.body;
    let Some(table) = body.case_table(table) else {
        ctx.raise(ErrorCode::InstructionParam);
        return;
    };
    let cases = table.operands.get(2..).unwrap_or(&[]);
    for pair in cases.chunks_exact(2) {
        let label = ctx.label_for(pair[1] as u32);
        ctx.asm.alu_ri(AluOp::Cmp, PRI, pair[0]);
        ctx.asm.jcc(Condition::Equal, label);
    }
    let default = ctx.label_for(table.operand(1) as u32);
    ctx.asm.jmp(default);
}

/// `BOUNDS n`: unsigned `pri > n` faults.
pub fn emit_bounds<S: CodeSink>(ctx: &mut TemplateContext<'_, S>, limit: Cell) {
    ctx.asm.alu_ri(AluOp::Cmp, PRI, limit);
    ctx.check(Condition::Above, ErrorCode::ArrayBounds);
}

/// `BREAK`: only compiled into a call when debugging.
pub fn emit_break<S: CodeSink>(ctx: &mut TemplateContext<'_, S>) {
    if ctx.options.debug {
        let helper = ctx.helpers.debug_break as usize;
        ctx.call_helper(helper, &[]);
    }
}
