//! Builder for emitting instructions during compilation.
//!
//! Handles forward jumps with patching and the per-directive truncation the
//! parser's error recovery relies on.

use crate::{
    bytecode::{Program, instruction::{Identifier, Instruction, OpCode}},
    position::Position,
    sourcelist::SourceList,
    value::Value,
};

/// Address of an emitted instruction, used for jump patching.
pub type Addr = usize;

/// Accumulates instructions and resolves jump targets.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    instructions: Vec<Instruction>,
    sources: SourceList,
}

impl ProgramBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the next instruction will get.
    #[must_use]
    pub fn addr(&self) -> Addr {
        self.instructions.len()
    }

    pub fn sources_mut(&mut self) -> &mut SourceList {
        &mut self.sources
    }

    pub fn emit(&mut self, op: OpCode, pos: &Position) -> Addr {
        self.push(Instruction::new(op, pos.clone()))
    }

    pub fn emit_value(&mut self, op: OpCode, value: Value<'static>, pos: &Position) -> Addr {
        self.push(Instruction::with_value(op, value, pos.clone()))
    }

    pub fn emit_ident(&mut self, op: OpCode, ident: Identifier, pos: &Position) -> Addr {
        self.push(Instruction::with_ident(op, ident, pos.clone()))
    }

    pub fn push(&mut self, instruction: Instruction) -> Addr {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    /// Emits a jumping instruction with a placeholder displacement.
    pub fn emit_jump(&mut self, op: OpCode, pos: &Position) -> Addr {
        self.emit_value(op, Value::Int(0), pos)
    }

    /// Points the jump at `addr` to the next emitted instruction.
    pub fn patch_jump_here(&mut self, addr: Addr) {
        let target = self.addr();
        self.patch_jump(addr, target);
    }

    /// Points the jump at `addr` to an explicit target address.
    pub fn patch_jump(&mut self, addr: Addr, target: Addr) {
        let offset = target as i64 - addr as i64;
        self.instructions[addr].value = Value::Int(offset);
    }

    /// Reads back an instruction, for peephole checks.
    #[must_use]
    pub fn instruction(&self, addr: Addr) -> Option<&Instruction> {
        self.instructions.get(addr)
    }

    pub fn instruction_mut(&mut self, addr: Addr) -> Option<&mut Instruction> {
        self.instructions.get_mut(addr)
    }

    /// Drops every instruction from `addr` on; error recovery for one
    /// directive.
    pub fn truncate(&mut self, addr: Addr) {
        self.instructions.truncate(addr);
    }

    /// Replaces the range `[from, to)` with a single constant load; the
    /// payoff of successful compile-time folding.
    pub fn fold_to_value(&mut self, from: Addr, value: Value<'static>, pos: &Position) {
        self.instructions.truncate(from);
        self.emit_value(OpCode::Val, value, pos);
    }

    /// Instructions emitted so far, for the compile-time evaluator.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Finishes the program.
    #[must_use]
    pub fn build(mut self, pos: &Position) -> Program {
        self.emit(OpCode::Halt, pos);
        Program::new(self.instructions, self.sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_patching() {
        let pos = Position::whole_file(None);
        let mut builder = ProgramBuilder::new();
        let jump = builder.emit_jump(OpCode::JmpIfNot, &pos);
        builder.emit_value(OpCode::Val, Value::Int(1), &pos);
        builder.patch_jump_here(jump);
        let program = builder.build(&pos);

        assert_eq!(program.instructions()[jump].jump_offset(), Some(2));
        assert_eq!(program.instructions().last().unwrap().op, OpCode::Halt);
    }

    #[test]
    fn backward_jump_is_negative() {
        let pos = Position::whole_file(None);
        let mut builder = ProgramBuilder::new();
        let open = builder.emit_jump(OpCode::OpenFrag, &pos);
        builder.emit(OpCode::Print, &pos);
        let close = builder.emit_jump(OpCode::CloseFrag, &pos);
        builder.patch_jump(close, open + 1);
        builder.patch_jump(open, close + 1);

        assert_eq!(builder.instruction(close).unwrap().jump_offset(), Some(-1));
        assert_eq!(builder.instruction(open).unwrap().jump_offset(), Some(3));
    }

    #[test]
    fn truncation_discards_partial_directive() {
        let pos = Position::whole_file(None);
        let mut builder = ProgramBuilder::new();
        builder.emit_value(OpCode::Val, Value::Int(1), &pos);
        let mark = builder.addr();
        builder.emit(OpCode::Add, &pos);
        builder.emit(OpCode::Print, &pos);
        builder.truncate(mark);
        assert_eq!(builder.addr(), 1);
    }
}
