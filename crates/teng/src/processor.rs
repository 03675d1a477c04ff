//! The template machine.
//!
//! A single stack-based loop serves two masters: rendering (real frames,
//! formatter, writer) and compile-time expression folding (stub frames, no
//! output). The folding mode reports [`RunError::NeedsRuntime`] as soon as an
//! instruction touches anything only the runtime can provide; the parser
//! then abandons the fold and keeps the instructions.
//!
//! Recoverable conditions (undefined variables, type mismatches, division by
//! zero, unknown functions) are logged and produce `undefined`; only machine
//! corruption, exceeded stacks and writer failures abort a render.

use std::fmt::Write as _;

use crate::{
    bytecode::{Identifier, Instruction, OpCode, Program},
    configuration::Configuration,
    contenttype::Escaper,
    dictionary::Dictionary,
    error::{ErrorLog, Level},
    formatter::{FormatMode, Formatter},
    fragment::{Fragment, FragmentValue},
    functions::{self, FunctionCtx, UdfRegistry},
    openframes::{ConstFrames, FrameError, FramesApi},
    position::Position,
    value::{Number, Value},
};

/// Abnormal termination of the machine.
///
/// Everything fatal is logged before the error is returned, so callers only
/// need to flush and report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// Compile-time evaluation needs real application data.
    NeedsRuntime,
    /// Machine corruption or writer failure; the log has the details.
    Fatal,
}

impl From<FrameError> for RunError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::NeedsRuntime => Self::NeedsRuntime,
            FrameError::BadOffsets => Self::Fatal,
        }
    }
}

/// The machine.
pub struct Processor<'r, 'w, 'a> {
    instructions: &'r [Instruction],
    frames: &'r mut dyn FramesApi<'a>,
    escaper: &'r mut Escaper,
    formatter: Option<&'r mut Formatter<'w>>,
    dict: &'r Dictionary,
    config: &'r Configuration,
    udf: &'r UdfRegistry,
    log: &'r mut ErrorLog,
    encoding: String,
    /// Whole program, for the `bytecode` directive's disassembly dump.
    program: Option<&'r Program>,
    /// Compile-time evaluation mode: no side effects allowed.
    eval: bool,

    stack: Vec<Value<'a>>,
    prog_stack: Vec<Value<'a>>,
    /// Return addresses of active `REPEAT_FRAG` recursions, with the
    /// open-record depth of the recursive entry.
    repeat_stack: Vec<(usize, usize)>,
}

impl<'r, 'w, 'a> Processor<'r, 'w, 'a> {
    /// Builds a rendering machine.
    #[expect(clippy::too_many_arguments, reason = "the machine wires every subsystem together")]
    pub fn new(
        program: &'r Program,
        frames: &'r mut dyn FramesApi<'a>,
        escaper: &'r mut Escaper,
        formatter: &'r mut Formatter<'w>,
        dict: &'r Dictionary,
        config: &'r Configuration,
        udf: &'r UdfRegistry,
        log: &'r mut ErrorLog,
        encoding: &str,
    ) -> Self {
        Self {
            instructions: program.instructions(),
            frames,
            escaper,
            formatter: Some(formatter),
            dict,
            config,
            udf,
            log,
            encoding: encoding.to_ascii_lowercase(),
            program: Some(program),
            eval: false,
            stack: Vec::new(),
            prog_stack: Vec::new(),
            repeat_stack: Vec::new(),
        }
    }

    /// Runs the whole program.
    pub fn run(&mut self) -> Result<(), RunError> {
        let fmt_depth = self.formatter.as_ref().map(|f| f.depth());
        let escaper_depth = self.escaper.depth();

        let result = self.run_loop();

        if !self.eval
            && result == Err(RunError::Fatal)
            && self.log.max_level() < Some(Level::Fatal)
        {
            // a fatal return must be visible in the log
            let pos = Position::whole_file(None);
            self.log.append(Level::Fatal, &pos, "Rendering aborted");
        }

        if !self.eval && result.is_ok() {
            let end = self
                .instructions
                .last()
                .map_or_else(|| Position::whole_file(None), |i| i.pos.clone());
            if !self.stack.is_empty() || !self.prog_stack.is_empty() {
                self.log.append(
                    Level::Fatal,
                    &end,
                    "Value stack is not empty at program end",
                );
            }
            if !self.repeat_stack.is_empty() {
                self.log.append(
                    Level::Fatal,
                    &end,
                    "Fragment recursion is unbalanced at program end",
                );
            }
            if self.escaper.depth() != escaper_depth {
                self.log.append(
                    Level::Fatal,
                    &end,
                    "Content type stack is unbalanced at program end",
                );
            }
            if let (Some(depth), Some(formatter)) = (fmt_depth, self.formatter.as_ref())
                && formatter.depth() != depth
            {
                self.log.append(
                    Level::Fatal,
                    &end,
                    "Format stack is unbalanced at program end",
                );
            }
        }
        result
    }

    fn run_loop(&mut self) -> Result<(), RunError> {
        // copy the slice reference out so instructions stay borrowable while
        // the machine state is mutated
        let instructions = self.instructions;
        let mut ip = 0usize;
        while ip < instructions.len() {
            let instr = &instructions[ip];
            let mut next = ip + 1;
            match self.step(ip, instr)? {
                Step::Next => {}
                Step::Jump(target) => {
                    if target < 0 || target as usize > self.instructions.len() {
                        return Err(self.fatal(&instr.pos, "Jump target out of program"));
                    }
                    next = target as usize;
                }
                Step::Halt => return Ok(()),
            }
            ip = next;
        }
        Ok(())
    }

    fn step(&mut self, ip: usize, instr: &Instruction) -> Result<Step, RunError> {
        let pos = &instr.pos;
        match instr.op {
            OpCode::Val => {
                self.stack.push(instr.value.clone());
            }
            OpCode::Var => self.exec_var(instr)?,
            OpCode::PushFrag => {
                let ident = self.ident(instr)?.clone();
                let (frame_off, frag_off) =
                    ident.offsets.ok_or_else(|| self.fatal(pos, "Malformed instruction"))?;
                let value = match self.frames.frag(frame_off, frag_off) {
                    Ok(value) => value,
                    Err(FrameError::NeedsRuntime) => return Err(RunError::NeedsRuntime),
                    Err(FrameError::BadOffsets) => {
                        // _parent above the root degrades to undefined
                        self.warn(pos, "There is no parent fragment");
                        Value::Undefined
                    }
                };
                self.stack.push(value);
            }
            OpCode::Set => self.exec_set(instr)?,
            OpCode::DictLookup => self.exec_dict_lookup(pos)?,

            OpCode::Push => {
                let value = self.pop(pos)?;
                self.prog_stack.push(value);
            }
            OpCode::Pop => {
                if self.prog_stack.pop().is_none() {
                    return Err(self.fatal(pos, "Program stack underflow"));
                }
            }
            OpCode::Stack => {
                let offset = self.int_operand(instr)?;
                let index = self
                    .prog_stack
                    .len()
                    .checked_sub(1 + offset as usize)
                    .ok_or_else(|| self.fatal(pos, "Program stack underflow"))?;
                let value = self.prog_stack[index].clone();
                self.stack.push(value);
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                self.exec_arithmetic(instr.op, pos)?;
            }
            OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor => {
                self.exec_bitwise(instr.op, pos)?;
            }
            OpCode::BitNot => {
                let value = self.pop(pos)?;
                let result = match value.as_number() {
                    _ if value.is_undefined() => Value::Undefined,
                    Some(Number::Int(v)) => Value::Int(!v),
                    _ => {
                        self.recoverable(pos, "Bitwise operation with non-integral operand");
                        Value::Undefined
                    }
                };
                self.stack.push(result);
            }

            OpCode::NumEq | OpCode::NumGe | OpCode::NumGt => {
                self.exec_numeric_comparison(instr.op, pos)?;
            }
            OpCode::StrEq | OpCode::StrNe => {
                let rhs = self.pop(pos)?;
                let lhs = self.pop(pos)?;
                let equal = lhs.to_string_value() == rhs.to_string_value();
                self.stack
                    .push(Value::from(if instr.op == OpCode::StrEq { equal } else { !equal }));
            }
            OpCode::RegexMatch | OpCode::RegexNotMatch => {
                let pattern = self.pop(pos)?;
                let text = self.pop(pos)?;
                let result = match &pattern {
                    Value::Regex(re) => {
                        let matched = re.is_match(&text.to_string_value());
                        Value::from(if instr.op == OpCode::RegexMatch {
                            matched
                        } else {
                            !matched
                        })
                    }
                    _ => {
                        self.recoverable(pos, "Right side of =~ is not a regex");
                        Value::Undefined
                    }
                };
                self.stack.push(result);
            }

            OpCode::And => {
                let top = self.peek(pos)?;
                if top.to_bool() {
                    self.pop(pos)?;
                } else {
                    return Ok(Step::Jump(ip as i64 + self.jump_operand(instr)?));
                }
            }
            OpCode::Or => {
                let top = self.peek(pos)?;
                if top.to_bool() {
                    return Ok(Step::Jump(ip as i64 + self.jump_operand(instr)?));
                }
                self.pop(pos)?;
            }
            OpCode::Not => {
                let value = self.pop(pos)?;
                self.stack.push(Value::from(!value.to_bool()));
            }

            OpCode::Concat => {
                let rhs = self.pop(pos)?;
                let lhs = self.pop(pos)?;
                let mut out = lhs.to_string_value().into_owned();
                out.push_str(&rhs.to_string_value());
                self.stack.push(Value::String(out));
            }
            OpCode::Repeat => {
                let count = self.pop(pos)?;
                let text = self.pop(pos)?;
                let result = match count.as_number() {
                    Some(Number::Int(n)) if n >= 0 => {
                        Value::String(text.to_string_value().repeat(n as usize))
                    }
                    _ => {
                        self.recoverable(pos, "Right side of repeat must be a non-negative integer");
                        Value::Undefined
                    }
                };
                self.stack.push(result);
            }

            OpCode::Jmp => return Ok(Step::Jump(ip as i64 + self.jump_operand(instr)?)),
            OpCode::JmpIfNot => {
                let condition = self.pop(pos)?;
                if !condition.to_bool() {
                    return Ok(Step::Jump(ip as i64 + self.jump_operand(instr)?));
                }
            }
            OpCode::Halt => return Ok(Step::Halt),

            OpCode::OpenFrag => {
                let name = self.ident(instr)?.name().to_owned();
                if !self.frames.open_frag(&name)? {
                    return Ok(Step::Jump(ip as i64 + self.jump_operand(instr)?));
                }
            }
            OpCode::CloseFrag => {
                if self.frames.next_frag()? {
                    return Ok(Step::Jump(ip as i64 + self.jump_operand(instr)?));
                }
                // a recursive repetition ends when the record it opened is
                // gone; control returns behind the REPEAT_FRAG
                if let Some(&(return_ip, depth)) = self.repeat_stack.last()
                    && self.frames.top_depth() + 1 == depth
                {
                    self.repeat_stack.pop();
                    return Ok(Step::Jump(return_ip as i64));
                }
            }
            OpCode::RepeatFrag => {
                let name = self.ident(instr)?.name().to_owned();
                if self.frames.open_frag(&name)? {
                    self.repeat_stack.push((ip + 1, self.frames.top_depth()));
                    return Ok(Step::Jump(ip as i64 + self.jump_operand(instr)?));
                }
            }
            OpCode::OpenFrame => self.frames.open_frame()?,
            OpCode::CloseFrame => self.frames.close_frame()?,

            OpCode::FragCount
            | OpCode::FragIndex
            | OpCode::FragFirst
            | OpCode::FragInner
            | OpCode::FragLast => self.exec_list_pos(instr)?,
            OpCode::NestedFragCount => {
                let ident = self.ident(instr)?.clone();
                let value = self.frames.get_var(&ident)?;
                let result = match value.count() {
                    Some(count) => Value::Int(count as i64),
                    None => {
                        self.warn(
                            pos,
                            format!("Fragment '{}' is missing", ident.display_path()),
                        );
                        Value::Undefined
                    }
                };
                self.stack.push(result);
            }

            OpCode::Print => {
                let value = self.pop(pos)?;
                let text = if instr.escape {
                    self.escaper.escape(&value.to_printable())
                } else {
                    value.to_printable().into_owned()
                };
                self.write_out(&text, pos)?;
            }
            OpCode::PushFmt => {
                if self.eval {
                    return Err(RunError::NeedsRuntime);
                }
                let id = self.int_operand(instr)?;
                let mode = if self.config.features().format {
                    FormatMode::from_id(id)
                        .ok_or_else(|| self.fatal(pos, "Malformed format instruction"))?
                } else {
                    FormatMode::PassWhite
                };
                let formatter = self
                    .formatter
                    .as_mut()
                    .ok_or(RunError::NeedsRuntime)?;
                if formatter.push(mode).is_err() {
                    return Err(self.fatal(pos, "Error writing to output"));
                }
            }
            OpCode::PopFmt => {
                let formatter = self
                    .formatter
                    .as_mut()
                    .ok_or(RunError::NeedsRuntime)?;
                match formatter.pop() {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        self.recoverable(pos, "Cannot pop format mode -- only one remains.");
                    }
                    Err(_) => return Err(self.fatal(pos, "Error writing to output")),
                }
            }
            OpCode::PushCt => {
                if self.eval {
                    return Err(RunError::NeedsRuntime);
                }
                let index = self.int_operand(instr)?;
                let pos_clone = pos.clone();
                self.escaper.push(index as usize, &pos_clone, self.log);
            }
            OpCode::PopCt => {
                let pos_clone = pos.clone();
                self.escaper.pop(&pos_clone, self.log);
            }

            OpCode::Debug => {
                if self.eval {
                    return Err(RunError::NeedsRuntime);
                }
                if self.config.features().debug {
                    let dump = self.debug_dump();
                    self.write_out(&dump, pos)?;
                }
            }
            OpCode::Bytecode => {
                if self.eval {
                    return Err(RunError::NeedsRuntime);
                }
                if self.config.features().bytecode
                    && let Some(program) = self.program
                {
                    let dump = program.dump();
                    self.write_out(&dump, pos)?;
                }
            }

            OpCode::Exists => {
                let value = self.pop(pos)?;
                self.stack.push(Value::from(!value.is_undefined()));
            }
            OpCode::Defined => {
                self.warn(pos, "The defined() operator is deprecated");
                let value = self.pop(pos)?;
                self.stack.push(Value::from(!matches!(
                    value,
                    Value::Undefined | Value::FragRef(_) | Value::ListRef(_)
                )));
            }
            OpCode::IsEmpty => {
                let value = self.pop(pos)?;
                self.stack
                    .push(Value::from(value.is_undefined() || value.is_empty_value()));
            }
            OpCode::Repr => {
                let value = self.pop(pos)?;
                self.stack.push(value);
            }
            OpCode::Type => {
                let value = self.pop(pos)?;
                self.stack.push(Value::String(value.tag_name().to_owned()));
            }
            OpCode::Count => {
                let value = self.pop(pos)?;
                let result = match value.count() {
                    Some(count) => Value::Int(count as i64),
                    None if value.is_undefined() => Value::Undefined,
                    None => {
                        self.recoverable(pos, "count() applied to a scalar value");
                        Value::Undefined
                    }
                };
                self.stack.push(result);
            }
            OpCode::Jsonify => {
                let value = self.pop(pos)?;
                let mut out = String::new();
                value.json_to(&mut out);
                self.stack.push(Value::String(out));
            }

            OpCode::GetAttr => {
                let name = self.ident(instr)?.name().to_owned();
                let value = self.pop(pos)?;
                let attr = self.frames.frag_attr(&value, &name)?;
                self.stack.push(attr);
            }
            OpCode::At => {
                let index = self.pop(pos)?;
                let value = self.pop(pos)?;
                let item = self.frames.value_at(&value, &index)?;
                self.stack.push(item);
            }

            OpCode::Func => self.exec_func(instr)?,
        }
        Ok(Step::Next)
    }

    // === instruction helpers ===============================================

    fn exec_var(&mut self, instr: &Instruction) -> Result<(), RunError> {
        let ident = self.ident(instr)?.clone();
        let value = if ident.offsets.is_some() {
            self.frames.get_var(&ident)?
        } else {
            if self.eval {
                return Err(RunError::NeedsRuntime);
            }
            Value::Undefined
        };
        if value.is_undefined() {
            self.warn(
                &instr.pos,
                format!("Variable '{}' is undefined", ident.display_path()),
            );
        }
        let value = if instr.escape {
            match value.as_str() {
                Some(text) => Value::String(self.escaper.escape(text)),
                None => value,
            }
        } else {
            value
        };
        self.stack.push(value);
        Ok(())
    }

    fn exec_set(&mut self, instr: &Instruction) -> Result<(), RunError> {
        let ident = self.ident(instr)?.clone();
        let value = self.pop(&instr.pos)?;
        if ident.offsets.is_none() {
            self.warn(
                &instr.pos,
                format!("Cannot set variable '{}'", ident.display_path()),
            );
            return Ok(());
        }
        if !self.frames.set_var(&ident, value)? {
            self.recoverable(
                &instr.pos,
                format!(
                    "Cannot set variable '{}': it is present in application data",
                    ident.display_path()
                ),
            );
        }
        Ok(())
    }

    fn exec_dict_lookup(&mut self, pos: &Position) -> Result<(), RunError> {
        let key_value = self.pop(pos)?;
        let key = key_value.to_string_value();
        let found = self
            .dict
            .lookup(&key)
            .or_else(|| self.config.lookup(&key))
            .map(str::to_owned);
        match found {
            Some(text) => self.stack.push(Value::String(text)),
            None => {
                if self.eval {
                    return Err(RunError::NeedsRuntime);
                }
                self.recoverable(pos, format!("Dictionary item '{key}' was not found"));
                self.stack.push(Value::String(key.into_owned()));
            }
        }
        Ok(())
    }

    fn exec_arithmetic(&mut self, op: OpCode, pos: &Position) -> Result<(), RunError> {
        let rhs = self.pop(pos)?;
        let lhs = self.pop(pos)?;
        if lhs.is_undefined() || rhs.is_undefined() {
            self.stack.push(Value::Undefined);
            return Ok(());
        }
        let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
            self.recoverable(pos, "Arithmetic with non-numeric operand");
            self.stack.push(Value::Undefined);
            return Ok(());
        };

        let result = match (op, a, b) {
            (OpCode::Add, Number::Int(x), Number::Int(y)) => Value::Int(x.wrapping_add(y)),
            (OpCode::Sub, Number::Int(x), Number::Int(y)) => Value::Int(x.wrapping_sub(y)),
            (OpCode::Mul, Number::Int(x), Number::Int(y)) => Value::Int(x.wrapping_mul(y)),
            (OpCode::Div, Number::Int(x), Number::Int(y)) => {
                if y == 0 {
                    self.recoverable(pos, "Division by zero");
                    Value::Undefined
                } else {
                    Value::Int(x.wrapping_div(y))
                }
            }
            (OpCode::Mod, _, _) => {
                let (x, y) = (a.as_real() as i64, b.as_real() as i64);
                if y == 0 {
                    self.recoverable(pos, "Modulo by zero");
                    Value::Undefined
                } else {
                    Value::Int(x.wrapping_rem(y))
                }
            }
            (OpCode::Add, _, _) => Value::Real(a.as_real() + b.as_real()),
            (OpCode::Sub, _, _) => Value::Real(a.as_real() - b.as_real()),
            (OpCode::Mul, _, _) => Value::Real(a.as_real() * b.as_real()),
            (OpCode::Div, _, _) => {
                if b.as_real() == 0.0 {
                    self.recoverable(pos, "Division by zero");
                    Value::Undefined
                } else {
                    Value::Real(a.as_real() / b.as_real())
                }
            }
            _ => unreachable!("arithmetic dispatch covers all five opcodes"),
        };
        self.stack.push(result);
        Ok(())
    }

    fn exec_bitwise(&mut self, op: OpCode, pos: &Position) -> Result<(), RunError> {
        let rhs = self.pop(pos)?;
        let lhs = self.pop(pos)?;
        if lhs.is_undefined() || rhs.is_undefined() {
            self.stack.push(Value::Undefined);
            return Ok(());
        }
        let (Some(Number::Int(x)), Some(Number::Int(y))) = (lhs.as_number(), rhs.as_number())
        else {
            self.recoverable(pos, "Bitwise operation with non-integral operand");
            self.stack.push(Value::Undefined);
            return Ok(());
        };
        let result = match op {
            OpCode::BitAnd => x & y,
            OpCode::BitOr => x | y,
            OpCode::BitXor => x ^ y,
            _ => unreachable!("bitwise dispatch covers three opcodes"),
        };
        self.stack.push(Value::Int(result));
        Ok(())
    }

    fn exec_numeric_comparison(&mut self, op: OpCode, pos: &Position) -> Result<(), RunError> {
        let rhs = self.pop(pos)?;
        let lhs = self.pop(pos)?;
        if lhs.is_undefined() || rhs.is_undefined() {
            self.stack.push(Value::Undefined);
            return Ok(());
        }
        let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
            self.warn(pos, "Numeric comparison with non-numeric operand");
            self.stack.push(Value::Undefined);
            return Ok(());
        };
        let result = match (a, b) {
            (Number::Int(x), Number::Int(y)) => match op {
                OpCode::NumEq => x == y,
                OpCode::NumGe => x >= y,
                _ => x > y,
            },
            _ => {
                let (x, y) = (a.as_real(), b.as_real());
                match op {
                    OpCode::NumEq => x == y,
                    OpCode::NumGe => x >= y,
                    _ => x > y,
                }
            }
        };
        self.stack.push(Value::from(result));
        Ok(())
    }

    fn exec_list_pos(&mut self, instr: &Instruction) -> Result<(), RunError> {
        let ident = self.ident(instr)?.clone();
        let pos = self.frames.list_pos(&ident)?;
        let result = if pos.valid {
            match instr.op {
                OpCode::FragCount => Value::Int(pos.size as i64),
                OpCode::FragIndex => Value::Int(pos.index as i64),
                OpCode::FragFirst => Value::from(pos.index == 0),
                OpCode::FragLast => Value::from(pos.index + 1 == pos.size),
                _ => Value::from(pos.index > 0 && pos.index + 1 < pos.size),
            }
        } else {
            self.warn(
                &instr.pos,
                format!("Fragment '{}' is not being iterated", ident.display_path()),
            );
            Value::Undefined
        };
        self.stack.push(result);
        Ok(())
    }

    fn exec_func(&mut self, instr: &Instruction) -> Result<(), RunError> {
        let pos = &instr.pos;
        let name = self.ident(instr)?.name().to_owned();
        let argc = self.int_operand(instr)? as usize;
        if self.stack.len() < argc {
            return Err(self.fatal(pos, "Value stack underflow"));
        }
        let mut args = self.stack.split_off(self.stack.len() - argc);
        debug_assert_eq!(args.len(), argc);

        if let Some(entry) = functions::find(&name) {
            if self.eval && !entry.pure {
                return Err(RunError::NeedsRuntime);
            }
            let mut ctx = FunctionCtx::new(&*self.escaper, &self.encoding);
            let result = (entry.handler)(&args, &mut ctx);
            let errors = std::mem::take(&mut ctx.errors);
            drop(ctx);
            if self.eval && (!errors.is_empty() || result.is_err()) {
                // keep the call for the runtime so the errors get reported
                return Err(RunError::NeedsRuntime);
            }
            for message in errors {
                self.recoverable(pos, message);
            }
            match result {
                Ok(value) => self.stack.push(value),
                Err(message) => {
                    self.recoverable(pos, message);
                    self.stack.push(functions::undefined_result());
                }
            }
            return Ok(());
        }

        if let Some(handler) = self.udf.find(&name) {
            if self.eval {
                return Err(RunError::NeedsRuntime);
            }
            match handler(&args) {
                Ok(value) => self.stack.push(value),
                Err(message) => {
                    self.recoverable(pos, format!("{name}(): {message}"));
                    self.stack.push(functions::undefined_result());
                }
            }
            return Ok(());
        }

        if self.eval {
            return Err(RunError::NeedsRuntime);
        }
        self.recoverable(pos, format!("Unknown function {name}()"));
        args.clear();
        self.stack.push(functions::undefined_result());
        Ok(())
    }

    // === small helpers =====================================================

    fn pop(&mut self, pos: &Position) -> Result<Value<'a>, RunError> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.fatal(pos, "Value stack underflow")),
        }
    }

    fn peek(&mut self, pos: &Position) -> Result<&Value<'a>, RunError> {
        if self.stack.is_empty() {
            return Err(self.fatal(pos, "Value stack underflow"));
        }
        Ok(self.stack.last().expect("checked non-empty"))
    }

    fn ident<'i>(&mut self, instr: &'i Instruction) -> Result<&'i Identifier, RunError> {
        match &instr.ident {
            Some(ident) => Ok(ident),
            None => Err(self.fatal(&instr.pos, "Malformed instruction: missing identifier")),
        }
    }

    fn int_operand(&mut self, instr: &Instruction) -> Result<i64, RunError> {
        match instr.value {
            Value::Int(v) => Ok(v),
            _ => Err(self.fatal(&instr.pos, "Malformed instruction: missing operand")),
        }
    }

    fn jump_operand(&mut self, instr: &Instruction) -> Result<i64, RunError> {
        self.int_operand(instr)
    }

    fn write_out(&mut self, text: &str, pos: &Position) -> Result<(), RunError> {
        let Some(formatter) = self.formatter.as_mut() else {
            return Err(RunError::NeedsRuntime);
        };
        if formatter.write(text).is_err() {
            return Err(self.fatal(pos, "Error writing to output"));
        }
        Ok(())
    }

    fn fatal(&mut self, pos: &Position, msg: impl Into<String>) -> RunError {
        if self.eval {
            // the runtime will hit and report the same condition
            return RunError::NeedsRuntime;
        }
        self.log.append(Level::Fatal, pos, msg);
        RunError::Fatal
    }

    fn recoverable(&mut self, pos: &Position, msg: impl Into<String>) {
        self.log.append(Level::Error, pos, msg);
    }

    fn warn(&mut self, pos: &Position, msg: impl Into<String>) {
        self.log.append(Level::Warning, pos, msg);
    }

    // === debug dump ========================================================

    fn debug_dump(&self) -> String {
        let max_len = self.config.features().max_debug_val_length;
        let mut out = String::from("Template sources:\n");
        if let Some(program) = self.program {
            for name in program.sources().names() {
                let _ = writeln!(out, "    {name}");
            }
        }
        out.push_str("\nLanguage dictionary:\n");
        for line in self.dict.dump().lines().take(200) {
            let _ = writeln!(out, "    {line}");
        }
        out.push('\n');
        out.push_str(&self.config.to_string());
        out.push_str("\nApplication data:\n");
        if let Some(root) = self.frames.root() {
            dump_fragment(&mut out, root, 1, max_len);
        }
        out
    }
}

enum Step {
    Next,
    Jump(i64),
    Halt,
}

/// Clips a debug value to `max_len` characters, appending dots.
fn clip(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_len.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn dump_fragment(out: &mut String, frag: &Fragment, indent: usize, max_len: usize) {
    let pad = "    ".repeat(indent);
    for (name, value) in frag.iter() {
        match value {
            FragmentValue::Int(v) => {
                let _ = writeln!(out, "{pad}{name}: {v}");
            }
            FragmentValue::Real(v) => {
                let _ = writeln!(out, "{pad}{name}: {}", crate::value::real_to_string(*v));
            }
            FragmentValue::String(v) => {
                let _ = writeln!(out, "{pad}{name}: '{}'", clip(v, max_len));
            }
            FragmentValue::Frag(inner) => {
                let _ = writeln!(out, "{pad}{name}:");
                dump_fragment(out, inner, indent + 1, max_len);
            }
            FragmentValue::List(list) => {
                for (i, item) in list.iter().enumerate() {
                    let _ = writeln!(out, "{pad}{name}[{i}]:");
                    if let FragmentValue::Frag(inner) = item {
                        dump_fragment(out, inner, indent + 1, max_len);
                    }
                }
            }
        }
    }
}

/// Evaluates a freshly parsed instruction range at compile time.
///
/// Returns the constant value when the range is computable without
/// application data and without raising any diagnostics; `None` means "keep
/// the instructions for the runtime".
#[must_use]
pub fn evaluate(
    instructions: &[Instruction],
    dict: &Dictionary,
    config: &Configuration,
    udf: &UdfRegistry,
    encoding: &str,
) -> Option<Value<'static>> {
    let mut frames = ConstFrames;
    let mut escaper = Escaper::new(crate::contenttype::default_descriptor());
    let mut log = ErrorLog::new();
    let mut machine = Processor {
        instructions,
        frames: &mut frames,
        escaper: &mut escaper,
        formatter: None,
        dict,
        config,
        udf,
        log: &mut log,
        encoding: encoding.to_ascii_lowercase(),
        program: None,
        eval: true,
        stack: Vec::new(),
        prog_stack: Vec::new(),
        repeat_stack: Vec::new(),
    };
    machine.run().ok()?;
    if !machine.log.is_empty() || machine.stack.len() != 1 {
        return None;
    }
    machine.stack.pop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    fn instr_val(value: Value<'static>) -> Instruction {
        Instruction::with_value(OpCode::Val, value, Position::whole_file(None))
    }

    fn instr(op: OpCode) -> Instruction {
        Instruction::new(op, Position::whole_file(None))
    }

    fn eval_instrs(instructions: &[Instruction]) -> Option<Value<'static>> {
        let dict = Dictionary::new("");
        let config = Configuration::new("");
        let udf = UdfRegistry::new();
        evaluate(instructions, &dict, &config, &udf, "utf-8")
    }

    #[test]
    fn folds_constant_arithmetic() {
        let program = [instr_val(Value::Int(2)), instr_val(Value::Int(3)), instr(OpCode::Mul)];
        assert!(matches!(eval_instrs(&program), Some(Value::Int(6))));
    }

    #[test]
    fn mixed_promotes_to_real() {
        let program = [
            instr_val(Value::Int(1)),
            instr_val(Value::Real(0.5)),
            instr(OpCode::Add),
        ];
        assert!(matches!(eval_instrs(&program), Some(Value::Real(v)) if (v - 1.5).abs() < 1e-12));
    }

    #[test]
    fn division_by_zero_does_not_fold() {
        let program = [instr_val(Value::Int(1)), instr_val(Value::Int(0)), instr(OpCode::Div)];
        assert!(eval_instrs(&program).is_none());
    }

    #[test]
    fn variables_do_not_fold() {
        let ident = Identifier {
            path: smallvec::smallvec!["x".to_owned()],
            offsets: Some((0, 0)),
        };
        let program = [Instruction::with_ident(
            OpCode::Var,
            ident,
            Position::whole_file(None),
        )];
        assert!(eval_instrs(&program).is_none());
    }

    #[test]
    fn impure_functions_do_not_fold() {
        let ident = Identifier {
            path: smallvec::smallvec!["now".to_owned()],
            offsets: None,
        };
        let mut call = Instruction::with_ident(OpCode::Func, ident, Position::whole_file(None));
        call.value = Value::Int(0);
        assert!(eval_instrs(&[call]).is_none());
    }

    #[test]
    fn pure_function_folds() {
        let ident = Identifier {
            path: smallvec::smallvec!["int".to_owned()],
            offsets: None,
        };
        let mut call = Instruction::with_ident(OpCode::Func, ident, Position::whole_file(None));
        call.value = Value::Int(1);
        let program = [instr_val(Value::Real(2.9)), call];
        assert!(matches!(eval_instrs(&program), Some(Value::Int(2))));
    }

    #[test]
    fn concat_stringifies() {
        let program = [
            instr_val(Value::Int(1)),
            instr_val(Value::String("x".to_owned())),
            instr(OpCode::Concat),
        ];
        assert!(matches!(eval_instrs(&program), Some(Value::String(s)) if s == "1x"));
    }
}
