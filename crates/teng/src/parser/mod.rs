//! Template compiler: directives and expressions to byte-code.
//!
//! A recursive-descent parser over the level-2 token stream. Includes are
//! expanded in place at parse time, so one program covers a whole include
//! tree. Error recovery is per directive: a syntax error drains the
//! diagnostic stack into the log, truncates the directive's partial
//! byte-code, and parsing resumes at the next directive boundary.
//!
//! Whenever a complete expression has been emitted, the parser hands the
//! fresh instruction range to the interpreter running on stub frames; if the
//! range evaluates without touching runtime data it collapses into a single
//! `VAL` instruction.

mod diag;

pub use diag::{DiagCode, DiagStack};

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    bytecode::{Addr, Identifier, Instruction, OpCode, Program, ProgramBuilder},
    configuration::Configuration,
    contenttype,
    dictionary::Dictionary,
    error::{ErrorLog, Level},
    filesystem::{Filesystem, abs_path},
    formatter::FormatMode,
    functions::UdfRegistry,
    lex1::{Lex1, Lex1Kind},
    lex2::{BuiltinVar, Lex2, Token, TokenKind},
    position::Position,
    processor,
    regex::{RegexFlags, RegexValue},
    value::Value,
};

/// Everything a compile needs besides the source itself.
pub struct CompileParams<'p> {
    pub filesystem: &'p dyn Filesystem,
    pub fs_root: &'p str,
    pub dict: &'p Dictionary,
    pub config: &'p Configuration,
    pub udf: &'p UdfRegistry,
    pub encoding: &'p str,
}

/// Compiles a template file.
pub fn compile_file(params: &CompileParams<'_>, filename: &str, log: &mut ErrorLog) -> Program {
    let mut parser = Parser::new(params, log);
    let pos = Position::whole_file(None);
    parser.include_file(filename, &pos);
    parser.finish()
}

/// Compiles an inline template string.
pub fn compile_string(params: &CompileParams<'_>, source: &str, log: &mut ErrorLog) -> Program {
    let mut parser = Parser::new(params, log);
    parser.parse_source(source, Position::whole_file(None));
    parser.finish()
}

/// Token stream with one-token lookahead over a directive body.
struct TokenStream<'s> {
    lex: Lex2<'s>,
    current: Token,
}

impl<'s> TokenStream<'s> {
    fn new(body: &'s str, pos: Position) -> Self {
        let mut lex = Lex2::new(body, pos);
        let current = lex.next_token();
        Self { lex, current }
    }

    fn peek(&self) -> &Token {
        &self.current
    }

    /// Consumes the current token and returns it.
    fn advance(&mut self) -> Token {
        std::mem::replace(&mut self.current, self.lex.next_token())
    }

    /// Like [`Self::advance`], but the following token may be a regex
    /// literal.
    fn advance_expecting_regex(&mut self) -> Token {
        let next = self
            .lex
            .next_regex()
            .unwrap_or_else(|| self.lex.next_token());
        std::mem::replace(&mut self.current, next)
    }
}

/// Compile-time mirror of one runtime frame: the names of open fragments.
#[derive(Debug, Default)]
struct CompileFrame {
    open: Vec<String>,
}

/// Open block directives awaiting their closing counterpart.
enum Block {
    Frag {
        opens: Vec<Addr>,
        segments: usize,
        new_frame: bool,
        pos: Position,
    },
    If {
        pending: Option<Addr>,
        end_jumps: Vec<Addr>,
        seen_else: bool,
        pos: Position,
    },
    Format {
        pos: Position,
    },
    Ctype {
        pos: Position,
    },
}

/// A parsed variable path.
struct VarPath {
    absolute: bool,
    /// `Some(n)`: path starts with `_this` (0) or n times `_parent`.
    leading: Option<u16>,
    segments: SmallVec<[String; 4]>,
    trailing: Option<BuiltinVar>,
    pos: Position,
}

/// Consecutive failed directives tolerated before the compile gives up.
const MAX_CONSECUTIVE_FAILURES: usize = 8;

struct Parser<'p, 'l> {
    params: &'p CompileParams<'p>,
    log: &'l mut ErrorLog,
    builder: ProgramBuilder,
    frames: Vec<CompileFrame>,
    blocks: Vec<Block>,
    diag: DiagStack,
    include_stack: Vec<String>,
    failures: usize,
    abandoned: bool,
    last_pos: Position,
}

impl<'p, 'l> Parser<'p, 'l> {
    fn new(params: &'p CompileParams<'p>, log: &'l mut ErrorLog) -> Self {
        Self {
            params,
            log,
            builder: ProgramBuilder::new(),
            frames: vec![CompileFrame::default()],
            blocks: Vec::new(),
            diag: DiagStack::new(),
            include_stack: Vec::new(),
            failures: 0,
            abandoned: false,
            last_pos: Position::whole_file(None),
        }
    }

    fn finish(mut self) -> Program {
        // unfinished blocks get synthesized closes so the program stays
        // well-formed; the log tells the author what is missing
        while let Some(block) = self.blocks.pop() {
            match block {
                Block::Frag {
                    opens,
                    segments,
                    new_frame,
                    pos,
                } => {
                    self.err(&pos, "Missing <?teng endfrag?> directive");
                    self.close_frag_block(&opens, segments, new_frame, &pos);
                }
                Block::If { pending, end_jumps, pos, .. } => {
                    self.err(&pos, "Missing <?teng endif?> directive");
                    if let Some(addr) = pending {
                        self.builder.patch_jump_here(addr);
                    }
                    for addr in end_jumps {
                        self.builder.patch_jump_here(addr);
                    }
                }
                Block::Format { pos } => {
                    self.err(&pos, "Missing <?teng endformat?> directive");
                    self.builder.emit(OpCode::PopFmt, &pos);
                }
                Block::Ctype { pos } => {
                    self.err(&pos, "Missing <?teng endctype?> directive");
                    self.builder.emit(OpCode::PopCt, &pos);
                }
            }
        }
        let pos = self.last_pos.clone();
        self.builder.build(&pos)
    }

    // === top level ========================================================

    fn parse_source(&mut self, source: &str, start: Position) {
        let mut lex1 = Lex1::new(source, start);
        loop {
            if self.abandoned {
                return;
            }
            let token = lex1.next_token(self.params.config.features().short_tag);
            self.last_pos = token.pos.clone();
            match token.kind {
                Lex1Kind::Text => {
                    if !token.view.is_empty() {
                        self.builder.emit_value(
                            OpCode::Val,
                            Value::String(token.view.into_owned()),
                            &token.pos,
                        );
                        self.builder.emit(OpCode::Print, &token.pos);
                    }
                }
                Lex1Kind::Teng | Lex1Kind::TengShort => {
                    self.directive(&token.view, token.pos, token.body_pos);
                }
                Lex1Kind::Expr => self.expression_directive(&token.view, token.pos),
                Lex1Kind::Dict => self.dict_directive(&token.view, &token.pos),
                Lex1Kind::Error => {
                    self.log.append(Level::Fatal, &token.pos, token.view.into_owned());
                    return;
                }
                Lex1Kind::EndOfInput => return,
            }
        }
    }

    fn directive(&mut self, body: &str, pos: Position, body_pos: Position) {
        let start = self.builder.addr();
        let mut lex = TokenStream::new(body, body_pos);

        let head = lex.advance();
        let TokenKind::Ident(name) = head.kind else {
            self.err(&head.pos, "Invalid or missing directive name");
            self.recover(start);
            return;
        };

        let ok = match name.as_str() {
            "frag" => self.dir_frag(&mut lex, &pos),
            "endfrag" => self.dir_endfrag(&mut lex, &pos),
            "repeatfrag" => self.dir_repeatfrag(&mut lex, &pos),
            "if" => self.dir_if(&mut lex, &pos),
            "elif" | "elseif" => self.dir_elif(&mut lex, &pos),
            "else" => self.dir_else(&mut lex, &pos),
            "endif" => self.dir_endif(&mut lex, &pos),
            "set" => self.dir_set(&mut lex, &pos),
            "format" => self.dir_format(&mut lex, &pos),
            "endformat" => self.dir_endformat(&mut lex, &pos),
            "ctype" => self.dir_ctype(&mut lex, &pos),
            "endctype" => self.dir_endctype(&mut lex, &pos),
            "include" => self.dir_include(&mut lex, &pos),
            "debug" => self.dir_simple(&mut lex, OpCode::Debug, &pos),
            "bytecode" => self.dir_simple(&mut lex, OpCode::Bytecode, &pos),
            _ => {
                self.err(&pos, format!("Unknown directive '{name}'"));
                false
            }
        };

        if ok {
            self.failures = 0;
            self.diag.clear();
        } else {
            self.recover(start);
        }
    }

    fn recover(&mut self, start: Addr) {
        self.diag.drain_into(self.log);
        self.builder.truncate(start);
        self.failures += 1;
        if self.failures >= MAX_CONSECUTIVE_FAILURES {
            let pos = self.last_pos.clone();
            self.log
                .append(Level::Fatal, &pos, "Too many syntax errors, giving up");
            self.abandoned = true;
        }
    }

    // === directives =======================================================

    fn dir_frag(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        self.diag.push(DiagCode::FragIdentifier, pos);
        let Some(path) = self.parse_path(lex) else {
            return false;
        };
        if path.leading.is_some() || path.trailing.is_some() || path.segments.is_empty() {
            self.err(&path.pos, "Invalid fragment identifier");
            return false;
        }
        if !self.expect_end(lex) {
            return false;
        }
        self.diag.pop(DiagCode::FragIdentifier);

        let open_names = &self.frames.last().expect("frame sim never empty").open;
        let (new_frame, to_open) = if path.absolute {
            let extends = path.segments.len() > open_names.len()
                && path.segments[..open_names.len()] == open_names[..];
            if extends {
                (false, path.segments[open_names.len()..].to_vec())
            } else {
                (true, path.segments.to_vec())
            }
        } else {
            (false, path.segments.to_vec())
        };

        if new_frame {
            self.builder.emit(OpCode::OpenFrame, pos);
            self.frames.push(CompileFrame::default());
        }
        let mut opens = Vec::with_capacity(to_open.len());
        for segment in &to_open {
            let ident = Identifier {
                path: SmallVec::from_iter([segment.clone()]),
                offsets: None,
            };
            let addr = self.builder.push(Instruction {
                op: OpCode::OpenFrag,
                value: Value::Int(0),
                ident: Some(ident),
                escape: false,
                pos: pos.clone(),
            });
            opens.push(addr);
            self.frames
                .last_mut()
                .expect("frame sim never empty")
                .open
                .push(segment.clone());
        }
        self.blocks.push(Block::Frag {
            opens,
            segments: to_open.len(),
            new_frame,
            pos: pos.clone(),
        });
        true
    }

    fn close_frag_block(&mut self, opens: &[Addr], segments: usize, new_frame: bool, pos: &Position) {
        for &open_addr in opens.iter().rev() {
            let close_addr = self.builder.push(Instruction {
                op: OpCode::CloseFrag,
                value: Value::Int(0),
                ident: None,
                escape: false,
                pos: pos.clone(),
            });
            // iterate back to the first body instruction; skip lands just
            // past the close so outer segments still advance
            self.builder.patch_jump(close_addr, open_addr + 1);
            self.builder.patch_jump(open_addr, close_addr + 1);
        }
        let frame = self.frames.last_mut().expect("frame sim never empty");
        let keep = frame.open.len().saturating_sub(segments);
        frame.open.truncate(keep);
        if new_frame {
            self.builder.emit(OpCode::CloseFrame, pos);
            if self.frames.len() > 1 {
                self.frames.pop();
            }
        }
    }

    fn dir_endfrag(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        if !self.expect_end(lex) {
            return false;
        }
        match self.blocks.pop() {
            Some(Block::Frag {
                opens,
                segments,
                new_frame,
                ..
            }) => {
                self.close_frag_block(&opens, segments, new_frame, pos);
                true
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                self.err(pos, "The <?teng endfrag?> directive closes nothing");
                false
            }
        }
    }

    /// `<?teng repeatfrag NAME?>`: inside the block of fragment NAME,
    /// descend into the like-named child list and re-run the block's body,
    /// rendering trees recursively.
    fn dir_repeatfrag(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        self.diag.push(DiagCode::FragIdentifier, pos);
        let Some(path) = self.parse_path(lex) else {
            return false;
        };
        if path.leading.is_some() || path.trailing.is_some() || path.segments.len() != 1 {
            self.err(&path.pos, "Invalid fragment identifier in repeatfrag");
            return false;
        }
        if !self.expect_end(lex) {
            return false;
        }
        self.diag.pop(DiagCode::FragIdentifier);

        let name = &path.segments[0];
        // the innermost enclosing frag block whose last segment is NAME
        let body_start = self.blocks.iter().rev().find_map(|block| match block {
            Block::Frag { opens, .. } => {
                let open_addr = *opens.last()?;
                let matches = self
                    .builder
                    .instruction(open_addr)
                    .and_then(|instr| instr.ident.as_ref())
                    .is_some_and(|ident| ident.name() == name);
                matches.then_some(open_addr + 1)
            }
            _ => None,
        });
        let Some(body_start) = body_start else {
            self.err(
                pos,
                format!("The fragment '{name}' is not open, cannot repeat it"),
            );
            return false;
        };

        let addr = self.builder.push(Instruction {
            op: OpCode::RepeatFrag,
            value: Value::Int(0),
            ident: Some(Identifier {
                path: path.segments.clone(),
                offsets: None,
            }),
            escape: false,
            pos: pos.clone(),
        });
        self.builder.patch_jump(addr, body_start);
        true
    }

    fn dir_if(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        self.diag.push(DiagCode::IfCondition, pos);
        let start = self.builder.addr();
        if !self.expression(lex) || !self.expect_end(lex) {
            // keep the block structure so endif still matches; the branch
            // itself becomes dead
            self.diag.drain_into(self.log);
            self.builder.truncate(start);
            self.builder.emit_value(OpCode::Val, Value::Int(0), pos);
        } else {
            self.diag.pop(DiagCode::IfCondition);
            self.fold_expression(start, pos);
        }
        let pending = self.builder.emit_jump(OpCode::JmpIfNot, pos);
        self.blocks.push(Block::If {
            pending: Some(pending),
            end_jumps: Vec::new(),
            seen_else: false,
            pos: pos.clone(),
        });
        true
    }

    fn dir_elif(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        match self.blocks.last() {
            Some(Block::If { seen_else: false, .. }) => {}
            Some(Block::If { seen_else: true, .. }) => {
                self.err(pos, "The <?teng elif?> directive after else");
                return false;
            }
            _ => {
                self.err(pos, "The <?teng elif?> directive without matching if");
                return false;
            }
        }
        let previous = match self.blocks.last_mut() {
            Some(Block::If { pending, .. }) => pending.take(),
            _ => unreachable!("if block checked above"),
        };

        let end_jump = self.builder.emit_jump(OpCode::Jmp, pos);
        if let Some(addr) = previous {
            self.builder.patch_jump_here(addr);
        }

        self.diag.push(DiagCode::ElifCondition, pos);
        let start = self.builder.addr();
        if !self.expression(lex) || !self.expect_end(lex) {
            // drop the broken condition; the branch becomes dead but endif
            // keeps matching
            self.diag.drain_into(self.log);
            self.builder.truncate(start);
            self.builder.emit_value(OpCode::Val, Value::Int(0), pos);
        } else {
            self.diag.pop(DiagCode::ElifCondition);
            self.fold_expression(start, pos);
        }
        let new_pending = self.builder.emit_jump(OpCode::JmpIfNot, pos);
        let Some(Block::If {
            pending, end_jumps, ..
        }) = self.blocks.last_mut()
        else {
            unreachable!("if block checked above");
        };
        *pending = Some(new_pending);
        end_jumps.push(end_jump);
        true
    }

    fn dir_else(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        if !self.expect_end(lex) {
            return false;
        }
        match self.blocks.last() {
            Some(Block::If { seen_else: false, .. }) => {}
            Some(Block::If { seen_else: true, .. }) => {
                self.err(pos, "Second <?teng else?> directive");
                return false;
            }
            _ => {
                self.err(pos, "The <?teng else?> directive without matching if");
                return false;
            }
        }
        let end_jump = self.builder.emit_jump(OpCode::Jmp, pos);
        let previous = match self.blocks.last_mut() {
            Some(Block::If {
                pending,
                end_jumps,
                seen_else,
                ..
            }) => {
                *seen_else = true;
                end_jumps.push(end_jump);
                pending.take()
            }
            _ => unreachable!("if block checked above"),
        };
        if let Some(addr) = previous {
            self.builder.patch_jump_here(addr);
        }
        true
    }

    fn dir_endif(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        if !self.expect_end(lex) {
            return false;
        }
        match self.blocks.pop() {
            Some(Block::If {
                pending, end_jumps, ..
            }) => {
                if let Some(addr) = pending {
                    self.builder.patch_jump_here(addr);
                }
                for addr in end_jumps {
                    self.builder.patch_jump_here(addr);
                }
                true
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                self.err(pos, "The <?teng endif?> directive closes nothing");
                false
            }
        }
    }

    fn dir_set(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        self.diag.push(DiagCode::SetIdentifier, pos);
        // optional deprecated $ prefix
        if lex.peek().kind == TokenKind::Dollar {
            self.warn(pos, "The '$' prefixed variables are deprecated");
            lex.advance();
        }
        let Some(path) = self.parse_path(lex) else {
            return false;
        };
        if path.leading.is_some() || path.trailing.is_some() || path.segments.is_empty() {
            self.err(&path.pos, "Invalid variable identifier in set directive");
            return false;
        }
        self.diag.pop(DiagCode::SetIdentifier);

        if lex.peek().kind != TokenKind::Assign {
            self.err(&lex.peek().pos.clone(), "Expected '=' in set directive");
            return false;
        }
        lex.advance();

        self.diag.push(DiagCode::SetExpression, pos);
        let start = self.builder.addr();
        if !self.expression(lex) || !self.expect_end(lex) {
            return false;
        }
        self.diag.pop(DiagCode::SetExpression);
        self.fold_expression(start, pos);

        let frag_path = &path.segments[..path.segments.len() - 1];
        let Some((frame_off, frag_off)) = self.match_frag_path(path.absolute, frag_path) else {
            self.err(
                &path.pos,
                format!(
                    "Cannot set variable '{}': enclosing fragment is not open",
                    display_path(&path)
                ),
            );
            return false;
        };
        let ident = Identifier {
            path: path.segments.clone(),
            offsets: Some((frame_off, frag_off)),
        };
        self.builder.emit_ident(OpCode::Set, ident, pos);
        true
    }

    fn dir_format(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        self.diag.push(DiagCode::FormatOption, pos);
        let name = lex.advance();
        if !name.kind.is_ident("space") {
            self.err(&name.pos, "Expected space=\"...\" option in format directive");
            return false;
        }
        if lex.peek().kind != TokenKind::Assign {
            self.err(&lex.peek().pos.clone(), "Expected '=' in format directive");
            return false;
        }
        lex.advance();
        let value = lex.advance();
        let TokenKind::Str(mode_name) = value.kind else {
            self.err(&value.pos, "Expected quoted format mode name");
            return false;
        };
        if !self.expect_end(lex) {
            return false;
        }
        self.diag.pop(DiagCode::FormatOption);

        let mode = match FormatMode::resolve(&mode_name) {
            Some(mode) => mode,
            None => {
                self.err(&value.pos, format!("Unknown format mode '{mode_name}'"));
                FormatMode::PassWhite
            }
        };
        self.builder
            .emit_value(OpCode::PushFmt, Value::Int(mode.to_id()), pos);
        self.blocks.push(Block::Format { pos: pos.clone() });
        true
    }

    fn dir_endformat(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        if !self.expect_end(lex) {
            return false;
        }
        match self.blocks.pop() {
            Some(Block::Format { .. }) => {
                self.builder.emit(OpCode::PopFmt, pos);
                true
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                self.err(pos, "The <?teng endformat?> directive closes nothing");
                false
            }
        }
    }

    fn dir_ctype(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        self.diag.push(DiagCode::CtypeName, pos);
        let value = lex.advance();
        let TokenKind::Str(name) = value.kind else {
            self.err(&value.pos, "Expected quoted content type name");
            return false;
        };
        if !self.expect_end(lex) {
            return false;
        }
        self.diag.pop(DiagCode::CtypeName);

        let descriptor = contenttype::find_descriptor(&name, &value.pos, self.log);
        self.builder.emit_value(
            OpCode::PushCt,
            Value::Int(descriptor.index as i64),
            pos,
        );
        self.blocks.push(Block::Ctype { pos: pos.clone() });
        true
    }

    fn dir_endctype(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        if !self.expect_end(lex) {
            return false;
        }
        match self.blocks.pop() {
            Some(Block::Ctype { .. }) => {
                self.builder.emit(OpCode::PopCt, pos);
                true
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                self.err(pos, "The <?teng endctype?> directive closes nothing");
                false
            }
        }
    }

    fn dir_include(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        self.diag.push(DiagCode::IncludeOptions, pos);
        let mut file = None;
        loop {
            let token = lex.advance();
            let name = match token.kind {
                TokenKind::End => break,
                TokenKind::Ident(name) => name,
                _ => {
                    self.err(&token.pos, "Expected name=\"value\" include option");
                    return false;
                }
            };
            if lex.peek().kind != TokenKind::Assign {
                self.err(&lex.peek().pos.clone(), "Expected '=' in include option");
                return false;
            }
            lex.advance();
            let value = lex.advance();
            let TokenKind::Str(text) = value.kind else {
                self.err(&value.pos, "Expected quoted include option value");
                return false;
            };
            if name == "file" {
                file = Some(text);
            }
        }
        self.diag.pop(DiagCode::IncludeOptions);

        let Some(file) = file else {
            self.err(pos, "Missing file option in include directive");
            return false;
        };
        if self.include_stack.len() >= self.params.config.features().max_include_depth {
            self.log
                .append(Level::Fatal, pos, "Too many nested includes");
            return true;
        }
        self.include_file(&file, pos);
        true
    }

    fn include_file(&mut self, filename: &str, pos: &Position) {
        let path = abs_path(self.params.fs_root, filename);
        if self.include_stack.contains(&path) {
            self.err(pos, format!("Include cycle through '{path}'"));
            return;
        }
        let (_, interned) =
            self.builder
                .sources_mut()
                .push(self.params.filesystem, &path, pos, self.log);
        let source = match self.params.filesystem.read(&path) {
            Ok(source) => source,
            Err(error) => {
                self.err(pos, format!("Cannot include file: {error}"));
                return;
            }
        };
        self.include_stack.push(path);
        self.parse_source(&source, Position::start_of(Some(interned)));
        self.include_stack.pop();
    }

    fn dir_simple(&mut self, lex: &mut TokenStream<'_>, op: OpCode, pos: &Position) -> bool {
        if !self.expect_end(lex) {
            return false;
        }
        self.builder.emit(op, pos);
        true
    }

    // === ${...} and #{...} ================================================

    fn expression_directive(&mut self, body: &str, pos: Position) {
        let start = self.builder.addr();
        let mut lex = TokenStream::new(body, pos.clone());
        self.diag.push(DiagCode::PrintExpression, &pos);
        if !self.expression(&mut lex) || !self.expect_end(&mut lex) {
            self.recover(start);
            // a broken expression still renders as nothing
            return;
        }
        self.diag.pop(DiagCode::PrintExpression);
        self.failures = 0;
        self.fold_expression(start, &pos);

        // a bare variable carries its own escape flag; everything else is
        // escaped at print time when printescape is on
        let last_is_var = self
            .builder
            .instruction(self.builder.addr() - 1)
            .is_some_and(|instr| instr.op == OpCode::Var);
        let escape = !last_is_var && self.params.config.features().print_escape;
        let print = self.builder.emit(OpCode::Print, &pos);
        if let Some(instr) = self.builder.instruction_mut(print) {
            instr.escape = escape;
        }
    }

    fn dict_directive(&mut self, body: &str, pos: &Position) {
        let key = body.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.err(pos, format!("Invalid dictionary key '{key}'"));
            return;
        }
        let found = self
            .params
            .dict
            .lookup(key)
            .or_else(|| self.params.config.lookup(key))
            .map(str::to_owned);
        match found {
            Some(text) => {
                self.builder.emit_value(OpCode::Val, Value::String(text), pos);
            }
            None => {
                // leave the lookup to the runtime, which logs the miss
                self.builder
                    .emit_value(OpCode::Val, Value::String(key.to_owned()), pos);
                self.builder.emit(OpCode::DictLookup, pos);
            }
        }
        self.builder.emit(OpCode::Print, pos);
    }

    // === expressions ======================================================

    /// Entry point: the conditional operator has the lowest precedence.
    fn expression(&mut self, lex: &mut TokenStream<'_>) -> bool {
        self.expr_ternary(lex)
    }

    fn expr_ternary(&mut self, lex: &mut TokenStream<'_>) -> bool {
        if !self.expr_or(lex) {
            return false;
        }
        if lex.peek().kind != TokenKind::Question {
            return true;
        }
        let pos = lex.advance().pos;
        self.diag.push(DiagCode::TernaryBranch, &pos);

        let skip_then = self.builder.emit_jump(OpCode::JmpIfNot, &pos);
        if !self.expression(lex) {
            return false;
        }
        if lex.peek().kind != TokenKind::Colon {
            self.err(&lex.peek().pos.clone(), "Expected ':' of the conditional operator");
            return false;
        }
        lex.advance();
        let skip_else = self.builder.emit_jump(OpCode::Jmp, &pos);
        self.builder.patch_jump_here(skip_then);
        if !self.expression(lex) {
            return false;
        }
        self.builder.patch_jump_here(skip_else);
        self.diag.pop(DiagCode::TernaryBranch);
        true
    }

    fn expr_or(&mut self, lex: &mut TokenStream<'_>) -> bool {
        if !self.expr_and(lex) {
            return false;
        }
        while lex.peek().kind == TokenKind::Or {
            let pos = lex.advance().pos;
            let jump = self.builder.emit_jump(OpCode::Or, &pos);
            if !self.expr_and(lex) {
                return false;
            }
            self.builder.patch_jump_here(jump);
        }
        true
    }

    fn expr_and(&mut self, lex: &mut TokenStream<'_>) -> bool {
        if !self.expr_bitor(lex) {
            return false;
        }
        while lex.peek().kind == TokenKind::And {
            let pos = lex.advance().pos;
            let jump = self.builder.emit_jump(OpCode::And, &pos);
            if !self.expr_bitor(lex) {
                return false;
            }
            self.builder.patch_jump_here(jump);
        }
        true
    }

    fn expr_bitor(&mut self, lex: &mut TokenStream<'_>) -> bool {
        self.binary_level(lex, &[(TokenKind::BitOr, OpCode::BitOr)], Self::expr_bitxor)
    }

    fn expr_bitxor(&mut self, lex: &mut TokenStream<'_>) -> bool {
        self.binary_level(lex, &[(TokenKind::BitXor, OpCode::BitXor)], Self::expr_bitand)
    }

    fn expr_bitand(&mut self, lex: &mut TokenStream<'_>) -> bool {
        self.binary_level(lex, &[(TokenKind::BitAnd, OpCode::BitAnd)], Self::expr_equality)
    }

    fn expr_equality(&mut self, lex: &mut TokenStream<'_>) -> bool {
        if !self.expr_relational(lex) {
            return false;
        }
        loop {
            let (op, negate) = match lex.peek().kind {
                TokenKind::Eq => (OpCode::NumEq, false),
                TokenKind::Ne => (OpCode::NumEq, true),
                TokenKind::StrEq => (OpCode::StrEq, false),
                TokenKind::StrNe => (OpCode::StrNe, false),
                _ => return true,
            };
            let is_match_op = matches!(lex.peek().kind, TokenKind::StrEq | TokenKind::StrNe);
            let pos = if is_match_op {
                lex.advance_expecting_regex().pos
            } else {
                lex.advance().pos
            };

            if is_match_op && matches!(lex.peek().kind, TokenKind::Regex { .. }) {
                let token = lex.advance();
                let TokenKind::Regex { pattern, flags } = token.kind else {
                    unreachable!("peeked regex token");
                };
                if !self.emit_regex(&pattern, &flags, &token.pos) {
                    return false;
                }
                let match_op = if op == OpCode::StrEq {
                    OpCode::RegexMatch
                } else {
                    OpCode::RegexNotMatch
                };
                self.builder.emit(match_op, &pos);
                continue;
            }

            if !self.expr_relational(lex) {
                return false;
            }
            self.builder.emit(op, &pos);
            if negate {
                self.builder.emit(OpCode::Not, &pos);
            }
        }
    }

    fn expr_relational(&mut self, lex: &mut TokenStream<'_>) -> bool {
        if !self.expr_additive(lex) {
            return false;
        }
        loop {
            // < and <= are rewritten through >= and > with negation
            let (op, negate) = match lex.peek().kind {
                TokenKind::Ge => (OpCode::NumGe, false),
                TokenKind::Gt => (OpCode::NumGt, false),
                TokenKind::Lt => (OpCode::NumGe, true),
                TokenKind::Le => (OpCode::NumGt, true),
                _ => return true,
            };
            let pos = lex.advance().pos;
            if !self.expr_additive(lex) {
                return false;
            }
            self.builder.emit(op, &pos);
            if negate {
                self.builder.emit(OpCode::Not, &pos);
            }
        }
    }

    fn expr_additive(&mut self, lex: &mut TokenStream<'_>) -> bool {
        self.binary_level(
            lex,
            &[
                (TokenKind::Plus, OpCode::Add),
                (TokenKind::Minus, OpCode::Sub),
                (TokenKind::Concat, OpCode::Concat),
            ],
            Self::expr_multiplicative,
        )
    }

    fn expr_multiplicative(&mut self, lex: &mut TokenStream<'_>) -> bool {
        self.binary_level(
            lex,
            &[
                (TokenKind::Mul, OpCode::Mul),
                (TokenKind::Div, OpCode::Div),
                (TokenKind::Mod, OpCode::Mod),
                (TokenKind::Repeat, OpCode::Repeat),
            ],
            Self::expr_unary,
        )
    }

    fn binary_level(
        &mut self,
        lex: &mut TokenStream<'_>,
        table: &[(TokenKind, OpCode)],
        next: fn(&mut Self, &mut TokenStream<'_>) -> bool,
    ) -> bool {
        if !next(self, lex) {
            return false;
        }
        'outer: loop {
            for (kind, op) in table {
                if lex.peek().kind == *kind {
                    let pos = lex.advance().pos;
                    if !next(self, lex) {
                        return false;
                    }
                    self.builder.emit(*op, &pos);
                    continue 'outer;
                }
            }
            return true;
        }
    }

    fn expr_unary(&mut self, lex: &mut TokenStream<'_>) -> bool {
        match lex.peek().kind {
            TokenKind::Not => {
                let pos = lex.advance().pos;
                if !self.expr_unary(lex) {
                    return false;
                }
                self.builder.emit(OpCode::Not, &pos);
                true
            }
            TokenKind::BitNot => {
                let pos = lex.advance().pos;
                if !self.expr_unary(lex) {
                    return false;
                }
                self.builder.emit(OpCode::BitNot, &pos);
                true
            }
            TokenKind::Minus => {
                let pos = lex.advance().pos;
                // unary minus is a subtraction from zero; folding collapses
                // constant cases
                self.builder.emit_value(OpCode::Val, Value::Int(0), &pos);
                if !self.expr_unary(lex) {
                    return false;
                }
                self.builder.emit(OpCode::Sub, &pos);
                true
            }
            TokenKind::Plus => {
                lex.advance();
                self.expr_unary(lex)
            }
            _ => self.expr_postfix(lex),
        }
    }

    fn expr_postfix(&mut self, lex: &mut TokenStream<'_>) -> bool {
        if !self.expr_primary(lex) {
            return false;
        }
        loop {
            match lex.peek().kind {
                TokenKind::LBracket => {
                    let pos = lex.advance().pos;
                    if !self.expression(lex) {
                        return false;
                    }
                    if lex.peek().kind != TokenKind::RBracket {
                        self.err(&lex.peek().pos.clone(), "Expected ']'");
                        return false;
                    }
                    lex.advance();
                    self.builder.emit(OpCode::At, &pos);
                }
                TokenKind::Dot => {
                    let pos = lex.advance().pos;
                    let token = lex.advance();
                    let TokenKind::Ident(name) = token.kind else {
                        self.err(&token.pos, "Expected attribute name after '.'");
                        return false;
                    };
                    let ident = Identifier {
                        path: SmallVec::from_iter([name]),
                        offsets: None,
                    };
                    self.builder.emit_ident(OpCode::GetAttr, ident, &pos);
                }
                _ => return true,
            }
        }
    }

    fn expr_primary(&mut self, lex: &mut TokenStream<'_>) -> bool {
        let kind = lex.peek().kind.clone();
        match kind {
            TokenKind::Int(v) => {
                let pos = lex.advance().pos;
                self.builder.emit_value(OpCode::Val, Value::Int(v), &pos);
                true
            }
            TokenKind::Real(v) => {
                let pos = lex.advance().pos;
                self.builder.emit_value(OpCode::Val, Value::Real(v), &pos);
                true
            }
            TokenKind::Str(v) => {
                let pos = lex.advance().pos;
                self.builder.emit_value(OpCode::Val, Value::String(v), &pos);
                true
            }
            TokenKind::LParen => {
                lex.advance();
                if !self.expression(lex) {
                    return false;
                }
                if lex.peek().kind != TokenKind::RParen {
                    self.err(&lex.peek().pos.clone(), "Expected ')'");
                    return false;
                }
                lex.advance();
                true
            }
            TokenKind::Dollar => {
                let token = lex.advance();
                self.warn(&token.pos, "The '$' prefixed variables are deprecated");
                self.variable_reference(lex)
            }
            TokenKind::Ident(name) => {
                if self.peek_is_call(lex) {
                    let pos = lex.advance().pos;
                    lex.advance(); // consume '('
                    self.call_form(lex, &name, &pos)
                } else {
                    self.variable_reference(lex)
                }
            }
            TokenKind::Builtin(_) | TokenKind::Dot => self.variable_reference(lex),
            _ => {
                let token = lex.advance();
                self.err(
                    &token.pos,
                    format!("Unexpected token {} in expression", token.kind),
                );
                false
            }
        }
    }

    fn peek_is_call(&self, lex: &TokenStream<'_>) -> bool {
        // cheap lookahead: clone the lexer state is not possible, so peek at
        // the raw input instead
        lex.lex_peek_lparen()
    }

    /// Special forms and regular function calls.
    fn call_form(&mut self, lex: &mut TokenStream<'_>, name: &str, pos: &Position) -> bool {
        match name {
            "exists" | "defined" | "isempty" => {
                let Some(path) = self.parse_path(lex) else {
                    return false;
                };
                if !self.close_call(lex) {
                    return false;
                }
                if !self.emit_variable_silent(&path) {
                    return false;
                }
                let op = match name {
                    "exists" => OpCode::Exists,
                    "defined" => OpCode::Defined,
                    _ => OpCode::IsEmpty,
                };
                self.builder.emit(op, pos);
                true
            }
            "count" => {
                let Some(path) = self.parse_path(lex) else {
                    return false;
                };
                if !self.close_call(lex) {
                    return false;
                }
                if !self.emit_variable_silent(&path) {
                    return false;
                }
                self.builder.emit(OpCode::Count, pos);
                true
            }
            "type" | "repr" | "jsonify" => {
                if !self.expression(lex) || !self.close_call(lex) {
                    return false;
                }
                let op = match name {
                    "type" => OpCode::Type,
                    "repr" => OpCode::Repr,
                    _ => OpCode::Jsonify,
                };
                self.builder.emit(op, pos);
                true
            }
            "case" => self.case_form(lex, pos),
            _ => self.function_call(lex, name, pos),
        }
    }

    fn close_call(&mut self, lex: &mut TokenStream<'_>) -> bool {
        if lex.peek().kind != TokenKind::RParen {
            self.err(&lex.peek().pos.clone(), "Expected ')'");
            return false;
        }
        lex.advance();
        true
    }

    /// `case(expr, label[, label...]: result, ..., *: default)`
    fn case_form(&mut self, lex: &mut TokenStream<'_>, pos: &Position) -> bool {
        if !self.expression(lex) {
            return false;
        }
        self.builder.emit(OpCode::Push, pos);

        let mut end_jumps = Vec::new();
        let mut saw_default = false;
        loop {
            if lex.peek().kind != TokenKind::Comma {
                break;
            }
            lex.advance();
            self.diag.push(DiagCode::CaseLabel, pos);

            if lex.peek().kind == TokenKind::Mul {
                // the default branch
                lex.advance();
                if lex.peek().kind != TokenKind::Colon {
                    self.err(&lex.peek().pos.clone(), "Expected ':' after case label");
                    return false;
                }
                lex.advance();
                if !self.expression(lex) {
                    return false;
                }
                self.diag.pop(DiagCode::CaseLabel);
                saw_default = true;
                break;
            }

            // one or more literal labels joined by ','... each tried with an
            // Or-style short circuit into the branch test
            let mut label_jumps = Vec::new();
            loop {
                let token = lex.advance();
                let (label, cmp) = match token.kind {
                    TokenKind::Int(v) => (Value::Int(v), OpCode::NumEq),
                    TokenKind::Real(v) => (Value::Real(v), OpCode::NumEq),
                    TokenKind::Str(v) => (Value::String(v), OpCode::StrEq),
                    _ => {
                        self.err(&token.pos, "Case labels must be literals");
                        return false;
                    }
                };
                self.builder.emit_value(OpCode::Stack, Value::Int(0), &token.pos);
                self.builder.emit_value(OpCode::Val, label, &token.pos);
                self.builder.emit(cmp, &token.pos);
                if lex.peek().kind == TokenKind::Comma
                    && Self::comma_continues_labels(lex)
                {
                    lex.advance();
                    label_jumps.push(self.builder.emit_jump(OpCode::Or, &token.pos));
                    continue;
                }
                break;
            }
            for jump in label_jumps {
                self.builder.patch_jump_here(jump);
            }

            if lex.peek().kind != TokenKind::Colon {
                self.err(&lex.peek().pos.clone(), "Expected ':' after case label");
                return false;
            }
            lex.advance();
            let skip = self.builder.emit_jump(OpCode::JmpIfNot, pos);
            if !self.expression(lex) {
                return false;
            }
            end_jumps.push(self.builder.emit_jump(OpCode::Jmp, pos));
            self.builder.patch_jump_here(skip);
            self.diag.pop(DiagCode::CaseLabel);
        }

        if !saw_default {
            self.builder.emit_value(OpCode::Val, Value::Undefined, pos);
        }
        for jump in end_jumps {
            self.builder.patch_jump_here(jump);
        }
        self.builder.emit(OpCode::Pop, pos);
        if !self.close_call(lex) {
            return false;
        }
        true
    }

    /// Looks ahead to decide whether a comma inside `case` separates labels
    /// (next token is a literal followed by more labels or ':') or branches.
    fn comma_continues_labels(lex: &TokenStream<'_>) -> bool {
        lex.lex_peek_label_continuation()
    }

    fn function_call(&mut self, lex: &mut TokenStream<'_>, name: &str, pos: &Position) -> bool {
        self.diag.push(DiagCode::FunctionArguments, pos);
        let mut argc = 0i64;
        if lex.peek().kind != TokenKind::RParen {
            loop {
                if !self.expression(lex) {
                    return false;
                }
                argc += 1;
                if lex.peek().kind == TokenKind::Comma {
                    lex.advance();
                    continue;
                }
                break;
            }
        }
        if !self.close_call(lex) {
            return false;
        }
        self.diag.pop(DiagCode::FunctionArguments);

        // unescape() applied to a bare variable clears the variable's escape
        // flag instead of emitting a call
        if name == "unescape" && argc == 1 {
            let last = self.builder.addr().checked_sub(1);
            if let Some(addr) = last
                && let Some(instr) = self.builder.instruction_mut(addr)
                && instr.op == OpCode::Var
                && instr.escape
            {
                instr.escape = false;
                return true;
            }
        }

        let ident = Identifier {
            path: SmallVec::from_iter([name.to_owned()]),
            offsets: None,
        };
        self.builder.push(Instruction {
            op: OpCode::Func,
            value: Value::Int(argc),
            ident: Some(ident),
            escape: false,
            pos: pos.clone(),
        });
        true
    }

    // === variable paths ===================================================

    fn variable_reference(&mut self, lex: &mut TokenStream<'_>) -> bool {
        let Some(path) = self.parse_path(lex) else {
            return false;
        };
        self.emit_variable(&path)
    }

    fn parse_path(&mut self, lex: &mut TokenStream<'_>) -> Option<VarPath> {
        let start_pos = lex.peek().pos.clone();
        let absolute = if lex.peek().kind == TokenKind::Dot {
            lex.advance();
            true
        } else {
            false
        };

        let mut path = VarPath {
            absolute,
            leading: None,
            segments: SmallVec::new(),
            trailing: None,
            pos: start_pos,
        };

        // leading _this / _parent chain (relative paths only)
        if !absolute {
            match lex.peek().kind {
                TokenKind::Builtin(BuiltinVar::This) => {
                    lex.advance();
                    path.leading = Some(0);
                }
                TokenKind::Builtin(BuiltinVar::Parent) => {
                    let mut parents = 0u16;
                    while lex.peek().kind == TokenKind::Builtin(BuiltinVar::Parent) {
                        lex.advance();
                        parents += 1;
                        if lex.peek().kind == TokenKind::Dot
                            && Self::dot_continues_with(lex, BuiltinVar::Parent)
                        {
                            lex.advance();
                            continue;
                        }
                        break;
                    }
                    path.leading = Some(parents);
                }
                _ => {}
            }
            if path.leading.is_some() {
                if lex.peek().kind != TokenKind::Dot {
                    return Some(path);
                }
                lex.advance();
            }
        }

        loop {
            let token = lex.advance();
            match token.kind {
                TokenKind::Ident(name) => path.segments.push(name),
                TokenKind::Builtin(builtin) => {
                    if matches!(builtin, BuiltinVar::This | BuiltinVar::Parent) {
                        self.err(&token.pos, "'_this' and '_parent' are only valid as path prefix");
                        return None;
                    }
                    path.trailing = Some(builtin);
                    return Some(path);
                }
                _ => {
                    self.err(&token.pos, "Expected identifier in variable path");
                    return None;
                }
            }
            if lex.peek().kind == TokenKind::Dot && Self::dot_continues_path(lex) {
                lex.advance();
                continue;
            }
            return Some(path);
        }
    }

    /// A dot continues the path only when an identifier or builtin follows;
    /// otherwise it belongs to the postfix attribute syntax.
    fn dot_continues_path(lex: &TokenStream<'_>) -> bool {
        lex.lex_peek_path_continuation()
    }

    fn dot_continues_with(lex: &TokenStream<'_>, builtin: BuiltinVar) -> bool {
        let _ = builtin;
        lex.lex_peek_parent_continuation()
    }

    /// Compiles a path in value context, with runtime warnings for undefined
    /// variables.
    fn emit_variable(&mut self, path: &VarPath) -> bool {
        if let Some(parents) = path.leading {
            let ident = Identifier {
                path: path.segments.clone(),
                offsets: Some((0, parents)),
            };
            self.builder.emit_ident(OpCode::PushFrag, ident, &path.pos);
            for segment in &path.segments {
                let ident = Identifier {
                    path: SmallVec::from_iter([segment.clone()]),
                    offsets: None,
                };
                self.builder.emit_ident(OpCode::GetAttr, ident, &path.pos);
            }
            if path.trailing.is_some() {
                self.err(&path.pos, "Iteration builtins need a fragment path");
                return false;
            }
            return true;
        }

        if let Some(builtin) = path.trailing {
            return self.emit_list_builtin(path, builtin);
        }

        if path.segments.is_empty() {
            self.err(&path.pos, "Empty variable path");
            return false;
        }

        let frag_path = &path.segments[..path.segments.len() - 1];
        if let Some((frame_off, frag_off)) = self.match_frag_path(path.absolute, frag_path) {
            let escape = self.params.config.features().always_escape;
            let addr = self.builder.push(Instruction {
                op: OpCode::Var,
                value: Value::Undefined,
                ident: Some(Identifier {
                    path: path.segments.clone(),
                    offsets: Some((frame_off, frag_off)),
                }),
                escape: false,
                pos: path.pos.clone(),
            });
            if let Some(instr) = self.builder.instruction_mut(addr) {
                instr.escape = escape;
            }
            return true;
        }

        // not reachable through open fragments: walk attributes from the
        // deepest record the path prefix does reach
        self.emit_attr_chain(path, path.segments.len())
    }

    /// Compiles a path without undefined-variable warnings, for the query
    /// forms (`exists`, `isempty`, `count`...).
    fn emit_variable_silent(&mut self, path: &VarPath) -> bool {
        if path.trailing.is_some() {
            self.err(&path.pos, "Iteration builtins are not valid here");
            return false;
        }
        if let Some(parents) = path.leading {
            let ident = Identifier {
                path: path.segments.clone(),
                offsets: Some((0, parents)),
            };
            self.builder.emit_ident(OpCode::PushFrag, ident, &path.pos);
            for segment in &path.segments {
                let ident = Identifier {
                    path: SmallVec::from_iter([segment.clone()]),
                    offsets: None,
                };
                self.builder.emit_ident(OpCode::GetAttr, ident, &path.pos);
            }
            return true;
        }
        if path.segments.is_empty() {
            self.err(&path.pos, "Empty variable path");
            return false;
        }
        self.emit_attr_chain(path, path.segments.len())
    }

    /// Emits `PushFrag` at the deepest open record a prefix of the path
    /// reaches, then `GetAttr` steps for the remainder (`count` of the
    /// segments, counted from the full path).
    fn emit_attr_chain(&mut self, path: &VarPath, upto: usize) -> bool {
        let segments = &path.segments[..upto];
        let mut matched = 0;
        let mut record = (0u16, 0u16);
        for k in (0..=segments.len()).rev() {
            if let Some(offsets) = self.match_frag_path(path.absolute, &segments[..k]) {
                matched = k;
                record = offsets;
                break;
            }
        }
        let ident = Identifier {
            path: SmallVec::from_iter(segments[..matched].iter().cloned()),
            offsets: Some(record),
        };
        self.builder.emit_ident(OpCode::PushFrag, ident, &path.pos);
        for segment in &segments[matched..] {
            let ident = Identifier {
                path: SmallVec::from_iter([segment.clone()]),
                offsets: None,
            };
            self.builder.emit_ident(OpCode::GetAttr, ident, &path.pos);
        }
        true
    }

    fn emit_list_builtin(&mut self, path: &VarPath, builtin: BuiltinVar) -> bool {
        let op = match builtin {
            BuiltinVar::First => OpCode::FragFirst,
            BuiltinVar::Inner => OpCode::FragInner,
            BuiltinVar::Last => OpCode::FragLast,
            BuiltinVar::Index => OpCode::FragIndex,
            BuiltinVar::Count => OpCode::FragCount,
            BuiltinVar::This | BuiltinVar::Parent => unreachable!("handled as path prefix"),
        };

        if let Some(offsets) = self.match_frag_path(path.absolute, &path.segments) {
            let ident = Identifier {
                path: path.segments.clone(),
                offsets: Some(offsets),
            };
            self.builder.emit_ident(op, ident, &path.pos);
            return true;
        }

        if builtin == BuiltinVar::Count && !path.segments.is_empty() {
            // counting a fragment that is not open reads it as an attribute
            let frag_path = &path.segments[..path.segments.len() - 1];
            let offsets = self.match_frag_path(path.absolute, frag_path);
            match offsets {
                Some(offsets) => {
                    let ident = Identifier {
                        path: path.segments.clone(),
                        offsets: Some(offsets),
                    };
                    self.builder.emit_ident(OpCode::NestedFragCount, ident, &path.pos);
                }
                None => {
                    self.emit_attr_chain(path, path.segments.len());
                    self.builder.emit(OpCode::Count, &path.pos);
                }
            }
            return true;
        }

        self.err(
            &path.pos,
            format!(
                "Fragment '{}' is not open, cannot use iteration builtins",
                display_path(path)
            ),
        );
        self.builder.emit_value(OpCode::Val, Value::Undefined, &path.pos);
        true
    }

    /// Matches a fragment path against the simulated open fragments, from
    /// the top frame outwards.
    ///
    /// Absolute paths must be a prefix of a frame's open chain; relative
    /// paths match the deepest suffix occurrence. Returns runtime offsets.
    fn match_frag_path(&self, absolute: bool, frag_path: &[String]) -> Option<(u16, u16)> {
        for (frame_off, frame) in self.frames.iter().rev().enumerate() {
            let open = &frame.open;
            if absolute {
                if frag_path.len() <= open.len() && open[..frag_path.len()] == *frag_path {
                    return Some((frame_off as u16, (open.len() - frag_path.len()) as u16));
                }
            } else {
                if frag_path.is_empty() {
                    return Some((frame_off as u16, 0));
                }
                if frag_path.len() <= open.len() {
                    for i in (frag_path.len() - 1..open.len()).rev() {
                        if open[i + 1 - frag_path.len()..=i] == *frag_path {
                            return Some((frame_off as u16, (open.len() - 1 - i) as u16));
                        }
                    }
                }
            }
        }
        None
    }

    // === helpers ==========================================================

    fn emit_regex(&mut self, pattern: &str, flags: &str, pos: &Position) -> bool {
        let flags = RegexFlags::parse(flags, pos, self.log);
        match RegexValue::new(pattern, flags) {
            Ok(regex) => {
                self.builder
                    .emit_value(OpCode::Val, Value::Regex(Arc::new(regex)), pos);
                true
            }
            Err(error) => {
                self.err(pos, format!("Invalid regular expression: {error}"));
                false
            }
        }
    }

    fn fold_expression(&mut self, start: Addr, pos: &Position) {
        let instructions = &self.builder.instructions()[start..];
        if instructions.len() <= 1 {
            return;
        }
        let folded = processor::evaluate(
            instructions,
            self.params.dict,
            self.params.config,
            self.params.udf,
            self.params.encoding,
        );
        if let Some(value) = folded {
            self.builder.fold_to_value(start, value, pos);
        }
    }

    fn expect_end(&mut self, lex: &mut TokenStream<'_>) -> bool {
        let token = lex.peek();
        if token.kind == TokenKind::End {
            return true;
        }
        let pos = token.pos.clone();
        let kind = token.kind.clone();
        self.err(&pos, format!("Unexpected token {kind} at directive end"));
        false
    }

    fn err(&mut self, pos: &Position, msg: impl Into<String>) {
        self.log.append(Level::Error, pos, msg);
    }

    fn warn(&mut self, pos: &Position, msg: impl Into<String>) {
        self.log.append(Level::Warning, pos, msg);
    }
}

fn display_path(path: &VarPath) -> String {
    let mut out = String::new();
    for segment in &path.segments {
        out.push('.');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

impl TokenStream<'_> {
    /// True when the current identifier is directly followed by `(`.
    fn lex_peek_lparen(&self) -> bool {
        matches!(self.current.kind, TokenKind::Ident(_)) && self.lex_peek(|t| *t == TokenKind::LParen)
    }

    /// True when the token after the current `.` continues a variable path.
    fn lex_peek_path_continuation(&self) -> bool {
        self.lex_peek(|t| matches!(t, TokenKind::Ident(_) | TokenKind::Builtin(_)))
    }

    /// True when the token after the current `.` is another `_parent`.
    fn lex_peek_parent_continuation(&self) -> bool {
        self.lex_peek(|t| matches!(t, TokenKind::Builtin(BuiltinVar::Parent)))
    }

    /// True when the comma at hand separates case labels rather than
    /// branches: the following literal is followed by ',' or ':'.
    fn lex_peek_label_continuation(&self) -> bool {
        self.lex_peek2(
            |t| matches!(t, TokenKind::Int(_) | TokenKind::Real(_) | TokenKind::Str(_)),
            |t| matches!(t, TokenKind::Comma | TokenKind::Colon),
        )
    }

    fn lex_peek(&self, check: impl FnOnce(&TokenKind) -> bool) -> bool {
        let mut probe = self.lex.probe();
        check(&probe.next_token().kind)
    }

    fn lex_peek2(
        &self,
        first: impl FnOnce(&TokenKind) -> bool,
        second: impl FnOnce(&TokenKind) -> bool,
    ) -> bool {
        let mut probe = self.lex.probe();
        first(&probe.next_token().kind) && second(&probe.next_token().kind)
    }
}
