//! Instruction record and opcode set of the template machine.

use std::fmt;

use smallvec::SmallVec;
use strum::Display;

use crate::{position::Position, value::Value};

/// Operation codes understood by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    /// Push the literal operand onto the value stack.
    Val,
    /// Push the top of the value stack onto the program stack.
    Push,
    /// Pop the top of the program stack.
    Pop,
    /// Copy the program-stack value at the operand offset from the top.
    Stack,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,

    NumEq,
    NumGe,
    NumGt,
    StrEq,
    StrNe,
    RegexMatch,
    RegexNotMatch,

    /// Short-circuit: leave a false-ish left operand and jump, else pop it.
    And,
    /// Short-circuit: leave a true-ish left operand and jump, else pop it.
    Or,
    Not,

    Concat,
    Repeat,

    /// Unconditional relative jump.
    Jmp,
    /// Pop the condition, jump when false-ish.
    JmpIfNot,
    Halt,

    /// Look the identifier up in the open frames and push it; escaping per
    /// the instruction's escape flag.
    Var,
    /// Push the open-fragment record the identifier's offsets designate
    /// (`_this`, `_parent`).
    PushFrag,
    /// Pop a value and store it as a local of the identified record.
    Set,
    /// Pop a key and push its dictionary value.
    DictLookup,

    /// Open the named child fragment; jump by the operand when missing or
    /// empty.
    OpenFrag,
    /// Advance iteration; jump back by the operand while items remain.
    CloseFrag,
    /// Recursive repetition: open the like-named child list of the current
    /// fragment and re-run the enclosing block's body for it.
    RepeatFrag,
    /// Push a fresh frame rooted at the data root.
    OpenFrame,
    /// Pop the most recent frame.
    CloseFrame,
    FragCount,
    /// List size of a fragment that is not currently open.
    NestedFragCount,
    FragIndex,
    FragFirst,
    FragInner,
    FragLast,

    /// Pop a value and write it through the formatter.
    Print,
    /// Push the formatter mode given by the operand.
    PushFmt,
    PopFmt,
    /// Push the content type given by the operand index.
    PushCt,
    PopCt,
    /// Dump the data tree when the `debug` feature is enabled.
    Debug,
    /// Dump the program disassembly when the `bytecode` feature is enabled.
    Bytecode,

    Exists,
    Defined,
    IsEmpty,
    Repr,
    Type,
    Count,
    Jsonify,

    /// Pop a value, push its named attribute.
    GetAttr,
    /// Pop index and value, push the element.
    At,

    /// Call the named function with the operand's argument count.
    Func,
}

/// Compile-time identity of a variable or fragment reference.
///
/// `offsets` is present when the parser could resolve the path against its
/// simulated frame stack; unresolved references keep only the path and are
/// reported at runtime.
#[derive(Debug, Clone, Default)]
pub struct Identifier {
    /// Path segments as written, without the leading dot.
    pub path: SmallVec<[String; 4]>,
    /// `(frame_offset, frag_offset)` from the top of the runtime stacks.
    pub offsets: Option<(u16, u16)>,
}

impl Identifier {
    /// Last path segment: the variable or fragment name itself.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.last().map_or("", String::as_str)
    }

    /// The path in template syntax, always with a leading dot.
    #[must_use]
    pub fn display_path(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            out.push('.');
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push('.');
        }
        out
    }
}

/// One instruction: opcode, literal operand, optional identifier, and the
/// source position it was generated from.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: OpCode,
    pub value: Value<'static>,
    pub ident: Option<Identifier>,
    /// Escape the value through the current content type (`Var` only).
    pub escape: bool,
    pub pos: Position,
}

impl Instruction {
    #[must_use]
    pub fn new(op: OpCode, pos: Position) -> Self {
        Self {
            op,
            value: Value::Undefined,
            ident: None,
            escape: false,
            pos,
        }
    }

    #[must_use]
    pub fn with_value(op: OpCode, value: Value<'static>, pos: Position) -> Self {
        Self {
            op,
            value,
            ident: None,
            escape: false,
            pos,
        }
    }

    #[must_use]
    pub fn with_ident(op: OpCode, ident: Identifier, pos: Position) -> Self {
        Self {
            op,
            value: Value::Undefined,
            ident: Some(ident),
            escape: false,
            pos,
        }
    }

    /// Relative jump displacement, for the jumping opcodes.
    #[must_use]
    pub fn jump_offset(&self) -> Option<i64> {
        match self.value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if !self.value.is_undefined() {
            write!(f, " {}", self.value)?;
        }
        if let Some(ident) = &self.ident {
            write!(f, " <{}", ident.display_path())?;
            if let Some((frame, frag)) = ident.offsets {
                write!(f, " {frame}:{frag}")?;
            }
            write!(f, ">")?;
        }
        if self.escape {
            write!(f, " [escaped]")?;
        }
        write!(f, "  ; {}", self.pos)
    }
}
