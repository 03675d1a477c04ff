//! Parser diagnostic stack.
//!
//! Each grammar production pushes a code on entry and pops it on success.
//! When a directive fails to parse, the residual codes describe the path the
//! parser was on, and they drain into the log as `Diag` entries right after
//! the primary error.

use crate::{
    error::{ErrorLog, Level},
    position::Position,
};

/// What the parser was in the middle of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagCode {
    IfCondition,
    ElifCondition,
    SetExpression,
    PrintExpression,
    FragIdentifier,
    SetIdentifier,
    IncludeOptions,
    FormatOption,
    CtypeName,
    FunctionArguments,
    CaseLabel,
    TernaryBranch,
}

impl DiagCode {
    fn message(self) -> &'static str {
        match self {
            Self::IfCondition => "the error is in the if condition expression",
            Self::ElifCondition => "the error is in the elif condition expression",
            Self::SetExpression => "the error is in the right side of the set directive",
            Self::PrintExpression => "the error is in the printed expression",
            Self::FragIdentifier => "the error is in the fragment identifier",
            Self::SetIdentifier => "the error is in the variable identifier of set",
            Self::IncludeOptions => "the error is in the include directive options",
            Self::FormatOption => "the error is in the format space option",
            Self::CtypeName => "the error is in the content type name",
            Self::FunctionArguments => "the error is in the function arguments",
            Self::CaseLabel => "the error is in a case label",
            Self::TernaryBranch => "the error is in a branch of the ?: operator",
        }
    }
}

/// Stack of in-flight productions.
#[derive(Debug, Default)]
pub struct DiagStack {
    entries: Vec<(DiagCode, Position)>,
}

impl DiagStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: DiagCode, pos: &Position) {
        self.entries.push((code, pos.clone()));
    }

    /// Pops the top entry; the production finished cleanly.
    pub fn pop(&mut self, code: DiagCode) {
        if self.entries.last().is_some_and(|(top, _)| *top == code) {
            self.entries.pop();
        }
    }

    /// Drains all residual codes into the log, innermost first.
    pub fn drain_into(&mut self, log: &mut ErrorLog) {
        while let Some((code, pos)) = self.entries.pop() {
            log.append(Level::Diag, &pos, code.message());
        }
    }

    /// Discards residual codes without logging.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
