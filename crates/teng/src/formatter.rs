//! White-space transformation stacked between the interpreter and the writer.
//!
//! `<?teng format space="..."?>` pushes a mode, `<?teng endformat?>` pops it.
//! Whitespace runs are buffered across `write` calls so a mode can decide
//! about a run that spans chunk boundaries; everything else passes through.

use crate::writer::{WriteResult, Writer};

/// White-space handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    /// Pass whitespace unchanged (`noformat`).
    PassWhite,
    /// Drop all whitespace (`nowhite`).
    NoWhite,
    /// Collapse each run to a single space (`onespace`).
    OneSpace,
    /// Collapse a run containing a newline to one newline (`striplines`).
    StripLines,
    /// Keep leading whitespace up to the first newline, drop the rest
    /// (`joinlines`).
    JoinLines,
    /// Keep the run up to and including its first newline and after its last
    /// newline (`nowhitelines`).
    NoWhiteLines,
}

impl FormatMode {
    /// Stable id stored in `PUSH_FMT` operands.
    #[must_use]
    pub fn to_id(self) -> i64 {
        match self {
            Self::PassWhite => 0,
            Self::NoWhite => 1,
            Self::OneSpace => 2,
            Self::StripLines => 3,
            Self::JoinLines => 4,
            Self::NoWhiteLines => 5,
        }
    }

    /// Inverse of [`Self::to_id`].
    #[must_use]
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(Self::PassWhite),
            1 => Some(Self::NoWhite),
            2 => Some(Self::OneSpace),
            3 => Some(Self::StripLines),
            4 => Some(Self::JoinLines),
            5 => Some(Self::NoWhiteLines),
            _ => None,
        }
    }

    /// Resolves the mode name used in `space="..."`.
    #[must_use]
    pub fn resolve(name: &str) -> Option<Self> {
        match name {
            "nowhite" => Some(Self::NoWhite),
            "onespace" => Some(Self::OneSpace),
            "striplines" => Some(Self::StripLines),
            "joinlines" => Some(Self::JoinLines),
            "nowhitelines" => Some(Self::NoWhiteLines),
            "noformat" => Some(Self::PassWhite),
            _ => None,
        }
    }
}

/// C's `isspace`: the six ASCII whitespace characters.
fn is_space(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\u{0b}' | '\u{0c}' | '\r')
}

/// Writer adapter applying the top of a mode stack to whitespace runs.
pub struct Formatter<'w> {
    writer: &'w mut dyn Writer,
    modes: Vec<FormatMode>,
    /// Pending whitespace run carried across `write` calls.
    buffer: String,
}

impl std::fmt::Debug for Formatter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formatter")
            .field("writer", &"<dyn Writer>")
            .field("modes", &self.modes)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<'w> Formatter<'w> {
    pub fn new(writer: &'w mut dyn Writer, initial: FormatMode) -> Self {
        Self {
            writer,
            modes: vec![initial],
            buffer: String::new(),
        }
    }

    fn mode(&self) -> FormatMode {
        *self.modes.last().expect("mode stack never empty")
    }

    /// Current stack depth; the interpreter checks balance at program end.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.modes.len()
    }

    pub fn write(&mut self, text: &str) -> WriteResult {
        if self.mode() == FormatMode::PassWhite && self.buffer.is_empty() {
            return self.writer.write(text);
        }

        let mut chunk_start = None;
        for (i, ch) in text.char_indices() {
            if is_space(ch) {
                if let Some(start) = chunk_start.take() {
                    self.writer.write(&text[start..i])?;
                }
                self.buffer.push(ch);
            } else {
                if !self.buffer.is_empty() {
                    self.process_buffer()?;
                }
                if chunk_start.is_none() {
                    chunk_start = Some(i);
                }
            }
        }
        if let Some(start) = chunk_start {
            self.writer.write(&text[start..])?;
        }
        Ok(())
    }

    /// Emits any buffered whitespace and flushes the writer.
    pub fn flush(&mut self) -> WriteResult {
        self.process_buffer()?;
        self.writer.flush()
    }

    /// Pushes a new mode; the pending run is settled under the old one.
    pub fn push(&mut self, mode: FormatMode) -> WriteResult {
        self.process_buffer()?;
        self.modes.push(mode);
        Ok(())
    }

    /// Pops the current mode; refuses to pop the last one.
    pub fn pop(&mut self) -> Result<Option<FormatMode>, crate::writer::WriteError> {
        if self.modes.len() <= 1 {
            return Ok(None);
        }
        self.process_buffer()?;
        Ok(self.modes.pop())
    }

    fn process_buffer(&mut self) -> WriteResult {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let run = std::mem::take(&mut self.buffer);
        match self.mode() {
            FormatMode::PassWhite => self.writer.write(&run),
            FormatMode::NoWhite => Ok(()),
            FormatMode::OneSpace => self.writer.write(" "),
            FormatMode::StripLines => {
                if run.contains('\n') {
                    self.writer.write("\n")
                } else {
                    self.writer.write(&run)
                }
            }
            FormatMode::JoinLines => match run.find('\n') {
                Some(nl) => self.writer.write(&run[..nl]),
                None => self.writer.write(&run),
            },
            FormatMode::NoWhiteLines => {
                let first = run.find('\n');
                let last = run.rfind('\n');
                match (first, last) {
                    (Some(first), Some(last)) if first != last => {
                        self.writer.write(&run[..=first])?;
                        self.writer.write(&run[last + 1..])
                    }
                    _ => self.writer.write(&run),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::StringWriter;

    fn format(mode: FormatMode, chunks: &[&str]) -> String {
        let mut writer = StringWriter::new();
        {
            let mut formatter = Formatter::new(&mut writer, mode);
            for chunk in chunks {
                formatter.write(chunk).unwrap();
            }
            formatter.flush().unwrap();
        }
        writer.into_output()
    }

    #[test]
    fn nowhite_drops_everything() {
        assert_eq!(format(FormatMode::NoWhite, &["a  \n b"]), "ab");
    }

    #[test]
    fn onespace_collapses_runs() {
        assert_eq!(format(FormatMode::OneSpace, &["a \t\n b", "  c"]), "a b c");
    }

    #[test]
    fn striplines_keeps_single_newline() {
        assert_eq!(format(FormatMode::StripLines, &["a \n  b", " c"]), "a\nb c");
    }

    #[test]
    fn joinlines_keeps_leading_run() {
        assert_eq!(format(FormatMode::JoinLines, &["a  \n   b"]), "a  b");
    }

    #[test]
    fn nowhitelines_trims_interior_lines() {
        assert_eq!(
            format(FormatMode::NoWhiteLines, &["a \n \n  b"]),
            "a \nb"
        );
        assert_eq!(format(FormatMode::NoWhiteLines, &["a \n b"]), "a \n b");
    }

    #[test]
    fn run_split_across_writes_is_one_run() {
        assert_eq!(format(FormatMode::OneSpace, &["a ", " ", " b"]), "a b");
    }

    #[test]
    fn last_mode_cannot_pop() {
        let mut writer = StringWriter::new();
        let mut formatter = Formatter::new(&mut writer, FormatMode::PassWhite);
        assert!(formatter.pop().unwrap().is_none());
    }
}
