//! Error log shared by the compiler and the interpreter.
//!
//! Nothing in the engine aborts on a source-level problem; everything funnels
//! through [`ErrorLog`]. Entries are deduplicated per source position and the
//! number of messages kept for a single position is capped, with a synthesized
//! warning accounting for the overflow.

use std::fmt;

use indexmap::IndexMap;
use strum::Display;

use crate::position::Position;

/// Severity of a log entry, ascending.
///
/// `max_level()` over a log decides the outcome of a render: anything below
/// `Fatal` still counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum Level {
    Debug,
    Warning,
    /// Secondary explanation attached to an error at the same position.
    Diag,
    Error,
    Fatal,
}

/// One rendered log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub level: Level,
    pub pos: Position,
    pub msg: String,
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.pos, self.level, self.msg)
    }
}

/// Key identifying one source position in the dedup map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    filename: String,
    line: i32,
    column: i32,
}

/// Messages accumulated for one source position.
#[derive(Debug, Default)]
struct RecordValue {
    messages: Vec<(Level, String)>,
    ignored: usize,
}

/// Deduplicating, position-ordered error log.
///
/// Messages for a single position are kept ordered by descending severity and
/// capped at [`ErrorLog::max_messages_per_pos`]; identical neighbours are
/// dropped. Iteration yields entries sorted by (filename, line, column,
/// level).
#[derive(Debug)]
pub struct ErrorLog {
    records: IndexMap<RecordKey, RecordValue>,
    max_messages_per_pos: usize,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorLog {
    pub const DEFAULT_MAX_MESSAGES_PER_POS: usize = 3;

    #[must_use]
    pub fn new() -> Self {
        Self {
            records: IndexMap::new(),
            max_messages_per_pos: Self::DEFAULT_MAX_MESSAGES_PER_POS,
        }
    }

    /// Creates a log with a custom per-position message cap.
    #[must_use]
    pub fn with_message_cap(max_messages_per_pos: usize) -> Self {
        Self {
            records: IndexMap::new(),
            max_messages_per_pos: max_messages_per_pos.max(1),
        }
    }

    /// Appends a message for the given source position.
    pub fn append(&mut self, level: Level, pos: &Position, msg: impl Into<String>) {
        let msg = msg.into();
        let key = RecordKey {
            filename: pos.filename_str().to_owned(),
            line: pos.line,
            column: pos.column,
        };

        let record = self.records.entry(key).or_default();
        if record.messages.len() >= self.max_messages_per_pos {
            record.ignored += 1;
            return;
        }

        // keep messages for one position ordered by descending severity
        let mut i = record.messages.len();
        while i > 0 {
            if record.messages[i - 1].0 >= level {
                break;
            }
            i -= 1;
        }

        // drop exact duplicates next to the insertion point
        if i > 0 && record.messages[i - 1].1 == msg && record.messages[i - 1].0 == level {
            return;
        }
        record.messages.insert(i, (level, msg));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest severity recorded so far, if any.
    #[must_use]
    pub fn max_level(&self) -> Option<Level> {
        self.records
            .values()
            .flat_map(|r| r.messages.iter().map(|(level, _)| *level))
            .max()
    }

    /// True when at least one `Fatal` entry has been recorded.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.max_level() == Some(Level::Fatal)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of individual entries, counting the synthesized overflow
    /// warnings.
    #[must_use]
    pub fn count(&self) -> usize {
        self.records
            .values()
            .map(|r| r.messages.len() + usize::from(r.ignored > 0))
            .sum()
    }

    /// Materializes the log, sorted by (filename, line, column, level).
    #[must_use]
    pub fn entries(&self) -> Vec<Entry> {
        let mut result = Vec::with_capacity(self.count());
        for (key, record) in &self.records {
            let pos = Position::whole_file(Some(key.filename.as_str())).at(key.line, key.column);
            for (level, msg) in &record.messages {
                result.push(Entry {
                    level: *level,
                    pos: pos.clone(),
                    msg: msg.clone(),
                });
            }
            if record.ignored > 0 {
                result.push(Entry {
                    level: Level::Warning,
                    pos: pos.clone(),
                    msg: format!(
                        "The {} other error message(s) for this source code \
                         position have been ignored",
                        record.ignored
                    ),
                });
            }
        }
        result.sort_by(|lhs, rhs| {
            (lhs.pos.filename_str(), lhs.pos.line, lhs.pos.column, lhs.level).cmp(&(
                rhs.pos.filename_str(),
                rhs.pos.line,
                rhs.pos.column,
                rhs.level,
            ))
        });
        result
    }
}

impl fmt::Display for ErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries() {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}
