//! Line-oriented dictionary files.
//!
//! The format: `#` comments, `%` processing directives at column zero,
//! `NAME VALUE` entries with optional double quoting, and indented
//! continuation lines appended to the previous entry. Configurations reuse
//! this parser and hook their extra directives in via [`DirectiveHook`].

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::{
    error::{ErrorLog, Level},
    filesystem::{Filesystem, abs_path},
    position::Position,
    sourcelist::SourceList,
};

/// Maximum `%include` nesting for dictionary files.
const MAX_INCLUDE_LEVEL: usize = 10;

/// Receiver for directives the dictionary itself does not understand.
pub(crate) trait DirectiveHook {
    /// Returns true when the directive was recognized and consumed.
    fn directive(&mut self, name: &str, value: &str, pos: &Position, log: &mut ErrorLog) -> bool;
}

/// Hook for plain dictionaries: nothing beyond the core directives.
pub(crate) struct NoExtraDirectives;

impl DirectiveHook for NoExtraDirectives {
    fn directive(&mut self, _: &str, _: &str, _: &Position, _: &mut ErrorLog) -> bool {
        false
    }
}

/// String-keyed dictionary with `%include` support and change detection.
#[derive(Debug, Default)]
pub struct Dictionary {
    fs_root: String,
    entries: IndexMap<String, String>,
    /// `%expand`: interpolate `#{KEY}` inside values.
    expand_value: bool,
    /// `%replace`: later entries overwrite earlier ones.
    replace_value: bool,
    sources: SourceList,
}

/// Parsing state threaded through includes.
struct ParseState<'h> {
    level: usize,
    visited: AHashSet<String>,
    hook: &'h mut dyn DirectiveHook,
}

impl Dictionary {
    #[must_use]
    pub fn new(fs_root: impl Into<String>) -> Self {
        Self {
            fs_root: fs_root.into(),
            ..Self::default()
        }
    }

    /// Parses the top-level dictionary file.
    pub fn parse(&mut self, filesystem: &dyn Filesystem, filename: &str, log: &mut ErrorLog) {
        let mut state = ParseState {
            level: MAX_INCLUDE_LEVEL,
            visited: AHashSet::new(),
            hook: &mut NoExtraDirectives,
        };
        let pos = Position::whole_file(None);
        self.parse_file(filesystem, filename, &pos, &mut state, log);
    }

    pub(crate) fn parse_with_hook(
        &mut self,
        filesystem: &dyn Filesystem,
        filename: &str,
        hook: &mut dyn DirectiveHook,
        log: &mut ErrorLog,
    ) {
        let mut state = ParseState {
            level: MAX_INCLUDE_LEVEL,
            visited: AHashSet::new(),
            hook,
        };
        let pos = Position::whole_file(None);
        self.parse_file(filesystem, filename, &pos, &mut state, log);
    }

    /// Parses dictionary text that did not come from a file.
    pub fn parse_string(&mut self, data: &str, log: &mut ErrorLog) {
        let mut state = ParseState {
            level: MAX_INCLUDE_LEVEL,
            visited: AHashSet::new(),
            hook: &mut NoExtraDirectives,
        };
        // no filesystem backs anonymous text; includes will fail cleanly
        let filesystem = crate::filesystem::InMemoryFilesystem::new();
        self.parse_text(&filesystem, data, Position::whole_file(None), &mut state, log);
    }

    fn parse_file(
        &mut self,
        filesystem: &dyn Filesystem,
        filename: &str,
        include_pos: &Position,
        state: &mut ParseState<'_>,
        log: &mut ErrorLog,
    ) {
        let path = abs_path(&self.fs_root, filename);
        if !state.visited.insert(path.clone()) {
            log.append(
                Level::Error,
                include_pos,
                format!("Dictionary include cycle through '{path}'"),
            );
            return;
        }

        let (_, interned) = self.sources.push(filesystem, &path, include_pos, log);
        match filesystem.read(&path) {
            Ok(data) => {
                let pos = Position::start_of(Some(interned));
                self.parse_text(filesystem, &data, pos, state, log);
            }
            Err(err) => {
                log.append(Level::Error, include_pos, err.to_string());
            }
        }
        state.visited.remove(&path);
    }

    fn parse_text(
        &mut self,
        filesystem: &dyn Filesystem,
        data: &str,
        start: Position,
        state: &mut ParseState<'_>,
        log: &mut ErrorLog,
    ) {
        let mut pos = start;
        let mut last_inserted: Option<String> = None;

        let mut rest = data;
        while !rest.is_empty() {
            let (line, advance, terminated) = match rest.find('\n') {
                Some(nl) => (&rest[..nl], nl + 1, true),
                None => (rest, rest.len(), false),
            };
            if !terminated {
                let mut end = pos.clone();
                end.advance_column(line.len() as i32 + 1);
                log.append(Level::Warning, &end, "No newline at end of file");
            }
            let line = line.strip_suffix('\r').unwrap_or(line);

            match line.chars().next() {
                None | Some('#') => last_inserted = None,
                Some('%') => {
                    self.process_directive(filesystem, &line[1..], &pos, state, log);
                    last_inserted = None;
                }
                Some(' ' | '\t' | '\u{0b}') => {
                    // continuation of the previous entry
                    let value = self.parse_value_line(line, &pos, log);
                    match &last_inserted {
                        Some(name) => {
                            if let Some(entry) = self.entries.get_mut(name) {
                                entry.push(' ');
                                entry.push_str(&value);
                            }
                        }
                        None => {
                            log.append(Level::Error, &pos, "No line to concatenate with");
                        }
                    }
                }
                Some(ch) if ch.is_ascii_alphabetic() || ch == '_' || ch == '.' => {
                    last_inserted = self.add_ident_line(line, &pos, log);
                }
                Some(_) => {
                    last_inserted = None;
                    log.append(
                        Level::Error,
                        &pos,
                        format!("Illegal identifier: line={line}"),
                    );
                }
            }

            pos.line += 1;
            pos.column = 0;
            rest = &rest[advance..];
        }
    }

    /// Parses a `NAME VALUE` line; returns the inserted name for
    /// continuations.
    fn add_ident_line(
        &mut self,
        line: &str,
        pos: &Position,
        log: &mut ErrorLog,
    ) -> Option<String> {
        let ident_end = line
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(line.len());
        let after = line[ident_end..].chars().next();
        if after.is_some_and(|c| !c.is_whitespace()) {
            log.append(Level::Error, pos, "Invalid character in identifier");
            return None;
        }

        let name = &line[..ident_end];
        let value = self.parse_value_line(&line[ident_end..], pos, log);
        let value = if self.expand_value {
            self.expand(&value, pos, log)
        } else {
            value
        };
        self.insert(name, value);
        Some(name.to_owned())
    }

    /// Parses a value with optional quoting and C escapes.
    fn parse_value_line(&self, value: &str, pos: &Position, log: &mut ErrorLog) -> String {
        let value = value.trim_start_matches([' ', '\t', '\u{0b}', '\u{0c}', '\r']);
        let mut result = String::with_capacity(value.len());
        let mut quoted = false;
        let mut chars = value.chars().peekable();
        let mut first = true;

        while let Some(ch) = chars.next() {
            match ch {
                '\\' => match chars.next() {
                    Some('n') => result.push('\n'),
                    Some('r') => result.push('\r'),
                    Some('t') => result.push('\t'),
                    Some('v') => result.push('\u{0b}'),
                    Some('\\') => result.push('\\'),
                    Some('"') => result.push('"'),
                    Some(other) => {
                        log.append(Level::Error, pos, "Invalid escape character");
                        result.push('\\');
                        result.push(other);
                    }
                    None => {
                        log.append(Level::Error, pos, "Escaping EOL not allowed");
                        result.push('\\');
                    }
                },
                '"' => {
                    if first {
                        quoted = true;
                    } else if quoted {
                        if chars.any(|c| !c.is_whitespace()) {
                            log.append(Level::Error, pos, "Text after quoted line");
                        }
                        return result;
                    } else {
                        result.push('"');
                    }
                }
                other => result.push(other),
            }
            first = false;
        }

        if quoted {
            log.append(Level::Error, pos, "Missing terminating quote");
        }
        result
    }

    /// Expands `#{KEY}` against the entries read so far.
    fn expand(&self, value: &str, pos: &Position, log: &mut ErrorLog) -> String {
        let mut result = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(open) = rest.find("#{") {
            result.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find('}') else {
                log.append(Level::Error, pos, "Unterminated #{} directive.");
                result.push_str(&rest[open..]);
                return result;
            };
            let key = &after[..close];
            match self.lookup(key) {
                Some(expansion) => result.push_str(expansion),
                None => {
                    result.push_str("#{");
                    result.push_str(key);
                    result.push('}');
                    log.append(
                        Level::Error,
                        pos,
                        format!("Dictionary item '{key}' not found"),
                    );
                }
            }
            rest = &after[close + 1..];
        }
        result.push_str(rest);
        result
    }

    fn process_directive(
        &mut self,
        filesystem: &dyn Filesystem,
        line: &str,
        pos: &Position,
        state: &mut ParseState<'_>,
        log: &mut ErrorLog,
    ) {
        let (name, value) = match line.find(char::is_whitespace) {
            Some(split) => (&line[..split], line[split..].trim()),
            None => (line, ""),
        };

        match name {
            "include" => self.include_file(filesystem, value, pos, state, log),
            "expand" => Self::set_bool(name, value, &mut self.expand_value, pos, log),
            "replace" => Self::set_bool(name, value, &mut self.replace_value, pos, log),
            _ => {
                if !state.hook.directive(name, value, pos, log) {
                    log.append(Level::Error, pos, "Unknown processing directive");
                }
            }
        }
    }

    fn set_bool(name: &str, value: &str, slot: &mut bool, pos: &Position, log: &mut ErrorLog) {
        match value {
            "yes" => *slot = true,
            "no" => *slot = false,
            _ => log.append(
                Level::Error,
                pos,
                format!("Invalid bool value of bool {name} directive '{value}'"),
            ),
        }
    }

    fn include_file(
        &mut self,
        filesystem: &dyn Filesystem,
        filename: &str,
        pos: &Position,
        state: &mut ParseState<'_>,
        log: &mut ErrorLog,
    ) {
        if state.level == 0 {
            log.append(Level::Error, pos, "Too many includes");
            return;
        }
        let filename = filename.trim();
        if filename.is_empty() {
            log.append(Level::Error, pos, "Missing file to include");
            return;
        }
        state.level -= 1;
        self.parse_file(filesystem, filename, pos, state, log);
        state.level += 1;
    }

    fn insert(&mut self, name: &str, value: String) {
        if self.replace_value {
            self.entries.insert(name.to_owned(), value);
        } else {
            self.entries.entry(name.to_owned()).or_insert(value);
        }
    }

    /// Adds an entry programmatically, bypassing the file format.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn fs_root(&self) -> &str {
        &self.fs_root
    }

    /// True when any parsed dictionary file changed on disk.
    #[must_use]
    pub fn is_changed(&self, filesystem: &dyn Filesystem) -> bool {
        self.sources.is_changed(filesystem)
    }

    /// Diagnostic dump of all entries.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (name, value) in &self.entries {
            let _ = writeln!(
                out,
                "{name}: |{value}|\n----------------------------------------"
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::InMemoryFilesystem;

    fn parse(data: &str) -> (Dictionary, ErrorLog) {
        let mut dict = Dictionary::new("");
        let mut log = ErrorLog::new();
        dict.parse_string(data, &mut log);
        (dict, log)
    }

    #[test]
    fn entries_and_comments() {
        let (dict, log) = parse("# header\nhello Hello world\nbye \"Good bye\"\n");
        assert!(log.is_empty(), "{log}");
        assert_eq!(dict.lookup("hello"), Some("Hello world"));
        assert_eq!(dict.lookup("bye"), Some("Good bye"));
    }

    #[test]
    fn first_wins_unless_replace() {
        let (dict, _) = parse("k one\nk two\n");
        assert_eq!(dict.lookup("k"), Some("one"));

        let (dict, _) = parse("%replace yes\nk one\nk two\n");
        assert_eq!(dict.lookup("k"), Some("two"));
    }

    #[test]
    fn continuation_lines() {
        let (dict, log) = parse("msg first\n second\n\tthird\n");
        assert!(log.is_empty(), "{log}");
        assert_eq!(dict.lookup("msg"), Some("first second third"));
    }

    #[test]
    fn expansion() {
        let (dict, log) = parse("%expand yes\ngreet Hello\nboth #{greet} again\n");
        assert!(log.is_empty(), "{log}");
        assert_eq!(dict.lookup("both"), Some("Hello again"));

        let (dict, log) = parse("%expand yes\nmiss #{nope}\n");
        assert_eq!(dict.lookup("miss"), Some("#{nope}"));
        assert!(!log.is_empty());
    }

    #[test]
    fn include_and_cycle_detection() {
        let fs = InMemoryFilesystem::new();
        fs.put("main.dict", "%include other.dict\nlocal here\n");
        fs.put("other.dict", "remote there\n");
        let mut dict = Dictionary::new("");
        let mut log = ErrorLog::new();
        dict.parse(&fs, "main.dict", &mut log);
        assert!(log.is_empty(), "{log}");
        assert_eq!(dict.lookup("remote"), Some("there"));
        assert_eq!(dict.lookup("local"), Some("here"));

        fs.put("a.dict", "%include b.dict\n");
        fs.put("b.dict", "%include a.dict\n");
        let mut dict = Dictionary::new("");
        let mut log = ErrorLog::new();
        dict.parse(&fs, "a.dict", &mut log);
        assert!(log.entries().iter().any(|e| e.msg.contains("cycle")));
    }

    #[test]
    fn missing_newline_warns() {
        let (_, log) = parse("k v");
        assert_eq!(log.max_level(), Some(Level::Warning));
    }

    #[test]
    fn bad_lines_error() {
        let (_, log) = parse("1bad x\n");
        assert!(log.entries().iter().any(|e| e.msg.contains("Illegal identifier")));

        let (_, log) = parse(" lonely continuation\n");
        assert!(log.entries().iter().any(|e| e.msg.contains("concatenate")));
    }
}
