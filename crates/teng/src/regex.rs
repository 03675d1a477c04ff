//! Compiled regex values for the `=~` / `!~` operators and `regex_replace`.

use std::fmt;

use crate::{
    error::{ErrorLog, Level},
    position::Position,
};

/// Flag bits accepted after the closing slash of a regex literal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexFlags {
    pub ignore_case: bool,
    pub global: bool,
    pub multiline: bool,
    pub anchored: bool,
    pub dollar_endonly: bool,
    pub extended: bool,
    pub extra: bool,
    pub ungreedy: bool,
}

impl RegexFlags {
    /// Parses the flag characters; unknown flags are reported.
    pub fn parse(flags: &str, pos: &Position, log: &mut ErrorLog) -> Self {
        let mut result = Self::default();
        for ch in flags.chars() {
            match ch {
                'i' => result.ignore_case = true,
                'g' => result.global = true,
                'm' => result.multiline = true,
                'A' => result.anchored = true,
                'D' => result.dollar_endonly = true,
                'e' => result.extended = true,
                'X' => result.extra = true,
                'U' => result.ungreedy = true,
                _ => log.append(
                    Level::Error,
                    pos,
                    format!("Ignoring unknown regex flag '{ch}'"),
                ),
            }
        }
        result
    }
}

impl fmt::Display for RegexFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ignore_case {
            f.write_str("i")?;
        }
        if self.global {
            f.write_str("g")?;
        }
        if self.multiline {
            f.write_str("m")?;
        }
        if self.anchored {
            f.write_str("A")?;
        }
        if self.dollar_endonly {
            f.write_str("D")?;
        }
        if self.extended {
            f.write_str("e")?;
        }
        if self.extra {
            f.write_str("X")?;
        }
        if self.ungreedy {
            f.write_str("U")?;
        }
        Ok(())
    }
}

/// A compiled regex together with its source pattern and flags.
#[derive(Debug)]
pub struct RegexValue {
    pattern: String,
    flags: RegexFlags,
    compiled: fancy_regex::Regex,
}

impl RegexValue {
    /// Compiles a pattern with the given flags.
    pub fn new(pattern: &str, flags: RegexFlags) -> Result<Self, String> {
        let mut prefix = String::new();
        let mut inline = String::new();
        if flags.ignore_case {
            inline.push('i');
        }
        if flags.multiline {
            inline.push('m');
        }
        if flags.extended {
            inline.push('x');
        }
        if flags.ungreedy {
            inline.push('U');
        }
        if !inline.is_empty() {
            prefix = format!("(?{inline})");
        }
        let effective = if flags.anchored {
            format!("{prefix}\\A(?:{pattern})")
        } else {
            format!("{prefix}{pattern}")
        };
        let compiled = fancy_regex::Regex::new(&effective).map_err(|err| err.to_string())?;
        Ok(Self {
            pattern: pattern.to_owned(),
            flags,
            compiled,
        })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn flags(&self) -> RegexFlags {
        self.flags
    }

    /// True when the pattern matches anywhere in `text`.
    ///
    /// An engine-level evaluation failure (catastrophic backtracking limit)
    /// counts as no match.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.is_match(text).unwrap_or(false)
    }

    /// Replaces matches of the pattern with `replacement`; all of them when
    /// the `g` flag was given, otherwise just the first.
    #[must_use]
    pub fn replace(&self, text: &str, replacement: &str) -> String {
        if self.flags.global {
            self.compiled.replace_all(text, replacement).into_owned()
        } else {
            self.compiled.replace(text, replacement).into_owned()
        }
    }
}

impl fmt::Display for RegexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.pattern, self.flags)
    }
}
