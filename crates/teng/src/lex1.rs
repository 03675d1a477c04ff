//! Level-1 lexer: splits template source into text runs and directive bodies.
//!
//! The coarse pass recognizes `<?teng ...?>`, `<? ...?>` (short tag),
//! `${...}`, `#{...}` and `<!--- ... --->` comments. Everything else is text;
//! text runs get the five escape digraphs (`$\{` `#\{` `<\?` `?\>` `\}`)
//! unescaped in place. Directive bodies are handed to the level-2 lexer
//! untouched, with the position of their first character.

use std::borrow::Cow;

use crate::position::Position;

/// Kind of a coarse token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lex1Kind {
    /// Literal template text, digraphs already unescaped.
    Text,
    /// Body of a `<?teng ...?>` directive.
    Teng,
    /// Body of a `<? ...?>` directive (short-tag mode only).
    TengShort,
    /// Body of a `${...}` expression.
    Expr,
    /// Body of a `#{...}` dictionary lookup.
    Dict,
    /// Unterminated construct; the view carries the message.
    Error,
    EndOfInput,
}

/// One coarse token.
///
/// `pos` is where the construct starts in the source (the `$` of `${...}`);
/// `body_pos` is where the directive body begins, for the level-2 lexer.
#[derive(Debug)]
pub struct Lex1Token<'s> {
    pub kind: Lex1Kind,
    pub pos: Position,
    pub body_pos: Position,
    pub view: Cow<'s, str>,
}

/// Unescapes the five digraphs inside a text run.
///
/// Escape sequences are rare, so the common path returns the input slice
/// without allocating.
fn unescape_text(text: &str) -> Cow<'_, str> {
    const SEQUENCES: [(&str, &str); 5] =
        [("$\\{", "${"), ("#\\{", "#{"), ("<\\?", "<?"), ("?\\>", "?>"), ("\\}", "}")];

    if !text.contains('\\') {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    'outer: while i < bytes.len() {
        for (seq, replacement) in SEQUENCES {
            if bytes[i..].starts_with(seq.as_bytes()) {
                out.push_str(replacement);
                i += seq.len();
                continue 'outer;
            }
        }
        // multi-byte UTF-8 never collides with the ASCII digraphs
        let ch = text[i..].chars().next().expect("in-bounds char");
        out.push(ch);
        i += ch.len_utf8();
    }
    Cow::Owned(out)
}

/// Coarse lexer over one template source.
#[derive(Debug)]
pub struct Lex1<'s> {
    source: &'s str,
    offset: usize,
    pos: Position,
}

impl<'s> Lex1<'s> {
    #[must_use]
    pub fn new(source: &'s str, pos: Position) -> Self {
        Self {
            source,
            offset: 0,
            pos,
        }
    }

    fn bump(&mut self, n: usize) {
        let end = (self.offset + n).min(self.source.len());
        for ch in self.source[self.offset..end].chars() {
            self.pos.advance(ch);
        }
        self.offset = end;
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.source[self.offset..].starts_with(pat)
    }

    /// Skips a directive body up to the closing `end` delimiter, honoring
    /// double-quoted strings (where backslash escapes the next character).
    ///
    /// Returns false when the input ends before the delimiter.
    fn skip_until(&mut self, end: &str) -> bool {
        let mut in_string = false;
        let mut escaped = false;
        while self.offset < self.source.len() {
            let rest = &self.source[self.offset..];
            let ch = rest.chars().next().expect("in-bounds char");
            if in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    in_string = false;
                }
            } else {
                if rest.starts_with(end) {
                    return true;
                }
                if ch == '"' {
                    in_string = true;
                }
            }
            self.bump(ch.len_utf8());
        }
        false
    }

    /// Skips a `#{...}` body where backslash escapes any character.
    fn skip_until_rcurly_escaped(&mut self) -> bool {
        let mut escaped = false;
        while self.offset < self.source.len() {
            let ch = self.source[self.offset..].chars().next().expect("in-bounds char");
            if escaped {
                escaped = false;
            } else if ch == '}' {
                return true;
            } else if ch == '\\' {
                escaped = true;
            }
            self.bump(ch.len_utf8());
        }
        false
    }

    fn text_token(&self, start: usize, pos: Position) -> Lex1Token<'s> {
        Lex1Token {
            kind: Lex1Kind::Text,
            body_pos: pos.clone(),
            pos,
            view: unescape_text(&self.source[start..self.offset]),
        }
    }

    fn error_token(pos: Position, msg: &'static str) -> Lex1Token<'s> {
        Lex1Token {
            kind: Lex1Kind::Error,
            body_pos: pos.clone(),
            pos,
            view: Cow::Borrowed(msg),
        }
    }

    /// Scans a delimited construct and returns its body token.
    fn delimited(
        &mut self,
        kind: Lex1Kind,
        open_len: usize,
        close: &str,
        error_msg: &'static str,
        start_pos: Position,
    ) -> Lex1Token<'s> {
        self.bump(open_len);
        let body_start = self.offset;
        let body_pos = self.pos.clone();
        let terminated = if kind == Lex1Kind::Dict {
            self.skip_until_rcurly_escaped()
        } else {
            self.skip_until(close)
        };
        if !terminated {
            return Self::error_token(start_pos, error_msg);
        }
        let body = &self.source[body_start..self.offset];
        self.bump(close.len());
        Lex1Token {
            kind,
            pos: start_pos,
            body_pos,
            view: Cow::Borrowed(body),
        }
    }

    /// Produces the next coarse token.
    pub fn next_token(&mut self, accept_short_tag: bool) -> Lex1Token<'s> {
        let start = self.offset;
        let start_pos = self.pos.clone();

        while self.offset < self.source.len() {
            if self.starts_with("<!---") {
                if self.offset > start {
                    return self.text_token(start, start_pos);
                }
                let comment_pos = self.pos.clone();
                self.bump(5);
                match self.source[self.offset..].find("--->") {
                    Some(i) => {
                        self.bump(i + 4);
                        // comment removed entirely, restart token scan
                        return self.next_token(accept_short_tag);
                    }
                    None => {
                        self.bump(self.source.len() - self.offset);
                        return Self::error_token(comment_pos, "Unterminated comment");
                    }
                }
            }

            if self.starts_with("<?teng") && self.is_teng_directive_head() {
                if self.offset > start {
                    return self.text_token(start, start_pos);
                }
                return self.delimited(
                    Lex1Kind::Teng,
                    6,
                    "?>",
                    "Unterminated <?teng ...?> directive",
                    start_pos,
                );
            }

            if accept_short_tag && self.starts_with("<?") {
                if self.offset > start {
                    return self.text_token(start, start_pos);
                }
                return self.delimited(
                    Lex1Kind::TengShort,
                    2,
                    "?>",
                    "Unterminated <? ...?> directive",
                    start_pos,
                );
            }

            if self.starts_with("${") {
                if self.offset > start {
                    return self.text_token(start, start_pos);
                }
                return self.delimited(
                    Lex1Kind::Expr,
                    2,
                    "}",
                    "Unterminated ${...} directive",
                    start_pos,
                );
            }

            if self.starts_with("#{") {
                if self.offset > start {
                    return self.text_token(start, start_pos);
                }
                return self.delimited(
                    Lex1Kind::Dict,
                    2,
                    "}",
                    "Unterminated #{...} directive",
                    start_pos,
                );
            }

            let ch = self.source[self.offset..].chars().next().expect("in-bounds char");
            self.bump(ch.len_utf8());
        }

        if self.offset > start {
            return self.text_token(start, start_pos);
        }
        Lex1Token {
            kind: Lex1Kind::EndOfInput,
            body_pos: start_pos.clone(),
            pos: start_pos,
            view: Cow::Borrowed(""),
        }
    }

    /// `<?teng` opens a directive only when followed by whitespace or `?>`.
    fn is_teng_directive_head(&self) -> bool {
        let after = &self.source[self.offset + 6..];
        after.starts_with("?>") || after.chars().next().is_some_and(char::is_whitespace)
    }
}
