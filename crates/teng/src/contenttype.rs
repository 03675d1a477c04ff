//! Content types: escape tables, the unescape automaton and the escaper
//! stack.
//!
//! Every registered content type carries a byte-to-string escape table. The
//! matching unescaper is not written by hand: it is compiled from the table
//! into a finite-state automaton, a trie over the escape sequences
//! linearized depth-first into a flat `(rule, next)` vector so the hot loop
//! is an array walk instead of pointer chasing.

use std::sync::OnceLock;

use ahash::AHashMap;

use crate::{
    error::{ErrorLog, Level},
    position::Position,
};

/// One content type: comment lexemes and the escape discipline.
#[derive(Debug)]
pub struct ContentType {
    pub line_comment: Option<&'static str>,
    pub block_comment: Option<(&'static str, &'static str)>,
    escapes: Vec<(u8, String)>,
    /// Escape-table index per byte; -1 means the byte passes through.
    escape_bitmap: [i16; 256],
    /// Linearized unescape automaton: positive next = transition target,
    /// negative = accept (`-next` is the unescaped byte), zero = dead stop.
    unescaper: Vec<(i32, i32)>,
}

impl Default for ContentType {
    fn default() -> Self {
        Self {
            line_comment: None,
            block_comment: None,
            escapes: Vec::new(),
            escape_bitmap: [-1; 256],
            unescaper: vec![(0, 0)],
        }
    }
}

/// Trie node used while building the unescape automaton.
#[derive(Debug, Default)]
struct TrieNode {
    rule: u8,
    /// The original byte this node's sequence unescapes to.
    accept: Option<u8>,
    children: Vec<TrieNode>,
}

impl TrieNode {
    fn child(&mut self, rule: u8) -> &mut TrieNode {
        if let Some(i) = self.children.iter().position(|c| c.rule == rule) {
            return &mut self.children[i];
        }
        self.children.push(TrieNode {
            rule,
            ..TrieNode::default()
        });
        self.children.last_mut().expect("child just pushed")
    }

    fn linearize(&self, out: &mut Vec<(i32, i32)>) {
        let mut referrers = Vec::with_capacity(self.children.len());
        for child in &self.children {
            referrers.push(out.len());
            let next = child.accept.map_or(0, |byte| -i32::from(byte));
            out.push((i32::from(child.rule), next));
        }
        // terminate this state's rule list
        out.push((0, 0));
        for (child, referrer) in self.children.iter().zip(referrers) {
            if child.accept.is_none() {
                let start = out.len() as i32;
                child.linearize(out);
                out[referrer].1 = start;
            }
        }
    }
}

impl ContentType {
    /// Registers an escape; refuses a second escape for the same byte.
    fn add_escape(&mut self, byte: u8, escape: &str) -> bool {
        if self.escape_bitmap[usize::from(byte)] != -1 {
            return false;
        }
        self.escapes.push((byte, escape.to_owned()));
        self.escape_bitmap[usize::from(byte)] = (self.escapes.len() - 1) as i16;
        true
    }

    /// Compiles the unescape automaton from the escape table.
    fn compile_unescaper(&mut self) {
        let mut root = TrieNode::default();
        for (byte, escape) in &self.escapes {
            let mut node = &mut root;
            for seq_byte in escape.bytes() {
                node = node.child(seq_byte);
            }
            node.accept = Some(*byte);
        }
        self.unescaper.clear();
        root.linearize(&mut self.unescaper);
    }

    fn next_state(&self, byte: u8, state: i32) -> i32 {
        if state < 0 || state as usize >= self.unescaper.len() {
            return 0;
        }
        let mut i = state as usize;
        while self.unescaper[i].0 > 0 {
            if self.unescaper[i].0 == i32::from(byte) {
                return self.unescaper[i].1;
            }
            i += 1;
        }
        0
    }

    /// Escapes a string through the table.
    #[must_use]
    pub fn escape(&self, src: &str) -> String {
        let mut out = String::with_capacity(src.len());
        for ch in src.chars() {
            if ch.is_ascii() {
                let index = self.escape_bitmap[ch as usize];
                if index >= 0 {
                    out.push_str(&self.escapes[index as usize].1);
                    continue;
                }
            }
            out.push(ch);
        }
        out
    }

    /// Greedily undoes the escapes using the automaton.
    #[must_use]
    pub fn unescape(&self, src: &str) -> String {
        let bytes = src.as_bytes();
        let mut out = String::with_capacity(src.len());
        let mut i = 0;
        while i < bytes.len() {
            let mut state = 0;
            let mut j = i;
            while j < bytes.len() {
                state = self.next_state(bytes[j], state);
                if state <= 0 {
                    break;
                }
                j += 1;
            }
            if state < 0 {
                // accept: emit the original byte, skip the whole sequence
                out.push(char::from((-state) as u8));
                i = j + 1;
            } else {
                let ch = src[i..].chars().next().expect("in-bounds char");
                out.push(ch);
                i += ch.len_utf8();
            }
        }
        out
    }
}

/// Registered content type with its registry index.
#[derive(Debug)]
pub struct Descriptor {
    pub content_type: ContentType,
    pub index: usize,
    pub name: &'static str,
    pub comment: &'static str,
}

struct Registry {
    by_name: AHashMap<&'static str, usize>,
    by_index: Vec<Descriptor>,
}

fn html() -> ContentType {
    let mut ct = ContentType {
        block_comment: Some(("<!--", "-->")),
        ..ContentType::default()
    };
    ct.add_escape(b'&', "&amp;");
    ct.add_escape(b'<', "&lt;");
    ct.add_escape(b'>', "&gt;");
    ct.add_escape(b'"', "&quot;");
    ct.compile_unescaper();
    ct
}

fn shell() -> ContentType {
    ContentType {
        line_comment: Some("#"),
        ..ContentType::default()
    }
}

fn csrc() -> ContentType {
    ContentType {
        block_comment: Some(("/*", "*/")),
        ..ContentType::default()
    }
}

fn quoted_string() -> ContentType {
    let mut ct = ContentType::default();
    ct.add_escape(b'\\', "\\\\");
    ct.add_escape(b'\n', "\\n");
    ct.add_escape(b'\r', "\\r");
    ct.add_escape(0x07, "\\a");
    ct.add_escape(0x00, "\\0");
    ct.add_escape(0x0b, "\\v");
    ct.add_escape(b'\'', "\\'");
    ct.add_escape(b'"', "\\\"");
    ct.compile_unescaper();
    ct
}

fn jshtml() -> ContentType {
    let mut ct = ContentType::default();
    ct.add_escape(b'\\', "\\\\");
    ct.add_escape(b'\n', "\\n");
    ct.add_escape(b'\r', "\\r");
    ct.add_escape(0x07, "\\a");
    ct.add_escape(0x00, "\\0");
    ct.add_escape(0x0b, "\\v");
    ct.add_escape(b'\'', "\\'");
    ct.add_escape(b'"', "\\&quot;");
    ct.add_escape(b'&', "&amp;");
    ct.add_escape(b'<', "&lt;");
    ct.add_escape(b'>', "&gt;");
    ct.compile_unescaper();
    ct
}

fn js() -> ContentType {
    let mut ct = quoted_string();
    ct.add_escape(b'/', "\\/");
    ct.compile_unescaper();
    ct
}

fn json() -> ContentType {
    let mut ct = ContentType::default();
    ct.add_escape(b'"', "\\\"");
    ct.add_escape(b'\\', "\\\\");
    ct.add_escape(0x08, "\\b");
    ct.add_escape(0x0c, "\\f");
    ct.add_escape(b'\n', "\\n");
    ct.add_escape(b'\r', "\\r");
    ct.add_escape(b'\t', "\\t");
    for byte in 0x00..=0x1f {
        // bytes with a short escape above are skipped by add_escape
        ct.add_escape(byte, &format!("\\u{byte:04X}"));
    }
    ct.compile_unescaper();
    ct
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        // (name, alias, creator, comment)
        type Creator = fn() -> ContentType;
        let creators: &[(&'static str, &'static str, Creator, &'static str)] = &[
            ("text/plain", "text", ContentType::default, "Default (text/plain) type."),
            ("text/html", "html", html, "Hypertext markup language."),
            ("text/xhtml", "xhtml", html, "X hypertext markup language."),
            ("text/xml", "xml", html, "Extensible markup language."),
            ("application/x-sh", "x-sh", shell, "Common for all types of shell."),
            ("text/csrc", "csrc", csrc, "C/C++ source code"),
            ("quoted-string", "quoted-string", quoted_string, "Generic quoted string with escapes."),
            ("jshtml", "jshtml", jshtml, "Quoted string embeddable into HTML pages."),
            ("application/x-javascript", "js", js, "Javascript language."),
            ("application/json", "json", json, "Json."),
        ];

        let mut by_name = AHashMap::new();
        let mut by_index = Vec::new();
        for &(name, alias, creator, comment) in creators {
            for registered in [name, alias] {
                if by_name.contains_key(registered) {
                    continue;
                }
                let index = by_index.len();
                by_index.push(Descriptor {
                    content_type: creator(),
                    index,
                    name: registered,
                    comment,
                });
                by_name.insert(registered, index);
            }
        }
        Registry { by_name, by_index }
    })
}

/// The default `text/plain` descriptor.
#[must_use]
pub fn default_descriptor() -> &'static Descriptor {
    &registry().by_index[0]
}

/// Looks a content type up by name or alias, case-insensitively.
///
/// Unknown names log an error and fall back to the default type.
pub fn find_descriptor(
    name: &str,
    pos: &Position,
    log: &mut ErrorLog,
) -> &'static Descriptor {
    let reg = registry();
    if name.is_empty() {
        return default_descriptor();
    }
    let lowered = name.to_ascii_lowercase();
    match reg.by_name.get(lowered.as_str()) {
        Some(&index) => &reg.by_index[index],
        None => {
            log.append(
                Level::Error,
                pos,
                format!("Content type '{name}' not found."),
            );
            default_descriptor()
        }
    }
}

/// Descriptor by registry index, as stored in `PUSH_CT` operands.
#[must_use]
pub fn descriptor_at(index: usize) -> Option<&'static Descriptor> {
    registry().by_index.get(index)
}

/// Names and comments of every registered content type.
#[must_use]
pub fn list_supported() -> Vec<(&'static str, &'static str)> {
    registry()
        .by_index
        .iter()
        .map(|d| (d.name, d.comment))
        .collect()
}

/// Stack of active content types driven by `PUSH_CT`/`POP_CT`.
#[derive(Debug)]
pub struct Escaper {
    stack: Vec<&'static Descriptor>,
}

impl Escaper {
    #[must_use]
    pub fn new(initial: &'static Descriptor) -> Self {
        Self {
            stack: vec![initial],
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn top(&self) -> &'static Descriptor {
        self.stack.last().expect("escaper stack never empty")
    }

    /// Pushes the content type at a registry index; an invalid index keeps
    /// the current top.
    pub fn push(&mut self, index: usize, pos: &Position, log: &mut ErrorLog) {
        match descriptor_at(index) {
            Some(descriptor) => self.stack.push(descriptor),
            None => {
                log.append(
                    Level::Error,
                    pos,
                    "Cannot push invalid content type -- using top instead.",
                );
                self.stack.push(self.top());
            }
        }
    }

    /// Pops the current content type; the last one stays.
    pub fn pop(&mut self, pos: &Position, log: &mut ErrorLog) {
        if self.stack.len() > 1 {
            self.stack.pop();
        } else {
            log.append(
                Level::Error,
                pos,
                "Cannot pop content type -- only one remains.",
            );
        }
    }

    #[must_use]
    pub fn escape(&self, src: &str) -> String {
        self.top().content_type.escape(src)
    }

    #[must_use]
    pub fn unescape(&self, src: &str) -> String {
        self.top().content_type.unescape(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_escape_round_trip() {
        let ct = html();
        let escaped = ct.escape("<a href=\"x\">&</a>");
        assert_eq!(escaped, "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
        assert_eq!(ct.unescape(&escaped), "<a href=\"x\">&</a>");
    }

    #[test]
    fn unescape_is_greedy_and_safe_on_partials() {
        let ct = html();
        assert_eq!(ct.unescape("&amp;lt;"), "&lt;");
        assert_eq!(ct.unescape("&am"), "&am");
        assert_eq!(ct.unescape("plain"), "plain");
    }

    #[test]
    fn json_control_bytes() {
        let ct = json();
        assert_eq!(ct.escape("\u{1}\t"), "\\u0001\\t");
        assert_eq!(ct.unescape("\\u0001\\t"), "\u{1}\t");
        // the slash stays verbatim in json
        assert_eq!(ct.escape("a/b"), "a/b");
    }

    #[test]
    fn js_escapes_slash() {
        let ct = js();
        assert_eq!(ct.escape("a/b"), "a\\/b");
        assert_eq!(ct.unescape("a\\/b"), "a/b");
    }

    #[test]
    fn registry_aliases() {
        let mut log = ErrorLog::new();
        let pos = Position::whole_file(None);
        let a = find_descriptor("text/html", &pos, &mut log);
        let b = find_descriptor("HTML", &pos, &mut log);
        assert!(log.is_empty());
        // alias gets its own descriptor slot but the same behavior
        assert_eq!(a.content_type.escape("<"), b.content_type.escape("<"));

        let fallback = find_descriptor("no/such", &pos, &mut log);
        assert_eq!(fallback.index, default_descriptor().index);
        assert!(!log.is_empty());
    }

    #[test]
    fn pop_last_refused() {
        let mut log = ErrorLog::new();
        let pos = Position::whole_file(None);
        let mut escaper = Escaper::new(default_descriptor());
        escaper.pop(&pos, &mut log);
        assert_eq!(escaper.depth(), 1);
        assert!(!log.is_empty());
    }
}
