//! Built-in function library and the user-defined function registry.
//!
//! Functions receive their arguments in call order plus a [`FunctionCtx`]
//! carrying the escaper, the output encoding and an error channel. A handler
//! either returns a value or an error message; on error the processor logs
//! the message and substitutes the literal string `"undefined"`, so a broken
//! call stays visible in the output instead of silently vanishing.

mod date;
mod escape;
mod number;
mod string;

use ahash::AHashMap;

use crate::{contenttype::Escaper, value::Value};

/// Per-call context handed to every function.
pub struct FunctionCtx<'c> {
    pub escaper: &'c Escaper,
    /// Lowercase output encoding; `utf-8` switches string indexing to code
    /// points.
    pub encoding: &'c str,
    /// Messages to log at the call site without failing the call.
    pub errors: Vec<String>,
}

impl<'c> FunctionCtx<'c> {
    #[must_use]
    pub fn new(escaper: &'c Escaper, encoding: &'c str) -> Self {
        Self {
            escaper,
            encoding,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_utf8(&self) -> bool {
        self.encoding == "utf-8"
    }
}

/// Result of a builtin call: a value, or a message for the error log.
pub type FunctionResult<'a> = Result<Value<'a>, String>;

/// Handler signature for builtins.
pub type Handler = for<'a, 'c> fn(&[Value<'a>], &mut FunctionCtx<'c>) -> FunctionResult<'a>;

/// One registered builtin.
pub struct FunctionEntry {
    pub name: &'static str,
    /// Whether the optimizer may evaluate the function at compile time.
    pub pure: bool,
    pub handler: Handler,
}

/// The builtin table; deprecated aliases included.
static FUNCTIONS: &[FunctionEntry] = &[
    FunctionEntry { name: "len", pure: false, handler: string::len },
    FunctionEntry { name: "random", pure: false, handler: number::random },
    FunctionEntry { name: "round", pure: true, handler: number::round },
    FunctionEntry { name: "numformat", pure: true, handler: number::numformat },
    FunctionEntry { name: "date", pure: true, handler: date::date },
    FunctionEntry { name: "now", pure: false, handler: date::now },
    FunctionEntry { name: "sectotime", pure: true, handler: date::sectotime },
    FunctionEntry { name: "sec_to_time", pure: true, handler: date::sectotime },
    FunctionEntry { name: "substr", pure: false, handler: string::substr },
    FunctionEntry { name: "wordsubstr", pure: false, handler: string::wordsubstr },
    FunctionEntry { name: "substr_word", pure: false, handler: string::wordsubstr },
    FunctionEntry { name: "replace", pure: true, handler: string::replace },
    FunctionEntry { name: "regex_replace", pure: true, handler: string::regex_replace },
    FunctionEntry { name: "strtolower", pure: true, handler: string::strtolower },
    FunctionEntry { name: "strtoupper", pure: true, handler: string::strtoupper },
    FunctionEntry { name: "escape", pure: false, handler: escape::escape },
    FunctionEntry { name: "unescape", pure: false, handler: escape::unescape },
    FunctionEntry { name: "urlescape", pure: true, handler: escape::urlescape },
    FunctionEntry { name: "reorder", pure: true, handler: string::reorder },
    FunctionEntry { name: "nl2br", pure: true, handler: string::nl2br },
    FunctionEntry { name: "int", pure: true, handler: number::int },
    FunctionEntry { name: "isnumber", pure: true, handler: number::isnumber },
];

/// Looks a builtin up by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static FunctionEntry> {
    FUNCTIONS.iter().find(|entry| entry.name == name)
}

/// Host-registered function: args in, owned value out.
pub type UdfHandler =
    Box<dyn for<'a> Fn(&[Value<'a>]) -> Result<Value<'static>, String> + Send + Sync>;

/// Registry of user-defined functions consulted after the builtins.
#[derive(Default)]
pub struct UdfRegistry {
    map: AHashMap<String, UdfHandler>,
}

impl std::fmt::Debug for UdfRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdfRegistry")
            .field("names", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UdfRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function; a repeated name replaces the old handler.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: for<'a> Fn(&[Value<'a>]) -> Result<Value<'static>, String> + Send + Sync + 'static,
    {
        self.map.insert(name.into(), Box::new(handler));
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&UdfHandler> {
        self.map.get(name)
    }
}

/// Shared helper: the literal string the engine substitutes for failed calls.
pub(crate) fn undefined_result<'a>() -> Value<'a> {
    Value::String("undefined".to_owned())
}
