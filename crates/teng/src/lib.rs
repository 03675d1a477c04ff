//! Teng: a general-purpose templating engine.
//!
//! Templates mix literal text with `<?teng ...?>` directives, `${...}`
//! expressions and `#{...}` dictionary lookups. A template compiles to a
//! flat byte-code program which renders against a tree of [`Fragment`]s the
//! host builds before each call; programs, dictionaries and configurations
//! are cached with change detection, so repeated renders stay cheap.
//!
//! ```
//! use teng::{ErrorLog, Fragment, GenPageArgs, StringWriter, Teng};
//!
//! let engine = Teng::new("");
//! let mut data = Fragment::new();
//! data.add_string("who", "world");
//!
//! let mut writer = StringWriter::new();
//! let mut log = ErrorLog::new();
//! engine
//!     .generate_page_string("Hello, ${who}!", &GenPageArgs::default(), &data, &mut writer, &mut log)
//!     .unwrap();
//! assert_eq!(writer.output(), "Hello, world!");
//! ```

mod bytecode;
mod cache;
mod configuration;
mod contenttype;
mod dictionary;
mod engine;
mod error;
mod filesystem;
mod formatter;
mod fragment;
mod functions;
mod json;
mod lex1;
mod lex2;
mod openframes;
mod parser;
mod position;
mod processor;
mod regex;
mod sourcelist;
mod template;
mod value;
mod writer;

pub use crate::{
    bytecode::{Identifier, Instruction, OpCode, Program},
    configuration::{Configuration, Features},
    contenttype::list_supported as list_supported_content_types,
    dictionary::Dictionary,
    engine::{GenPageArgs, RenderError, Teng},
    error::{Entry, ErrorLog, Level},
    filesystem::{Filesystem, FsError, FsResult, InMemoryFilesystem, NativeFilesystem},
    fragment::{Fragment, FragmentList, FragmentValue},
    functions::UdfRegistry,
    position::Position,
    regex::{RegexFlags, RegexValue},
    sourcelist::SourceList,
    template::{Template, TemplateCache, TemplateSource},
    value::{ListRef, Number, Value},
    writer::{StreamWriter, StringWriter, WriteError, WriteResult, Writer},
};
