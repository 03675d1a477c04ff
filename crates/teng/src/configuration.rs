//! Engine configuration: a dictionary extended with feature toggles.
//!
//! Configuration files share the dictionary format and add `%enable NAME`,
//! `%disable NAME` and the numeric directives `maxincludedepth` and
//! `maxdebugvallength`.

use std::fmt;

use crate::{
    dictionary::{Dictionary, DirectiveHook},
    error::{ErrorLog, Level},
    filesystem::Filesystem,
    position::Position,
};

/// Feature switches and numeric limits.
#[derive(Debug, Clone)]
pub struct Features {
    pub debug: bool,
    pub error_fragment: bool,
    pub log_to_output: bool,
    pub bytecode: bool,
    pub watch_files: bool,
    pub always_escape: bool,
    pub short_tag: bool,
    pub format: bool,
    pub print_escape: bool,
    pub max_include_depth: usize,
    pub max_debug_val_length: usize,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            debug: false,
            error_fragment: false,
            log_to_output: false,
            bytecode: false,
            watch_files: true,
            always_escape: true,
            short_tag: false,
            format: true,
            print_escape: true,
            max_include_depth: 10,
            max_debug_val_length: 40,
        }
    }
}

impl Features {
    fn flag_mut(&mut self, name: &str) -> Option<&mut bool> {
        match name {
            "debug" => Some(&mut self.debug),
            "errorfragment" => Some(&mut self.error_fragment),
            "logtooutput" => Some(&mut self.log_to_output),
            "bytecode" => Some(&mut self.bytecode),
            "watchfiles" => Some(&mut self.watch_files),
            "alwaysescape" => Some(&mut self.always_escape),
            "shorttag" => Some(&mut self.short_tag),
            "format" => Some(&mut self.format),
            "printescape" => Some(&mut self.print_escape),
            _ => None,
        }
    }

    /// State of a feature by its directive name.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        match name {
            "debug" => Some(self.debug),
            "errorfragment" => Some(self.error_fragment),
            "logtooutput" => Some(self.log_to_output),
            "bytecode" => Some(self.bytecode),
            "watchfiles" => Some(self.watch_files),
            "alwaysescape" => Some(self.always_escape),
            "shorttag" => Some(self.short_tag),
            "format" => Some(self.format),
            "printescape" => Some(self.print_escape),
            _ => None,
        }
    }
}

impl DirectiveHook for Features {
    fn directive(&mut self, name: &str, value: &str, pos: &Position, log: &mut ErrorLog) -> bool {
        match name {
            "maxincludedepth" | "maxdebugvallength" => {
                match value.parse::<usize>() {
                    Ok(parsed) => {
                        if name == "maxincludedepth" {
                            self.max_include_depth = parsed;
                        } else {
                            self.max_debug_val_length = parsed;
                        }
                    }
                    Err(_) => log.append(
                        Level::Error,
                        pos,
                        format!("Invalid value of numeric directive {name} '{value}'"),
                    ),
                }
                true
            }
            "enable" | "disable" => {
                let enable = name == "enable";
                match self.flag_mut(value) {
                    Some(flag) => *flag = enable,
                    None => log.append(
                        Level::Error,
                        pos,
                        format!("Unknown feature '{value}'"),
                    ),
                }
                true
            }
            _ => false,
        }
    }
}

/// Parameter dictionary plus the engine feature switches.
#[derive(Debug, Default)]
pub struct Configuration {
    dictionary: Dictionary,
    features: Features,
}

impl Configuration {
    #[must_use]
    pub fn new(fs_root: impl Into<String>) -> Self {
        Self {
            dictionary: Dictionary::new(fs_root),
            features: Features::default(),
        }
    }

    /// Parses a configuration file.
    pub fn parse(&mut self, filesystem: &dyn Filesystem, filename: &str, log: &mut ErrorLog) {
        self.dictionary
            .parse_with_hook(filesystem, filename, &mut self.features, log);
    }

    /// Parses configuration text that did not come from a file.
    pub fn parse_string(&mut self, data: &str, log: &mut ErrorLog) {
        let temp = crate::filesystem::InMemoryFilesystem::new();
        temp.put("<config>", data);
        self.dictionary
            .parse_with_hook(&temp, "<config>", &mut self.features, log);
    }

    #[must_use]
    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut Features {
        &mut self.features
    }

    #[must_use]
    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.dictionary.lookup(key)
    }

    #[must_use]
    pub fn is_changed(&self, filesystem: &dyn Filesystem) -> bool {
        self.dictionary.is_changed(filesystem)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |value: bool| if value { "enabled" } else { "disabled" };
        let features = &self.features;
        writeln!(f, "Configuration:")?;
        writeln!(f, "    debug: {}", on_off(features.debug))?;
        writeln!(f, "    errorfragment: {}", on_off(features.error_fragment))?;
        writeln!(f, "    logtooutput: {}", on_off(features.log_to_output))?;
        writeln!(f, "    bytecode: {}", on_off(features.bytecode))?;
        writeln!(f, "    watchfiles: {}", on_off(features.watch_files))?;
        writeln!(f, "    maxincludedepth: {}", features.max_include_depth)?;
        writeln!(f, "    maxdebugvallength: {}", features.max_debug_val_length)?;
        writeln!(f, "    format: {}", on_off(features.format))?;
        writeln!(f, "    alwaysescape: {}", on_off(features.always_escape))?;
        writeln!(f, "    printescape: {}", on_off(features.print_escape))?;
        writeln!(f, "    shorttag: {}", on_off(features.short_tag))
    }
}
