//! Template materialization: cached programs, dictionaries, configurations.
//!
//! A render needs all three pinned to consistent generations. The
//! configuration is loaded first; the dictionary must have been parsed
//! against that configuration's serial, and the program compiled against the
//! dictionary's serial. Any drift (file change with `watchfiles`, serial
//! mismatch) rebuilds the dependent pieces.
//!
//! Concurrent callers may race on a miss and compile the same template
//! twice; whichever insert lands last wins the cache slot and the loser's
//! program is dropped with its render. Readers never observe a partially
//! built program because insertion happens only after the build completed.

use std::sync::Arc;

use crate::{
    bytecode::Program,
    cache::{Cache, CacheKey, key_for_filename, key_for_string},
    configuration::Configuration,
    dictionary::Dictionary,
    error::ErrorLog,
    filesystem::Filesystem,
    functions::UdfRegistry,
    parser::{self, CompileParams},
};

/// Template source given to a render.
#[derive(Debug, Clone, Copy)]
pub enum TemplateSource<'a> {
    /// Path of a template file, relative to the engine root.
    File(&'a str),
    /// Inline template body; cached under its content hash.
    String(&'a str),
}

/// The pinned pieces a render runs with.
#[derive(Debug)]
pub struct Template {
    pub program: Arc<Program>,
    pub dict: Arc<Dictionary>,
    pub config: Arc<Configuration>,
}

/// The three caches plus the load/compile orchestration.
pub struct TemplateCache {
    filesystem: Arc<dyn Filesystem>,
    fs_root: String,
    programs: Cache<Program>,
    dictionaries: Cache<Dictionary>,
    configurations: Cache<Configuration>,
}

impl std::fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCache")
            .field("fs_root", &self.fs_root)
            .field("programs", &self.programs.len())
            .field("dictionaries", &self.dictionaries.len())
            .field("configurations", &self.configurations.len())
            .finish()
    }
}

impl TemplateCache {
    #[must_use]
    pub fn new(
        filesystem: Arc<dyn Filesystem>,
        fs_root: impl Into<String>,
        program_cache_size: usize,
        dict_cache_size: usize,
    ) -> Self {
        Self {
            filesystem,
            fs_root: fs_root.into(),
            programs: Cache::new(program_cache_size),
            dictionaries: Cache::new(dict_cache_size),
            configurations: Cache::new(dict_cache_size),
        }
    }

    #[must_use]
    pub fn filesystem(&self) -> &Arc<dyn Filesystem> {
        &self.filesystem
    }

    #[must_use]
    pub fn fs_root(&self) -> &str {
        &self.fs_root
    }

    /// Loads (or builds) a consistent program + dictionary + configuration
    /// triple.
    pub fn create_template(
        &self,
        source: TemplateSource<'_>,
        dict_filename: &str,
        config_filename: &str,
        encoding: &str,
        udf: &UdfRegistry,
        log: &mut ErrorLog,
    ) -> Template {
        let (config, dict, dict_serial) =
            self.config_and_dict(dict_filename, config_filename, log);

        let source_key = match source {
            TemplateSource::File(filename) => key_for_filename(&self.fs_root, filename),
            TemplateSource::String(body) => key_for_string(body),
        };
        let key: CacheKey = vec![
            source_key,
            key_for_filename(&self.fs_root, dict_filename),
            key_for_filename(&self.fs_root, config_filename),
        ];

        let watch = config.features().watch_files;
        let cached = self.programs.find(&key, Some(dict_serial)).filter(|hit| {
            !watch || !hit.data.is_changed(self.filesystem.as_ref())
        });

        let program = match cached {
            Some(hit) => hit.data,
            None => {
                let params = CompileParams {
                    filesystem: self.filesystem.as_ref(),
                    fs_root: &self.fs_root,
                    dict: &dict,
                    config: &config,
                    udf,
                    encoding,
                };
                let program = match source {
                    TemplateSource::File(filename) => {
                        parser::compile_file(&params, filename, log)
                    }
                    TemplateSource::String(body) => parser::compile_string(&params, body, log),
                };
                self.programs.add(key, program, dict_serial).data
            }
        };

        Template {
            program,
            dict,
            config,
        }
    }

    /// Loads (or parses) the configuration and dictionary, returning the
    /// dictionary's serial as the dependency fingerprint for programs.
    fn config_and_dict(
        &self,
        dict_filename: &str,
        config_filename: &str,
        log: &mut ErrorLog,
    ) -> (Arc<Configuration>, Arc<Dictionary>, u64) {
        let config_key: CacheKey = vec![key_for_filename(&self.fs_root, config_filename)];
        let cached_config = self.configurations.find(&config_key, None).filter(|hit| {
            !hit.data.features().watch_files || !hit.data.is_changed(self.filesystem.as_ref())
        });
        let (config, config_serial) = match cached_config {
            Some(hit) => (hit.data, hit.serial),
            None => {
                let mut config = Configuration::new(self.fs_root.clone());
                if !config_filename.is_empty() {
                    config.parse(self.filesystem.as_ref(), config_filename, log);
                }
                let hit = self.configurations.add(config_key, config, 0);
                (hit.data, hit.serial)
            }
        };

        let dict_key: CacheKey = vec![
            key_for_filename(&self.fs_root, config_filename),
            key_for_filename(&self.fs_root, dict_filename),
        ];
        let watch = config.features().watch_files;
        let cached_dict = self
            .dictionaries
            .find(&dict_key, Some(config_serial))
            .filter(|hit| !watch || !hit.data.is_changed(self.filesystem.as_ref()));
        let (dict, dict_serial) = match cached_dict {
            Some(hit) => (hit.data, hit.serial),
            None => {
                let mut dict = Dictionary::new(self.fs_root.clone());
                if !dict_filename.is_empty() {
                    dict.parse(self.filesystem.as_ref(), dict_filename, log);
                }
                let hit = self.dictionaries.add(dict_key, dict, config_serial);
                (hit.data, hit.serial)
            }
        };

        (config, dict, dict_serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::InMemoryFilesystem;

    fn cache_with(files: &[(&str, &str)]) -> (TemplateCache, Arc<InMemoryFilesystem>) {
        let fs = Arc::new(InMemoryFilesystem::new());
        for (path, content) in files {
            fs.put(*path, *content);
        }
        let cache = TemplateCache::new(fs.clone(), "", 8, 8);
        (cache, fs)
    }

    #[test]
    fn program_is_cached_until_source_changes() {
        let (cache, fs) = cache_with(&[("t.html", "hello")]);
        let udf = UdfRegistry::new();
        let mut log = ErrorLog::new();

        let first = cache.create_template(
            TemplateSource::File("t.html"),
            "",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        let second = cache.create_template(
            TemplateSource::File("t.html"),
            "",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        assert!(Arc::ptr_eq(&first.program, &second.program));

        fs.put("t.html", "changed");
        let third = cache.create_template(
            TemplateSource::File("t.html"),
            "",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        assert!(!Arc::ptr_eq(&first.program, &third.program));
    }

    #[test]
    fn dict_change_invalidates_program() {
        let (cache, fs) = cache_with(&[("t.html", "#{greet}"), ("l.dict", "greet Hi\n")]);
        let udf = UdfRegistry::new();
        let mut log = ErrorLog::new();

        let first = cache.create_template(
            TemplateSource::File("t.html"),
            "l.dict",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        fs.put("l.dict", "greet Hello\n");
        let second = cache.create_template(
            TemplateSource::File("t.html"),
            "l.dict",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        assert!(!Arc::ptr_eq(&first.program, &second.program));
        assert!(log.is_empty(), "{log}");
    }

    #[test]
    fn string_templates_cache_by_content() {
        let (cache, _) = cache_with(&[]);
        let udf = UdfRegistry::new();
        let mut log = ErrorLog::new();

        let a = cache.create_template(
            TemplateSource::String("x"),
            "",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        let b = cache.create_template(
            TemplateSource::String("x"),
            "",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        let c = cache.create_template(
            TemplateSource::String("y"),
            "",
            "",
            "utf-8",
            &udf,
            &mut log,
        );
        assert!(Arc::ptr_eq(&a.program, &b.program));
        assert!(!Arc::ptr_eq(&a.program, &c.program));
    }
}
