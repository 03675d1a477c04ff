//! The engine facade: load, compile, render.

use std::{fmt, sync::Arc};

use crate::{
    contenttype::{self, Escaper},
    error::ErrorLog,
    filesystem::{Filesystem, NativeFilesystem},
    formatter::{FormatMode, Formatter},
    fragment::Fragment,
    functions::UdfRegistry,
    openframes::OpenFrames,
    processor::Processor,
    template::{TemplateCache, TemplateSource},
    writer::Writer,
};

/// Rendering failed with a fatal condition; the error log has the entries.
///
/// Output produced before the fatal point has already been written and
/// flushed.
#[derive(Debug)]
pub struct RenderError;

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("page generation failed, consult the error log")
    }
}

impl std::error::Error for RenderError {}

/// Per-render arguments of [`Teng::generate_page`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GenPageArgs<'a> {
    /// Language dictionary path; empty for none.
    pub dictionary: &'a str,
    /// Configuration path; empty for defaults.
    pub config: &'a str,
    /// Content type name or alias; empty means `text/plain`.
    pub content_type: &'a str,
    /// Lowercase output encoding label; `utf-8` switches string builtins to
    /// code-point indexing.
    pub encoding: &'a str,
}

/// The templating engine: shared caches over a filesystem root.
///
/// One instance serves any number of renders; concurrent renders from
/// multiple threads share the caches and nothing else.
pub struct Teng {
    cache: TemplateCache,
    udf: UdfRegistry,
}

impl fmt::Debug for Teng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teng").field("cache", &self.cache).finish()
    }
}

impl Teng {
    pub const DEFAULT_CACHE_SIZE: usize = 50;

    /// Engine over the native filesystem rooted at `fs_root`.
    #[must_use]
    pub fn new(fs_root: &str) -> Self {
        Self::with_filesystem(Arc::new(NativeFilesystem::new(fs_root)), fs_root)
    }

    /// Engine over a custom filesystem implementation.
    #[must_use]
    pub fn with_filesystem(filesystem: Arc<dyn Filesystem>, fs_root: &str) -> Self {
        Self {
            cache: TemplateCache::new(
                filesystem,
                fs_root,
                Self::DEFAULT_CACHE_SIZE,
                Self::DEFAULT_CACHE_SIZE,
            ),
            udf: UdfRegistry::new(),
        }
    }

    /// Registry of user-defined functions callable from templates.
    pub fn udf_registry_mut(&mut self) -> &mut UdfRegistry {
        &mut self.udf
    }

    /// Renders a template file.
    pub fn generate_page(
        &self,
        template: &str,
        args: &GenPageArgs<'_>,
        data: &Fragment,
        writer: &mut dyn Writer,
        log: &mut ErrorLog,
    ) -> Result<(), RenderError> {
        self.render(TemplateSource::File(template), args, data, writer, log)
    }

    /// Renders an inline template string.
    pub fn generate_page_string(
        &self,
        template: &str,
        args: &GenPageArgs<'_>,
        data: &Fragment,
        writer: &mut dyn Writer,
        log: &mut ErrorLog,
    ) -> Result<(), RenderError> {
        self.render(TemplateSource::String(template), args, data, writer, log)
    }

    fn render(
        &self,
        source: TemplateSource<'_>,
        args: &GenPageArgs<'_>,
        data: &Fragment,
        writer: &mut dyn Writer,
        log: &mut ErrorLog,
    ) -> Result<(), RenderError> {
        let template = self.cache.create_template(
            source,
            args.dictionary,
            args.config,
            args.encoding,
            &self.udf,
            log,
        );

        let start_pos = crate::position::Position::whole_file(None);
        let descriptor = contenttype::find_descriptor(args.content_type, &start_pos, log);
        let mut escaper = Escaper::new(descriptor);
        let mut formatter = Formatter::new(writer, FormatMode::PassWhite);
        let mut frames = OpenFrames::new(data);

        let run_result = Processor::new(
            &template.program,
            &mut frames,
            &mut escaper,
            &mut formatter,
            &template.dict,
            &template.config,
            &self.udf,
            log,
            args.encoding,
        )
        .run();

        // the writer is flushed on success and failure alike; output up to a
        // fatal point is kept
        let flushed = formatter.flush();
        drop(formatter);

        if template.config.features().log_to_output && !log.is_empty() {
            let _ = writer.write(&log.to_string());
            let _ = writer.flush();
        }

        if run_result.is_err() || flushed.is_err() || log.is_fatal() {
            return Err(RenderError);
        }
        Ok(())
    }
}
