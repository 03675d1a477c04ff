//! Output sinks for rendered pages.
//!
//! The interpreter writes through the [`Formatter`](crate::formatter) into a
//! [`Writer`]. A write failure is fatal to the render; the host sees it as a
//! `Fatal` log entry and an error result.

use std::{fmt, io};

/// Result alias for writer operations.
pub type WriteResult = Result<(), WriteError>;

/// Failure reported by a writer.
#[derive(Debug)]
pub struct WriteError {
    pub reason: String,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write failed: {}", self.reason)
    }
}

impl std::error::Error for WriteError {}

impl From<io::Error> for WriteError {
    fn from(err: io::Error) -> Self {
        Self {
            reason: err.to_string(),
        }
    }
}

/// Append-only sink for rendered output.
pub trait Writer {
    fn write(&mut self, text: &str) -> WriteResult;

    /// Best-effort flush; called unconditionally at render completion.
    fn flush(&mut self) -> WriteResult {
        Ok(())
    }
}

/// Writer collecting output into a `String`.
#[derive(Debug, Default)]
pub struct StringWriter(String);

impl StringWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl Writer for StringWriter {
    fn write(&mut self, text: &str) -> WriteResult {
        self.0.push_str(text);
        Ok(())
    }
}

/// Writer wrapping any `std::io::Write` stream.
#[derive(Debug)]
pub struct StreamWriter<W: io::Write> {
    inner: W,
}

impl<W: io::Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> Writer for StreamWriter<W> {
    fn write(&mut self, text: &str) -> WriteResult {
        self.inner.write_all(text.as_bytes()).map_err(Into::into)
    }

    fn flush(&mut self) -> WriteResult {
        self.inner.flush().map_err(Into::into)
    }
}
