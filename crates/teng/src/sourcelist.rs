//! List of source files a compiled program was built from.
//!
//! Each entry remembers the stat hash observed at compile time so the cache
//! can ask "did anything under this program change on disk?" without keeping
//! file contents around.

use std::sync::Arc;

use crate::{
    error::{ErrorLog, Level},
    filesystem::Filesystem,
    position::Position,
};

/// One watched source file.
#[derive(Debug, Clone)]
struct FileStat {
    filename: Arc<str>,
    /// Hash at compile time; `None` when the stat itself failed.
    hash: Option<u64>,
}

/// Ordered set of source files with their compile-time stat hashes.
#[derive(Debug, Default, Clone)]
pub struct SourceList {
    sources: Vec<FileStat>,
}

impl SourceList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source file, stat-ing it once.
    ///
    /// Returns the index of the entry and the interned filename. A path that
    /// is already present is not stat-ed again.
    pub fn push(
        &mut self,
        filesystem: &dyn Filesystem,
        filename: &str,
        pos: &Position,
        log: &mut ErrorLog,
    ) -> (usize, Arc<str>) {
        if let Some(i) = self.sources.iter().position(|s| &*s.filename == filename) {
            return (i, Arc::clone(&self.sources[i].filename));
        }

        let hash = match filesystem.stat(filename) {
            Ok(hash) => Some(hash),
            Err(err) => {
                log.append(Level::Error, pos, err.to_string());
                None
            }
        };
        let filename: Arc<str> = Arc::from(filename);
        self.sources.push(FileStat {
            filename: Arc::clone(&filename),
            hash,
        });
        (self.sources.len() - 1, filename)
    }

    /// Filename registered at `index`, if any.
    #[must_use]
    pub fn name(&self, index: usize) -> Option<&Arc<str>> {
        self.sources.get(index).map(|s| &s.filename)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Re-stats every source and reports whether any of them drifted from the
    /// hash recorded at compile time.
    #[must_use]
    pub fn is_changed(&self, filesystem: &dyn Filesystem) -> bool {
        self.sources.iter().any(|source| {
            match (filesystem.stat(&source.filename), source.hash) {
                (Ok(hash), Some(recorded)) => hash != recorded,
                // was unreadable then and still is: unchanged
                (Err(_), None) => false,
                _ => true,
            }
        })
    }

    /// Iterates registered filenames in registration order.
    pub fn names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.sources.iter().map(|s| &s.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::InMemoryFilesystem;

    #[test]
    fn detects_change_and_dedups() {
        let fs = InMemoryFilesystem::new();
        fs.put("a.html", "x");
        let mut log = ErrorLog::new();
        let pos = Position::whole_file(None);

        let mut sources = SourceList::new();
        let (first, _) = sources.push(&fs, "a.html", &pos, &mut log);
        let (second, _) = sources.push(&fs, "a.html", &pos, &mut log);
        assert_eq!(first, second);
        assert_eq!(sources.len(), 1);
        assert!(!sources.is_changed(&fs));

        fs.put("a.html", "y");
        assert!(sources.is_changed(&fs));
    }
}
