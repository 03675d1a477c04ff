//! Filesystem abstraction used by the compiler and the caches.
//!
//! The engine never touches `std::fs` directly; every source read and every
//! change-detection stat goes through [`Filesystem`]. Hosts can plug in their
//! own implementation (a zip archive, a database, test fixtures); the
//! in-memory variant below doubles as the test harness.

use std::{
    fmt,
    fs,
    hash::{Hash, Hasher},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::UNIX_EPOCH,
};

use ahash::{AHasher, AHashMap};

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Failure of a filesystem operation, carrying the offending path.
#[derive(Debug)]
pub struct FsError {
    pub path: String,
    pub reason: String,
}

impl FsError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot access '{}': {}", self.path, self.reason)
    }
}

impl std::error::Error for FsError {}

/// Source of template, dictionary and configuration bytes.
///
/// The stat hash must be stable while a file's content and metadata are
/// unchanged and must change whenever any of size, mtime, ctime or inode
/// change; it drives the `watchfiles` change detection.
pub trait Filesystem: Send + Sync {
    /// Reads the whole file as UTF-8 text.
    fn read(&self, path: &str) -> FsResult<String>;

    /// Returns the change-detection hash for the file.
    fn stat(&self, path: &str) -> FsResult<u64>;
}

/// Collapses `.` and `..` components and redundant slashes.
///
/// Used to build canonical cache keys, so two spellings of the same path
/// share one cache entry.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Prepends the engine root to relative paths.
#[must_use]
pub fn abs_path(root: &str, path: &str) -> String {
    if root.is_empty() || path.is_empty() || path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{root}/{path}")
    }
}

/// Native filesystem rooted at a directory.
///
/// Relative paths resolve against the root; absolute paths are used verbatim.
#[derive(Debug, Default)]
pub struct NativeFilesystem {
    root: PathBuf,
}

impl NativeFilesystem {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() || self.root.as_os_str().is_empty() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

impl Filesystem for NativeFilesystem {
    fn read(&self, path: &str) -> FsResult<String> {
        let full = self.resolve(path);
        fs::read_to_string(&full).map_err(|err| {
            let reason = match err.kind() {
                io::ErrorKind::NotFound => "file not found".to_owned(),
                io::ErrorKind::PermissionDenied => "permission denied".to_owned(),
                _ => err.to_string(),
            };
            FsError::new(path, reason)
        })
    }

    fn stat(&self, path: &str) -> FsResult<u64> {
        let full = self.resolve(path);
        let meta = fs::metadata(&full).map_err(|err| FsError::new(path, err.to_string()))?;

        let mut hasher = AHasher::default();
        meta.len().hash(&mut hasher);
        if let Ok(mtime) = meta.modified()
            && let Ok(dur) = mtime.duration_since(UNIX_EPOCH)
        {
            dur.as_nanos().hash(&mut hasher);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            meta.ino().hash(&mut hasher);
            meta.ctime().hash(&mut hasher);
            meta.ctime_nsec().hash(&mut hasher);
        }
        Ok(hasher.finish())
    }
}

/// In-memory filesystem for tests and embedded templates.
///
/// Every write bumps the file's generation, so `watchfiles` change detection
/// sees updates exactly like real file metadata changes.
#[derive(Debug, Default)]
pub struct InMemoryFilesystem {
    files: Mutex<AHashMap<String, (String, u64)>>,
}

impl InMemoryFilesystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file.
    pub fn put(&self, path: impl Into<String>, content: impl Into<String>) {
        let mut files = self.files.lock().expect("filesystem poisoned");
        let path = path.into();
        let generation = files.get(&path).map_or(1, |(_, generation)| generation + 1);
        files.insert(path, (content.into(), generation));
    }

    /// Removes a file; subsequent reads fail with not-found.
    pub fn remove(&self, path: &str) {
        let mut files = self.files.lock().expect("filesystem poisoned");
        files.remove(path);
    }
}

impl Filesystem for InMemoryFilesystem {
    fn read(&self, path: &str) -> FsResult<String> {
        let files = self.files.lock().expect("filesystem poisoned");
        files
            .get(path)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| FsError::new(path, "file not found"))
    }

    fn stat(&self, path: &str) -> FsResult<u64> {
        let files = self.files.lock().expect("filesystem poisoned");
        files
            .get(path)
            .map(|(content, generation)| {
                let mut hasher = AHasher::default();
                content.len().hash(&mut hasher);
                generation.hash(&mut hasher);
                hasher.finish()
            })
            .ok_or_else(|| FsError::new(path, "file not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_segments() {
        assert_eq!(normalize_path("a/./b/../c.html"), "a/c.html");
        assert_eq!(normalize_path("/a//b/"), "/a/b");
        assert_eq!(normalize_path("../x"), "x");
    }

    #[test]
    fn memory_fs_generation_changes_hash() {
        let fs = InMemoryFilesystem::new();
        fs.put("t.html", "one");
        let first = fs.stat("t.html").unwrap();
        fs.put("t.html", "two");
        assert_ne!(first, fs.stat("t.html").unwrap());
    }
}
