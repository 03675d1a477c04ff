//! Content-addressed cache with LRU eviction and dependency serials.
//!
//! Three instances of this cache back the engine: programs, dictionaries and
//! configurations. Reference counting rides on `Arc`: a lookup hands out a
//! clone, so an entry can be superseded in the cache while renders that
//! already borrowed it keep running; the superseded value is destroyed when
//! the last borrower drops it.
//!
//! Dependency serials chain the three caches together: a program remembers
//! the serial of the dictionary generation it was compiled against, a
//! dictionary remembers its configuration's serial. A mismatch is a miss,
//! which forces a rebuild against the current generation.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use md5::{Digest, Md5};

use crate::filesystem::{abs_path, normalize_path};

/// Cache key: one normalized component per contributing source.
pub type CacheKey = Vec<String>;

/// Canonical key component for a file-backed source.
#[must_use]
pub fn key_for_filename(fs_root: &str, filename: &str) -> String {
    normalize_path(&abs_path(fs_root, filename))
}

/// Canonical key component for an inline template string.
#[must_use]
pub fn key_for_string(content: &str) -> String {
    format!("{:x}", Md5::digest(content.as_bytes()))
}

/// A cache hit.
#[derive(Debug)]
pub struct CachedEntry<T> {
    pub data: Arc<T>,
    pub serial: u64,
    pub depend_serial: u64,
}

#[derive(Debug)]
struct Entry<T> {
    data: Arc<T>,
    serial: u64,
    depend_serial: u64,
}

#[derive(Debug)]
struct Inner<T> {
    map: AHashMap<CacheKey, Entry<T>>,
    /// Keys, most recently used first.
    lru: Vec<CacheKey>,
    /// Highest serial ever used per key; survives entry replacement.
    serials: AHashMap<CacheKey, u64>,
}

/// LRU + dependency-serial cache keyed by source fingerprints.
#[derive(Debug)]
pub struct Cache<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T> Cache<T> {
    pub const DEFAULT_CAPACITY: usize = 50;

    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: AHashMap::new(),
                lru: Vec::new(),
                serials: AHashMap::new(),
            }),
            capacity: if capacity == 0 {
                Self::DEFAULT_CAPACITY
            } else {
                capacity
            },
        }
    }

    /// Looks an entry up; a `required_depend_serial` mismatch is a miss.
    #[must_use]
    pub fn find(
        &self,
        key: &CacheKey,
        required_depend_serial: Option<u64>,
    ) -> Option<CachedEntry<T>> {
        let mut inner = self.inner.lock().expect("cache poisoned");
        let entry = inner.map.get(key)?;
        if let Some(required) = required_depend_serial
            && entry.depend_serial != required
        {
            return None;
        }
        let hit = CachedEntry {
            data: Arc::clone(&entry.data),
            serial: entry.serial,
            depend_serial: entry.depend_serial,
        };
        touch(&mut inner.lru, key);
        Some(hit)
    }

    /// Drops an entry so the next lookup misses; borrowed handles stay
    /// alive.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        inner.map.remove(key);
        inner.lru.retain(|k| k != key);
    }

    /// Inserts a freshly built value, superseding any entry under the key.
    ///
    /// Returns the stored handle and the new serial. The capacity is a soft
    /// cap: only entries nobody borrows are evicted.
    pub fn add(&self, key: CacheKey, data: T, depend_serial: u64) -> CachedEntry<T> {
        let mut inner = self.inner.lock().expect("cache poisoned");

        let serial = match inner.serials.get(&key) {
            Some(last) => last + 1,
            None => 0,
        };
        inner.serials.insert(key.clone(), serial);

        // supersede; readers holding the old Arc keep it alive
        inner.map.remove(&key);
        inner.lru.retain(|k| k != &key);

        if inner.map.len() >= self.capacity {
            evict_one(&mut inner);
        }

        let data = Arc::new(data);
        let hit = CachedEntry {
            data: Arc::clone(&data),
            serial,
            depend_serial,
        };
        inner.map.insert(
            key.clone(),
            Entry {
                data,
                serial,
                depend_serial,
            },
        );
        inner.lru.insert(0, key);
        hit
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache poisoned").map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch(lru: &mut Vec<CacheKey>, key: &CacheKey) {
    match lru.iter().position(|k| k == key) {
        Some(0) => {}
        Some(i) => {
            let entry = lru.remove(i);
            lru.insert(0, entry);
        }
        None => lru.insert(0, key.clone()),
    }
}

/// Evicts the least recently used entry nobody is borrowing.
fn evict_one<T>(inner: &mut Inner<T>) {
    let candidate = inner
        .lru
        .iter()
        .rev()
        .position(|key| {
            inner
                .map
                .get(key)
                .is_none_or(|entry| Arc::strong_count(&entry.data) == 1)
        })
        .map(|rev_i| inner.lru.len() - 1 - rev_i);
    if let Some(i) = candidate {
        let key = inner.lru.remove(i);
        inner.map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        vec![name.to_owned()]
    }

    #[test]
    fn serial_increments_on_replacement() {
        let cache: Cache<i32> = Cache::new(4);
        let first = cache.add(key("a"), 1, 0);
        assert_eq!(first.serial, 0);
        let second = cache.add(key("a"), 2, 0);
        assert_eq!(second.serial, 1);
        assert_eq!(*cache.find(&key("a"), None).unwrap().data, 2);
        // the first handle still reads the superseded value
        assert_eq!(*first.data, 1);
    }

    #[test]
    fn dependency_serial_mismatch_is_a_miss() {
        let cache: Cache<i32> = Cache::new(4);
        cache.add(key("a"), 1, 7);
        assert!(cache.find(&key("a"), Some(7)).is_some());
        assert!(cache.find(&key("a"), Some(8)).is_none());
        assert!(cache.find(&key("a"), None).is_some());
    }

    #[test]
    fn eviction_skips_borrowed_entries() {
        let cache: Cache<i32> = Cache::new(2);
        let held = cache.add(key("a"), 1, 0);
        cache.add(key("b"), 2, 0);
        // "a" is LRU but borrowed; "b" is the evictable one
        cache.add(key("c"), 3, 0);
        assert!(cache.find(&key("a"), None).is_some());
        assert!(cache.find(&key("b"), None).is_none());
        assert!(cache.find(&key("c"), None).is_some());
        drop(held);
    }

    #[test]
    fn soft_cap_accepts_overflow_when_all_borrowed() {
        let cache: Cache<i32> = Cache::new(1);
        let _a = cache.find(&key("a"), None);
        let a = cache.add(key("a"), 1, 0);
        let b = cache.add(key("b"), 2, 0);
        assert_eq!(cache.len(), 2);
        drop((a, b));
    }

    #[test]
    fn string_keys_are_md5() {
        assert_eq!(key_for_string(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_ne!(key_for_string("x"), key_for_string("y"));
    }

    #[test]
    fn filename_keys_normalize() {
        assert_eq!(key_for_filename("/root", "a/../b.html"), "/root/b.html");
        assert_eq!(key_for_filename("/root", "/abs.html"), "/abs.html");
    }
}
