//! The bounded LRU lookup cache: key bytes -> (starting vpage, page count,
//! value), used to short-circuit the on-flash probe loop.
//!
//! Built on the `lru` crate's `LruCache`, whose `peek`/`put`/`pop`/`clear`
//! already give exactly the add/update/lookup/remove/clean contract the
//! design doc describes -- crucially, `peek` does not promote to
//! most-recently-used, matching the source behavior that a plain lookup
//! leaves LRU order untouched (only `set`/`update` promote).

use lru::LruCache;
use std::num::NonZeroUsize;

/// Default capacity, per the design doc.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub vpage: u32,
    pub num_pages: u32,
    pub value: Vec<u8>,
}

pub struct LookupCache {
    inner: LruCache<Vec<u8>, CacheEntry>,
}

impl LookupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Does not reorder on hit -- this is the source behavior (see the
    /// design doc's note on LRU order), not an oversight.
    pub fn lookup(&self, key: &[u8]) -> Option<&CacheEntry> {
        self.inner.peek(key)
    }

    /// Inserts or replaces, promoting the entry to most-recently-used.
    /// Evicts the LRU entry first if already at capacity.
    pub fn update(&mut self, key: Vec<u8>, entry: CacheEntry) {
        self.inner.put(key, entry);
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.inner.pop(key);
    }

    pub fn clean(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
