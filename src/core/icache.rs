//! Inode location cache
//!
//! Maps inode numbers to the inode-table block and byte offset holding the
//! on-disk inode. It is a derived index: dropping it loses nothing, and any
//! handle without one rebuilds it lazily.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where an inode lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeLocation {
    pub group: u32,
    /// Inode-table block holding the inode
    pub block: u64,
    /// Byte offset inside that block
    pub offset: u32,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded LRU inode location cache, shared between duplicated handles
pub struct InodeCache {
    entries: Mutex<LruCache<u32, InodeLocation>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl InodeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        InodeCache {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, ino: u32) -> Option<InodeLocation> {
        let found = self.entries.lock().get(&ino).copied();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn insert(&self, ino: u32, location: InodeLocation) {
        self.entries.lock().put(ino, location);
    }

    pub fn invalidate(&self, ino: u32) {
        self.entries.lock().pop(&ino);
    }

    /// Drop every entry.
    pub fn flush(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> InodeCacheStats {
        InodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(block: u64) -> InodeLocation {
        InodeLocation {
            group: 0,
            block,
            offset: 0,
        }
    }

    #[test]
    fn test_lru_eviction() {
        let cache = InodeCache::new(2);
        cache.insert(1, loc(10));
        cache.insert(2, loc(20));
        assert_eq!(cache.get(1), Some(loc(10)));

        // 2 is now least recently used
        cache.insert(3, loc(30));
        assert_eq!(cache.get(2), None);
        assert_eq!(cache.len(), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_invalidate_and_flush() {
        let cache = InodeCache::new(8);
        cache.insert(5, loc(1));
        cache.insert(6, loc(2));
        cache.invalidate(5);
        assert_eq!(cache.get(5), None);
        cache.flush();
        assert!(cache.is_empty());
    }
}
