//! Directory-mapping cache
//!
//! The only in-memory copy of a directory's `GigaMapping` a process keeps.
//! Entries are handed out pinned: a lookup returns a shared handle that
//! keeps the mapping alive even if the LRU evicts the cache slot while a
//! request is still using it. The source of truth stays the mapping row
//! in the store; this cache is refreshed from it and written back on
//! splits.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::giga::GigaMapping;
use crate::metadata::InodeId;

/// A pinned mapping handle. Mutations go through the inner mutex and are
/// seen by every holder, the cache slot included.
///
/// Lock order: directory mutex first, then the mapping.
pub type CachedMapping = Arc<Mutex<GigaMapping>>;

pub struct DirMappingCache {
    inner: Mutex<LruCache<InodeId, CachedMapping>>,
}

impl DirMappingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, dir_id: InodeId) -> Option<CachedMapping> {
        self.inner.lock().get(&dir_id).cloned()
    }

    /// Insert a mapping and return its pinned handle.
    pub fn insert(&self, dir_id: InodeId, mapping: GigaMapping) -> CachedMapping {
        let handle = Arc::new(Mutex::new(mapping));
        self.inner.lock().put(dir_id, Arc::clone(&handle));
        handle
    }

    pub fn evict(&self, dir_id: InodeId) {
        self.inner.lock().pop(&dir_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_share_state() {
        let cache = DirMappingCache::new(8);
        let handle = cache.insert(1, GigaMapping::new(1, 0, 2));
        handle.lock().mark_split_done(1);

        let again = cache.get(1).unwrap();
        assert!(again.lock().bit(1));
    }

    #[test]
    fn test_pinned_handle_survives_eviction() {
        let cache = DirMappingCache::new(1);
        let pinned = cache.insert(1, GigaMapping::new(1, 0, 2));
        cache.insert(2, GigaMapping::new(2, 0, 2));

        // Slot 1 was evicted but the handle still works.
        assert!(cache.get(1).is_none());
        assert_eq!(pinned.lock().id, 1);
    }

    #[test]
    fn test_evict() {
        let cache = DirMappingCache::new(8);
        cache.insert(5, GigaMapping::new(5, 0, 1));
        cache.evict(5);
        assert!(cache.get(5).is_none());
    }
}
