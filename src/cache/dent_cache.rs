//! Directory-entry lookup caches
//!
//! Two variants share the `(parent inode, entry name)` key space. The
//! server cache is the lease book-keeper: each entry carries the lease
//! expiry, the read/write state used to hold mutations until outstanding
//! leases drain, and request-rate counters. The client cache is the
//! passive consumer: an entry is usable until its expiry passes.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::metadata::{InodeId, ServerId};

/// Lease state of a server-side directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Lookups may be served and extended.
    Read,
    /// A mutation is pending; lookups wait, leases stop extending.
    Write,
}

/// Server-side cache value.
///
/// Guarded by its own mutex; all transitions additionally happen under
/// the owning directory's mutex (dir mutex first, then the entry).
#[derive(Debug)]
pub struct ServerDirEntry {
    /// `None` until materialized from the store.
    pub inode_id: Option<InodeId>,
    pub zeroth_server: Option<ServerId>,
    /// Lease expiry, microseconds since the epoch.
    pub expire_time: u64,
    pub status: LeaseStatus,
    pub read_hits: u64,
    pub write_hits: u64,
}

impl ServerDirEntry {
    fn placeholder() -> Self {
        Self {
            inode_id: None,
            zeroth_server: None,
            expire_time: 0,
            status: LeaseStatus::Read,
            read_hits: 0,
            write_hits: 0,
        }
    }
}

pub struct ServerDentCache {
    inner: Mutex<LruCache<(InodeId, String), Arc<Mutex<ServerDirEntry>>>>,
}

impl ServerDentCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, dir_id: InodeId, name: &str) -> Option<Arc<Mutex<ServerDirEntry>>> {
        self.inner.lock().get(&(dir_id, name.to_string())).cloned()
    }

    /// Fetch an entry, creating an unmaterialized placeholder on miss.
    pub fn get_or_insert(&self, dir_id: InodeId, name: &str) -> Arc<Mutex<ServerDirEntry>> {
        let mut inner = self.inner.lock();
        let key = (dir_id, name.to_string());
        if let Some(entry) = inner.get(&key) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(Mutex::new(ServerDirEntry::placeholder()));
        inner.put(key, Arc::clone(&entry));
        entry
    }

    pub fn evict(&self, dir_id: InodeId, name: &str) {
        self.inner.lock().pop(&(dir_id, name.to_string()));
    }
}

/// Client-side cache value: a lookup result valid until `expire_time`.
#[derive(Debug, Clone, Copy)]
pub struct ClientDirEntry {
    pub inode_id: InodeId,
    pub zeroth_server: ServerId,
    /// Lease expiry, microseconds since the epoch.
    pub expire_time: u64,
}

impl ClientDirEntry {
    pub fn is_valid(&self, now_micros: u64) -> bool {
        now_micros < self.expire_time
    }
}

pub struct ClientDentCache {
    inner: Mutex<LruCache<(InodeId, String), ClientDirEntry>>,
}

impl ClientDentCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, dir_id: InodeId, name: &str) -> Option<ClientDirEntry> {
        self.inner.lock().get(&(dir_id, name.to_string())).copied()
    }

    pub fn put(&self, dir_id: InodeId, name: &str, value: ClientDirEntry) {
        self.inner.lock().put((dir_id, name.to_string()), value);
    }

    pub fn evict(&self, dir_id: InodeId, name: &str) {
        self.inner.lock().pop(&(dir_id, name.to_string()));
    }
}
