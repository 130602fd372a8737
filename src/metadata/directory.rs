//! Per-directory control blocks
//!
//! Every directory a server currently touches has one in-memory control
//! block: the partition entry counter, the split-in-progress flag, and the
//! mutex/condvar pair that linearizes all mutations on the directory.
//! Blocks are reference counted and carry one standing reference from
//! their creation, so the counter state survives between requests; only
//! an explicit evict releases that pin.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::InodeId;

/// Mutable directory state, guarded by the directory mutex.
#[derive(Debug, Default)]
pub struct DirectoryState {
    /// Entries inserted into locally-owned partitions since the last
    /// split (mutations decrement it by the number of migrated rows).
    pub entry_count: i64,
    /// Set while a split task for this directory is queued or running.
    pub split_pending: bool,
}

/// Control block for one directory.
#[derive(Debug, Default)]
pub struct Directory {
    state: Mutex<DirectoryState>,
    cond: Condvar,
}

impl Directory {
    pub fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock()
    }

    /// Block until another thread signals progress on this directory.
    /// The guard must come from this directory's own mutex.
    pub fn wait(&self, guard: &mut MutexGuard<'_, DirectoryState>) {
        self.cond.wait(guard);
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

struct Slot {
    dir: Arc<Directory>,
    refs: u32,
}

/// Sharded map of live directory control blocks.
pub struct DirectoryTable {
    shards: Vec<Mutex<HashMap<InodeId, Slot>>>,
    mask: u64,
}

impl DirectoryTable {
    /// `shards` is rounded up to a power of two.
    pub fn new(shards: usize) -> Arc<Self> {
        let count = shards.max(1).next_power_of_two();
        Arc::new(Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
            mask: count as u64 - 1,
        })
    }

    fn shard(&self, dir_id: InodeId) -> &Mutex<HashMap<InodeId, Slot>> {
        &self.shards[(dir_id & self.mask) as usize]
    }

    /// Pin the control block for a directory, creating it on first use.
    /// Creation leaves one standing reference behind, so the block (and
    /// its entry counter) outlives the handles.
    pub fn get(self: &Arc<Self>, dir_id: InodeId) -> DirRef {
        let dir = {
            let mut shard = self.shard(dir_id).lock();
            let slot = shard.entry(dir_id).or_insert_with(|| Slot {
                dir: Arc::new(Directory::default()),
                refs: 1,
            });
            slot.refs += 1;
            Arc::clone(&slot.dir)
        };
        DirRef {
            table: Arc::clone(self),
            dir_id,
            dir,
        }
    }

    fn release(&self, dir_id: InodeId) {
        let mut shard = self.shard(dir_id).lock();
        if let Some(slot) = shard.get_mut(&dir_id) {
            slot.refs -= 1;
            if slot.refs == 0 {
                shard.remove(&dir_id);
            }
        }
    }

    /// Drop the standing reference; the block disappears once the last
    /// outstanding handle goes away.
    pub fn evict(&self, dir_id: InodeId) {
        self.release(dir_id);
    }

    #[cfg(test)]
    fn contains(&self, dir_id: InodeId) -> bool {
        self.shard(dir_id).lock().contains_key(&dir_id)
    }
}

/// A pinned directory control block. The pin is released on drop, on
/// every exit path.
pub struct DirRef {
    table: Arc<DirectoryTable>,
    dir_id: InodeId,
    dir: Arc<Directory>,
}

impl DirRef {
    pub fn dir_id(&self) -> InodeId {
        self.dir_id
    }
}

impl std::ops::Deref for DirRef {
    type Target = Directory;

    fn deref(&self) -> &Directory {
        &self.dir
    }
}

impl Drop for DirRef {
    fn drop(&mut self) {
        self.table.release(self.dir_id);
    }
}
