//! Ordered key-value storage for metadata rows
//!
//! The metadata core treats its storage engine as a collaborator behind
//! the [`MetadataStore`] trait: an ordered store keyed by the 24-byte
//! composite `(parent inode, partition, name hash)`, with point ops, a
//! bounded scan inside one partition, and the extract/ingest pair splits
//! use to move a partition's migrating rows between servers as a
//! standalone sorted table.

pub mod memstore;
pub mod table;

pub use memstore::MemStore;
pub use table::{TableReader, TableWriter};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::giga::hash::{NameHash, HASH_LEN};
use crate::metadata::InodeId;

/// Encoded key length: parent u64 + partition i64 + hash.
pub const KEY_LEN: usize = 16 + HASH_LEN;

/// Partition id of the row storing a directory's serialized mapping.
pub const BITMAP_PARTITION: i64 = -1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Corruption(String),

    #[error("no extraction in progress")]
    NoExtraction,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Composite row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryKey {
    pub parent: InodeId,
    pub partition: i64,
    pub hash: NameHash,
}

impl EntryKey {
    pub fn new(parent: InodeId, partition: i64, hash: NameHash) -> Self {
        Self {
            parent,
            partition,
            hash,
        }
    }

    /// Key of the authoritative mapping row for a directory.
    pub fn bitmap(parent: InodeId) -> Self {
        Self {
            parent,
            partition: BITMAP_PARTITION,
            hash: [0u8; HASH_LEN],
        }
    }

    pub fn encode(&self) -> [u8; KEY_LEN] {
        let mut buf = [0u8; KEY_LEN];
        LittleEndian::write_u64(&mut buf[0..8], self.parent);
        LittleEndian::write_i64(&mut buf[8..16], self.partition);
        buf[16..].copy_from_slice(&self.hash);
        buf
    }

    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        if buf.len() != KEY_LEN {
            return Err(StoreError::Corruption(format!(
                "key has {} bytes, expected {}",
                buf.len(),
                KEY_LEN
            )));
        }
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&buf[16..]);
        Ok(Self {
            parent: LittleEndian::read_u64(&buf[0..8]),
            partition: LittleEndian::read_i64(&buf[8..16]),
            hash,
        })
    }

    /// The 16-byte `(parent, partition)` prefix shared by all rows of one
    /// partition.
    pub fn prefix(parent: InodeId, partition: i64) -> [u8; 16] {
        let mut buf = [0u8; 16];
        LittleEndian::write_u64(&mut buf[0..8], parent);
        LittleEndian::write_i64(&mut buf[8..16], partition);
        buf
    }
}

/// One page of a partition scan.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub values: Vec<Vec<u8>>,
    /// Hash to resume from; `None` once the partition is exhausted.
    pub end_hash: Option<NameHash>,
    /// True iff the row limit stopped the scan early.
    pub more: bool,
}

/// Result of extracting a partition's migrating rows.
#[derive(Debug, Clone, Copy)]
pub struct ExtractStats {
    pub moved: u64,
    pub min_seq: u64,
    pub max_seq: u64,
}

/// The storage contract the metadata core consumes.
///
/// `extract` and `ingest` must tolerate concurrent reads and writes on
/// other partitions; callers serialize concurrent extractions themselves.
pub trait MetadataStore: Send + Sync {
    fn get(&self, key: &EntryKey) -> StoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &EntryKey, value: &[u8]) -> StoreResult<()>;

    /// Idempotent: deleting an absent key succeeds.
    fn delete(&self, key: &EntryKey) -> StoreResult<()>;

    /// Ordered iteration inside one partition, starting at `start`
    /// (inclusive) and returning at most `limit` rows.
    fn scan(
        &self,
        parent: InodeId,
        partition: i64,
        start: Option<NameHash>,
        limit: usize,
    ) -> StoreResult<ScanPage>;

    /// Move the rows of `old_partition` that migrate to `new_partition`
    /// into a standalone sorted table under `out_dir`, rewriting their
    /// keys for the new partition and deleting them from the live store.
    /// Nothing is deleted unless the table was written out completely.
    fn extract(
        &self,
        parent: InodeId,
        old_partition: i64,
        new_partition: i64,
        out_dir: &std::path::Path,
    ) -> StoreResult<ExtractStats>;

    /// Remove the staging directory left behind by the last `extract`.
    fn extract_clean(&self) -> StoreResult<()>;

    /// Add a standalone table produced by `extract` to the live store.
    fn ingest(&self, table_dir: &std::path::Path, min_seq: u64, max_seq: u64) -> StoreResult<()>;

    /// Allocate one inode number from this server's stepped sequence.
    fn next_inode(&self) -> InodeId;

    /// Reserve a batch of stepped inode numbers, returning the first.
    fn next_inode_batch(&self, bulk: usize) -> InodeId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let key = EntryKey::new(42, 3, [1, 2, 3, 4, 5, 6, 7, 8]);
        let bytes = key.encode();
        assert_eq!(bytes.len(), KEY_LEN);
        assert_eq!(EntryKey::decode(&bytes).unwrap(), key);
    }

    #[test]
    fn test_bitmap_key_uses_negative_partition() {
        let key = EntryKey::bitmap(9);
        assert_eq!(key.partition, -1);
        assert_eq!(key.hash, [0u8; HASH_LEN]);
        let back = EntryKey::decode(&key.encode()).unwrap();
        assert_eq!(back.partition, -1);
    }

    #[test]
    fn test_prefix_matches_encoded_key() {
        let key = EntryKey::new(7, 2, [9u8; 8]);
        assert_eq!(&key.encode()[..16], &EntryKey::prefix(7, 2));
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(EntryKey::decode(&[0u8; 10]).is_err());
    }
}
