//! In-memory ordered store
//!
//! A `BTreeMap` over encoded keys, ordered byte-lexicographically. Rows of
//! one partition share their 16-byte key prefix, so a partition is always
//! one contiguous key range regardless of how parents interleave. Every
//! row carries the sequence number of the write that produced it; splits
//! ship those numbers along so the receiving store can keep its own
//! counter ahead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::table::{read_dir_tables, TableWriter};
use super::{EntryKey, ExtractStats, MetadataStore, ScanPage, StoreError, StoreResult};
use crate::giga::hash::{migrates_to, NameHash, HASH_LEN};
use crate::metadata::{InodeAllocator, InodeId};

#[derive(Debug, Clone)]
struct Row {
    seq: u64,
    data: Vec<u8>,
}

pub struct MemStore {
    rows: RwLock<BTreeMap<Vec<u8>, Row>>,
    seq: AtomicU64,
    inodes: InodeAllocator,
    /// Staging directory of the extraction awaiting `extract_clean`.
    extraction: Mutex<Option<PathBuf>>,
}

impl MemStore {
    pub fn new(server_id: u32) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            inodes: InodeAllocator::new(server_id),
            extraction: Mutex::new(None),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bounds of one partition's key range.
    fn partition_range(parent: InodeId, partition: i64, start: Option<NameHash>) -> (Vec<u8>, Vec<u8>) {
        let prefix = EntryKey::prefix(parent, partition);
        let mut low = prefix.to_vec();
        low.extend_from_slice(&start.unwrap_or([0u8; HASH_LEN]));
        let mut high = prefix.to_vec();
        high.extend_from_slice(&[0xFFu8; HASH_LEN]);
        (low, high)
    }

    #[cfg(test)]
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }
}

impl MetadataStore for MemStore {
    fn get(&self, key: &EntryKey) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .rows
            .read()
            .get(key.encode().as_slice())
            .map(|row| row.data.clone()))
    }

    fn put(&self, key: &EntryKey, value: &[u8]) -> StoreResult<()> {
        let row = Row {
            seq: self.next_seq(),
            data: value.to_vec(),
        };
        self.rows.write().insert(key.encode().to_vec(), row);
        Ok(())
    }

    fn delete(&self, key: &EntryKey) -> StoreResult<()> {
        self.rows.write().remove(key.encode().as_slice());
        Ok(())
    }

    fn scan(
        &self,
        parent: InodeId,
        partition: i64,
        start: Option<NameHash>,
        limit: usize,
    ) -> StoreResult<ScanPage> {
        let (low, high) = Self::partition_range(parent, partition, start);
        let rows = self.rows.read();
        let mut page = ScanPage::default();
        for (key, row) in rows.range(low..=high) {
            if page.values.len() >= limit {
                let next = EntryKey::decode(key)?;
                page.end_hash = Some(next.hash);
                page.more = true;
                break;
            }
            page.values.push(row.data.clone());
        }
        Ok(page)
    }

    fn extract(
        &self,
        parent: InodeId,
        old_partition: i64,
        new_partition: i64,
        out_dir: &Path,
    ) -> StoreResult<ExtractStats> {
        // Phase one: snapshot the migrating rows and build the table.
        // Nothing is deleted until the table is safely on disk, so a
        // failed build leaves the partition untouched.
        let moved: Vec<(Vec<u8>, Row, Vec<u8>)> = {
            let (low, high) = Self::partition_range(parent, old_partition, None);
            let rows = self.rows.read();
            rows.range(low..=high)
                .filter_map(|(key, row)| {
                    let decoded = EntryKey::decode(key).ok()?;
                    if migrates_to(&decoded.hash, new_partition as u32) {
                        let new_key = EntryKey::new(parent, new_partition, decoded.hash);
                        Some((key.clone(), row.clone(), new_key.encode().to_vec()))
                    } else {
                        None
                    }
                })
                .collect()
        };

        std::fs::create_dir_all(out_dir)?;
        let table_path = out_dir.join(format!("p{new_partition}-{:08x}.tab", 0));
        let mut writer = TableWriter::create(&table_path)?;
        let mut min_seq = u64::MAX;
        let mut max_seq = 0u64;
        for (_, row, new_key) in &moved {
            writer.add(new_key, row.seq, &row.data)?;
            min_seq = min_seq.min(row.seq);
            max_seq = max_seq.max(row.seq);
        }
        writer.finish()?;
        if moved.is_empty() {
            min_seq = 0;
        }

        // Phase two: the table exists, drop the rows from the live store.
        {
            let mut rows = self.rows.write();
            for (old_key, _, _) in &moved {
                rows.remove(old_key);
            }
        }

        *self.extraction.lock() = Some(out_dir.to_path_buf());

        Ok(ExtractStats {
            moved: moved.len() as u64,
            min_seq,
            max_seq,
        })
    }

    fn extract_clean(&self) -> StoreResult<()> {
        let dir = self.extraction.lock().take().ok_or(StoreError::NoExtraction)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn ingest(&self, table_dir: &Path, _min_seq: u64, max_seq: u64) -> StoreResult<()> {
        let records = read_dir_tables(table_dir)?;
        let mut rows = self.rows.write();
        for (key, seq, value) in records {
            if key.len() != super::KEY_LEN {
                return Err(StoreError::Corruption(format!(
                    "ingested key has {} bytes",
                    key.len()
                )));
            }
            rows.insert(key, Row { seq, data: value });
        }
        drop(rows);
        // Keep local sequence numbers ahead of everything swallowed.
        self.seq.fetch_max(max_seq, Ordering::Relaxed);
        Ok(())
    }

    fn next_inode(&self) -> InodeId {
        self.inodes.next_inode()
    }

    fn next_inode_batch(&self, bulk: usize) -> InodeId {
        self.inodes.next_batch(bulk)
    }
}
