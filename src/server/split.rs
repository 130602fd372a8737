//! Background partition splits
//!
//! Overflowing partitions are handed to a single dedicated worker thread
//! per server. A split picks the child partition, extracts the migrating
//! rows into a staging table, ships the table to the child's server for
//! ingest, then commits the child bit and propagates the new bitmap.
//! When parent and child land on the same server there is nothing to
//! move; the split is purely a bitmap update.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use super::MetadataServer;
use crate::metadata::InodeId;
use crate::rpc::proto::{Reply, Request};
use crate::rpc::{FsError, OpResult, WireBitmap};
use crate::store::table::read_dir_tables;
use crate::store::{EntryKey, StoreError};

/// One queued split.
#[derive(Debug, Clone, Copy)]
pub struct SplitTask {
    pub dir_id: InodeId,
    pub partition: u32,
}

/// The split worker thread. It drains the task queue until the channel
/// closes with the server.
pub struct SplitEngine {
    _handle: JoinHandle<()>,
}

impl SplitEngine {
    pub fn spawn(tasks: Receiver<SplitTask>, server: Arc<MetadataServer>) -> Self {
        let server_id = server.server_id();
        let handle = std::thread::Builder::new()
            .name(format!("split-{server_id}"))
            .spawn(move || {
                while let Ok(task) = tasks.recv() {
                    if let Err(e) = server.execute_split(task) {
                        tracing::error!(
                            "split[{}] of partition {} failed: {}",
                            task.dir_id,
                            task.partition,
                            e
                        );
                    }
                }
                tracing::info!("Split engine for server {} stopped", server_id);
            })
            .unwrap_or_else(|e| panic!("failed to spawn split engine: {e}"));
        Self { _handle: handle }
    }
}

impl MetadataServer {
    fn split_staging_dir(
        &self,
        dir_id: InodeId,
        parent: u32,
        child: u32,
        parent_server: u32,
        child_server: u32,
    ) -> PathBuf {
        self.config().paths.split_dir.join(format!(
            "sst-d{dir_id}-p{parent}p{child}-s{parent_server}s{child_server}"
        ))
    }

    /// Run one split to completion. Holds the directory mutex throughout
    /// and the server-wide extraction mutex around the table build.
    pub(crate) fn execute_split(&self, task: SplitTask) -> Result<(), FsError> {
        let SplitTask { dir_id, partition } = task;
        let _extract_guard = self.split_mtx.lock();
        let handle = self.fetch_dir(dir_id)?;
        let mut state = handle.dir.lock();

        let parent_server = self.server_id();
        let (child, child_server, wire) = {
            let mapping = handle.mapping.lock();
            match mapping.split_child(partition) {
                Some(child) => (
                    child,
                    mapping.server_for_index(child),
                    WireBitmap::from(&*mapping),
                ),
                None => {
                    // Raced with a policy change or a merged bitmap; the
                    // partition can no longer split.
                    state.split_pending = false;
                    handle.dir.notify_all();
                    return Ok(());
                }
            }
        };
        tracing::info!(
            "split[{}]: p{} s{} -> p{} s{}",
            dir_id,
            partition,
            parent_server,
            child,
            child_server
        );

        let staging =
            self.split_staging_dir(dir_id, partition, child, parent_server, child_server);
        let stats = match self
            .store()
            .extract(dir_id, partition as i64, child as i64, &staging)
        {
            Ok(stats) => stats,
            Err(e @ StoreError::Corruption(_)) => {
                // A store that cannot enumerate its own rows while
                // building a split table is corrupt; there is no safe
                // way to keep serving from it.
                tracing::error!(
                    "split[{}]: store corruption while extracting p{}: {}",
                    dir_id,
                    partition,
                    e
                );
                std::process::abort();
            }
            Err(e) => {
                state.split_pending = false;
                handle.dir.notify_all();
                return Err(e.into());
            }
        };

        if child_server == parent_server {
            // Both partitions live here; the rows only change keys.
            if let Err(e) = self.store().ingest(&staging, stats.min_seq, stats.max_seq) {
                self.restore_extract(dir_id, partition, &staging);
                state.split_pending = false;
                handle.dir.notify_all();
                return Err(e.into());
            }
        } else if stats.moved > 0 {
            let request = Request::InsertSplit {
                dir_id,
                parent_index: partition,
                child_index: child,
                table_dir: staging.to_string_lossy().into_owned(),
                mapping: wire,
                min_seq: stats.min_seq,
                max_seq: stats.max_seq,
                num_entries: stats.moved,
            };
            if let Err(e) = self.peers().call(child_server, &request) {
                tracing::error!(
                    "split[{}]: shipping p{} to server {} failed: {}",
                    dir_id,
                    child,
                    child_server,
                    e
                );
                // The child bit stays clear; put the extracted rows
                // back so the partition is whole for the retry.
                self.restore_extract(dir_id, partition, &staging);
                state.split_pending = false;
                handle.dir.notify_all();
                return Err(e);
            }
        }
        let moved = stats.moved;

        {
            let mut mapping = handle.mapping.lock();
            mapping.mark_split_done(child);
            if let Err(e) = self
                .store()
                .put(&EntryKey::bitmap(dir_id), &mapping.to_bytes())
            {
                tracing::error!("split[{}]: failed to persist bitmap: {}", dir_id, e);
            }
        }
        state.entry_count -= moved as i64;

        if child_server != parent_server {
            let (zeroth, wire) = {
                let mapping = handle.mapping.lock();
                (mapping.zeroth_server, WireBitmap::from(&*mapping))
            };
            if zeroth != parent_server {
                let request = Request::UpdateBitmap {
                    dir_id,
                    mapping: wire,
                };
                if let Err(e) = self.peers().call(zeroth, &request) {
                    // The child already serves its partition; lagging
                    // caches converge through redirections.
                    tracing::warn!(
                        "split[{}]: bitmap update to zeroth server {} failed: {}",
                        dir_id,
                        zeroth,
                        e
                    );
                }
            }
        }
        if let Err(e) = self.store().extract_clean() {
            tracing::warn!("split[{}]: staging cleanup failed: {}", dir_id, e);
        }

        state.split_pending = false;
        handle.dir.notify_all();
        Ok(())
    }

    /// Undo a committed extraction whose shipment failed: replay the
    /// staging table back into the parent partition.
    fn restore_extract(&self, dir_id: InodeId, parent_partition: u32, staging: &Path) {
        let rows = match read_dir_tables(staging) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(
                    "split[{}]: cannot read staging dir {} for restore: {}",
                    dir_id,
                    staging.display(),
                    e
                );
                return;
            }
        };
        let mut restored = 0u64;
        for (key, _seq, value) in rows {
            let decoded = match EntryKey::decode(&key) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::error!("split[{}]: corrupt staging key: {}", dir_id, e);
                    continue;
                }
            };
            let original = EntryKey::new(dir_id, parent_partition as i64, decoded.hash);
            if let Err(e) = self.store().put(&original, &value) {
                tracing::error!("split[{}]: restore of a row failed: {}", dir_id, e);
                continue;
            }
            restored += 1;
        }
        tracing::warn!(
            "split[{}]: restored {} rows into partition {}",
            dir_id,
            restored,
            parent_partition
        );
        if let Err(e) = self.store().extract_clean() {
            tracing::warn!("split[{}]: staging cleanup failed: {}", dir_id, e);
        }
    }

    /// Receive a shipped partition: ingest the staging table, then install
    /// or extend the directory mapping with the child bit set.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert_split(
        &self,
        dir_id: InodeId,
        parent_index: u32,
        child_index: u32,
        table_dir: &str,
        wire: &WireBitmap,
        min_seq: u64,
        max_seq: u64,
        num_entries: u64,
    ) -> OpResult {
        tracing::info!(
            "InsertSplit[{}]: p{} -> p{} from {}",
            dir_id,
            parent_index,
            child_index,
            table_dir
        );
        self.store().ingest(Path::new(table_dir), min_seq, max_seq)?;

        match self.fetch_dir(dir_id) {
            Ok(handle) => {
                let mut state = handle.dir.lock();
                {
                    let mut mapping = handle.mapping.lock();
                    mapping.mark_split_done(child_index);
                    self.store()
                        .put(&EntryKey::bitmap(dir_id), &mapping.to_bytes())?;
                }
                state.entry_count += num_entries as i64;
            }
            Err(FsError::FileNotFound) => {
                // First partition of this directory on this server: adopt
                // the sender's bitmap with the child bit set.
                let mut mapping = wire.to_mapping()?;
                mapping.mark_split_done(child_index);
                self.store()
                    .put(&EntryKey::bitmap(dir_id), &mapping.to_bytes())?;
                let handle = self.fetch_dir(dir_id)?;
                let mut state = handle.dir.lock();
                state.entry_count += num_entries as i64;
            }
            Err(e) => return Err(e),
        }
        Ok(Reply::Ok)
    }
}
