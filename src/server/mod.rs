//! The metadata server
//!
//! Every entry-scoped operation runs the same preamble: pin the directory
//! control block and its mapping, take the directory mutex, and verify
//! that this server actually owns the partition the entry's hash selects.
//! A request routed with a stale bitmap is answered with a redirection
//! carrying the current one, never executed.
//!
//! Mutations that would invalidate cached lookups (chmod, remove, rename
//! of directories) first move the entry's lease to the write state and
//! wait out any lease still held by a client, so no client ever observes
//! a stale lookup past a completed mutation.

pub mod split;

pub use split::{SplitEngine, SplitTask};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, MutexGuard};

use crate::cache::{
    CachedMapping, DirMappingCache, LeaseStatus, ServerDentCache, ServerDirEntry,
};
use crate::config::{ConfigError, ServerConfig};
use crate::giga::hash::name_hash;
use crate::giga::GigaMapping;
use crate::metadata::directory::DirectoryState;
use crate::metadata::{
    now_micros, DirRef, DirectoryTable, EntryValue, FileState, InodeId, ServerId, StatInfo,
    ROOT_INODE,
};
use crate::rpc::proto::{
    AccessGrant, OpenReply, Reply, Request, ScanPlusReply, ScanReply, WriteReply,
};
use crate::rpc::{FsError, OpResult, RpcClient, WireBitmap};
use crate::store::{EntryKey, MetadataStore};

/// Slack added to lease waits so clock skew between grant and enforcement
/// cannot shave a lease short.
pub const LEASE_EPSILON_US: u64 = 10_000;

/// Shortest lease a server will grant.
pub const LEASE_MIN_US: u64 = 200_000;

/// Longest lease a server will grant.
pub const LEASE_MAX_US: u64 = 1_000_000;

/// A pinned directory: control block plus mapping handle.
pub(crate) struct DirHandle {
    pub dir: DirRef,
    pub mapping: CachedMapping,
}

pub struct MetadataServer {
    config: Arc<ServerConfig>,
    server_id: ServerId,
    store: Arc<dyn MetadataStore>,
    dirs: Arc<DirectoryTable>,
    dmaps: DirMappingCache,
    dents: ServerDentCache,
    peers: RpcClient,
    split_tx: Sender<SplitTask>,
    /// Serializes table extraction across all directories of this server.
    pub(crate) split_mtx: Mutex<()>,
}

impl MetadataServer {
    /// Build a server and its split engine.
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn MetadataStore>,
    ) -> Result<(Arc<Self>, SplitEngine), ConfigError> {
        let peers = RpcClient::new(
            config.server_addrs()?,
            Duration::from_secs(config.network.timeout_secs),
        );
        let (split_tx, split_rx) = crossbeam_channel::unbounded();
        let server = Arc::new(Self {
            server_id: config.node.server_id,
            dirs: DirectoryTable::new(config.tuning.dir_table_shards),
            dmaps: DirMappingCache::new(config.tuning.dmap_cache_entries),
            dents: ServerDentCache::new(config.tuning.dent_cache_entries),
            peers,
            split_tx,
            split_mtx: Mutex::new(()),
            store,
            config,
        });
        let engine = SplitEngine::spawn(split_rx, Arc::clone(&server));
        Ok((server, engine))
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub(crate) fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    pub(crate) fn peers(&self) -> &RpcClient {
        &self.peers
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Create the root directory's mapping row. Server 0 calls this at
    /// startup; running it twice is harmless.
    pub fn bootstrap_root(&self) -> Result<(), FsError> {
        match self.create_zeroth(ROOT_INODE) {
            Ok(_) | Err(FsError::FileAlreadyExist) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Route one wire request to its handler.
    pub fn dispatch(&self, request: Request) -> OpResult {
        match request {
            Request::Init => Ok(Reply::Init(true)),
            Request::Getattr {
                dir_id,
                name,
                lease_time,
            } => self.getattr(dir_id, &name, lease_time),
            Request::Access {
                dir_id,
                name,
                lease_time,
            } => self.access(dir_id, &name, lease_time),
            Request::Mknod { dir_id, name, perm } => self.mknod(dir_id, &name, perm),
            Request::Mkdir {
                dir_id,
                name,
                perm,
                hint_server,
            } => self.mkdir(dir_id, &name, perm, hint_server),
            Request::CreateEntry {
                dir_id,
                name,
                info,
                realpath,
                data,
            } => self.create_entry(dir_id, &name, info, realpath, data),
            Request::CreateZeroth { dir_id } => self.create_zeroth(dir_id),
            Request::Chmod { dir_id, name, perm } => self.chmod(dir_id, &name, perm),
            Request::Remove { dir_id, name } => self.remove(dir_id, &name),
            Request::Rename {
                src_id,
                src_name,
                dst_id,
                dst_name,
            } => self.rename(src_id, &src_name, dst_id, &dst_name),
            Request::Readdir {
                dir_id,
                partition,
                start_hash,
                limit,
            } => self.readdir(dir_id, partition, start_hash, limit),
            Request::ReaddirPlus {
                dir_id,
                partition,
                start_hash,
                limit,
            } => self.readdir_plus(dir_id, partition, start_hash, limit),
            Request::ReadBitmap { dir_id } => self.read_bitmap(dir_id),
            Request::UpdateBitmap { dir_id, mapping } => self.update_bitmap(dir_id, &mapping),
            Request::InsertSplit {
                dir_id,
                parent_index,
                child_index,
                table_dir,
                mapping,
                min_seq,
                max_seq,
                num_entries,
            } => self.insert_split(
                dir_id,
                parent_index,
                child_index,
                &table_dir,
                &mapping,
                min_seq,
                max_seq,
                num_entries,
            ),
            Request::OpenFile { dir_id, name, mode } => self.open_file(dir_id, &name, mode),
            Request::ReadFile {
                dir_id,
                name,
                offset,
                size,
            } => self.read_file(dir_id, &name, offset, size),
            Request::WriteFile {
                dir_id,
                name,
                data,
                offset,
            } => self.write_file(dir_id, &name, data, offset),
            Request::CloseFile { dir_id, name, mode } => self.close_file(dir_id, &name, mode),
        }
    }

    // ---- preamble ------------------------------------------------------

    /// Pin the control block and mapping of a directory. The mapping comes
    /// from the cache or, on the first touch, from the local mapping row.
    pub(crate) fn fetch_dir(&self, dir_id: InodeId) -> Result<DirHandle, FsError> {
        let dir = self.dirs.get(dir_id);
        if let Some(mapping) = self.dmaps.get(dir_id) {
            return Ok(DirHandle { dir, mapping });
        }

        // Double-checked under the directory mutex so one thread loads.
        let state = dir.lock();
        if let Some(mapping) = self.dmaps.get(dir_id) {
            drop(state);
            return Ok(DirHandle { dir, mapping });
        }
        let bytes = self
            .store
            .get(&EntryKey::bitmap(dir_id))?
            .ok_or(FsError::FileNotFound)?;
        let mapping =
            GigaMapping::from_bytes(&bytes).map_err(|e| FsError::Io(e.to_string()))?;
        let mapping = self.dmaps.insert(dir_id, mapping);
        drop(state);
        Ok(DirHandle { dir, mapping })
    }

    /// Partition index for `name`, or a redirection carrying the current
    /// bitmap when the entry does not belong to this server.
    fn check_addressing(&self, mapping: &GigaMapping, name: &str) -> Result<u32, FsError> {
        let index = mapping.partition_for_name(name);
        if mapping.server_for_index(index) != self.server_id {
            tracing::debug!(
                "Redirecting {:?}: partition {} is not ours",
                name,
                index
            );
            return Err(FsError::Redirect(WireBitmap::from(mapping)));
        }
        Ok(index)
    }

    fn addressed_partition(&self, handle: &DirHandle, name: &str) -> Result<u32, FsError> {
        let mapping = handle.mapping.lock();
        self.check_addressing(&mapping, name)
    }

    fn load_entry(&self, dir_id: InodeId, partition: u32, name: &str) -> Result<EntryValue, FsError> {
        let key = EntryKey::new(dir_id, partition as i64, name_hash(name));
        let bytes = self.store.get(&key)?.ok_or(FsError::FileNotFound)?;
        EntryValue::decode(&bytes).map_err(|e| FsError::Io(e.to_string()))
    }

    fn store_entry(
        &self,
        dir_id: InodeId,
        partition: u32,
        name: &str,
        value: &EntryValue,
    ) -> Result<(), FsError> {
        let key = EntryKey::new(dir_id, partition as i64, name_hash(name));
        Ok(self.store.put(&key, &value.encode())?)
    }

    /// Count the insert and, once the partition crosses the threshold,
    /// hand it to the split engine. At most one split per directory is in
    /// flight.
    fn schedule_split(&self, handle: &DirHandle, state: &mut DirectoryState, index: u32) {
        state.entry_count += 1;
        if state.entry_count < self.config.tuning.split_threshold || state.split_pending {
            return;
        }
        let splittable = handle
            .mapping
            .lock()
            .is_splittable(index, self.config.tuning.split_policy);
        if !splittable {
            return;
        }
        state.split_pending = true;
        let task = SplitTask {
            dir_id: handle.dir.dir_id(),
            partition: index,
        };
        if self.split_tx.send(task).is_err() {
            tracing::warn!("Split queue is closed; dropping split request");
            state.split_pending = false;
        } else {
            tracing::debug!(
                "Scheduled split of dir {} partition {} at {} entries",
                handle.dir.dir_id(),
                index,
                state.entry_count
            );
        }
    }

    // ---- leases --------------------------------------------------------

    fn grant_lease(&self, requested: u64) -> u64 {
        requested.max(LEASE_MIN_US).min(LEASE_MAX_US)
    }

    /// Move a directory entry into the write state, waiting out any
    /// outstanding read lease. Runs under the directory mutex; the mutex
    /// is dropped while sleeping so lookups on other entries proceed.
    fn write_lock_dirent(
        &self,
        handle: &DirHandle,
        state: &mut MutexGuard<'_, DirectoryState>,
        dir_id: InodeId,
        name: &str,
    ) -> Arc<Mutex<ServerDirEntry>> {
        match self.dents.get(dir_id, name) {
            Some(entry) => {
                entry.lock().write_hits += 1;
                loop {
                    if entry.lock().status != LeaseStatus::Write {
                        break;
                    }
                    handle.dir.wait(state);
                }
                let sleep_us = {
                    let mut e = entry.lock();
                    let now = now_micros();
                    if now + LEASE_EPSILON_US < e.expire_time {
                        e.status = LeaseStatus::Write;
                        Some(e.expire_time - now + LEASE_EPSILON_US)
                    } else {
                        None
                    }
                };
                if let Some(micros) = sleep_us {
                    tracing::debug!(
                        "Holding mutation of {:?} for {}us of outstanding lease",
                        name,
                        micros
                    );
                    MutexGuard::unlocked(state, || {
                        std::thread::sleep(Duration::from_micros(micros));
                    });
                }
                entry
            }
            None => {
                let entry = self.dents.get_or_insert(dir_id, name);
                let mut e = entry.lock();
                e.status = LeaseStatus::Write;
                e.write_hits += 1;
                drop(e);
                entry
            }
        }
    }

    fn unlock_dirent(&self, handle: &DirHandle, entry: &Arc<Mutex<ServerDirEntry>>) {
        entry.lock().status = LeaseStatus::Read;
        handle.dir.notify_all();
    }

    // ---- operations ----------------------------------------------------

    fn getattr(&self, dir_id: InodeId, name: &str, _lease_time: u64) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let _state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;
        let value = self.load_entry(dir_id, index, name)?;
        Ok(Reply::Stat(value.stat))
    }

    fn access(&self, dir_id: InodeId, name: &str, lease_time: u64) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mut state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let entry = match self.dents.get(dir_id, name) {
            Some(entry) => {
                // A writer may be parked on this entry; wait until its
                // hold expires or it finishes.
                loop {
                    let (status, expire) = {
                        let e = entry.lock();
                        (e.status, e.expire_time)
                    };
                    if status != LeaseStatus::Write {
                        break;
                    }
                    if now_micros() + LEASE_EPSILON_US > expire {
                        handle.dir.wait(&mut state);
                    } else {
                        break;
                    }
                }
                let unfilled = entry.lock().inode_id.is_none();
                if unfilled {
                    let value = self.load_entry(dir_id, index, name)?;
                    let mut e = entry.lock();
                    e.inode_id = Some(value.stat.inode);
                    e.zeroth_server = Some(value.stat.zeroth_server);
                }
                entry
            }
            None => {
                let value = self.load_entry(dir_id, index, name)?;
                if !value.stat.is_dir() {
                    return Err(FsError::NotADirectory);
                }
                let entry = self.dents.get_or_insert(dir_id, name);
                {
                    let mut e = entry.lock();
                    e.inode_id = Some(value.stat.inode);
                    e.zeroth_server = Some(value.stat.zeroth_server);
                }
                entry
            }
        };

        let grant = {
            let now = now_micros();
            let mut e = entry.lock();
            e.read_hits += 1;
            let granted = if e.status == LeaseStatus::Write {
                // Never extend past a pending mutation.
                e.expire_time.saturating_sub(now)
            } else {
                self.grant_lease(lease_time)
            };
            if now + granted > e.expire_time {
                e.expire_time = now + granted;
            }
            e.status = LeaseStatus::Read;
            AccessGrant {
                inode: e.inode_id.unwrap_or(0),
                zeroth_server: e.zeroth_server.unwrap_or(0),
                expire_time: e.expire_time,
            }
        };
        handle.dir.notify_one();
        Ok(Reply::Access(grant))
    }

    fn mknod(&self, dir_id: InodeId, name: &str, perm: u32) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mut state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let key = EntryKey::new(dir_id, index as i64, name_hash(name));
        if self.store.get(&key)?.is_some() {
            return Err(FsError::FileAlreadyExist);
        }
        let stat = StatInfo::new_file(self.store.next_inode(), perm, now_secs());
        let value = EntryValue::new_file(name, stat);
        self.store.put(&key, &value.encode())?;

        self.schedule_split(&handle, &mut state, index);
        Ok(Reply::Ok)
    }

    fn mkdir(&self, dir_id: InodeId, name: &str, perm: u32, hint_server: ServerId) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mut state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let key = EntryKey::new(dir_id, index as i64, name_hash(name));
        if self.store.get(&key)?.is_some() {
            return Err(FsError::FileAlreadyExist);
        }
        let object_id = self.store.next_inode();
        let zeroth_server = hint_server % self.config.server_count();
        let stat = StatInfo::new_dir(object_id, perm, zeroth_server, now_secs());
        let value = EntryValue::new_dir(name, stat);
        self.store.put(&key, &value.encode())?;

        // The zeroth row comes second: a racing lookup may briefly see
        // the entry without it and must treat the directory as
        // eventually-available.
        if zeroth_server == self.server_id {
            self.create_zeroth(object_id)?;
        } else {
            self.peers
                .call(zeroth_server, &Request::CreateZeroth { dir_id: object_id })?;
        }

        self.schedule_split(&handle, &mut state, index);
        Ok(Reply::Ok)
    }

    fn create_entry(
        &self,
        dir_id: InodeId,
        name: &str,
        info: StatInfo,
        realpath: String,
        data: Vec<u8>,
    ) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mut state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let key = EntryKey::new(dir_id, index as i64, name_hash(name));
        if self.store.get(&key)?.is_some() {
            return Err(FsError::FileAlreadyExist);
        }
        let state_flag = if realpath.is_empty() {
            FileState::Embedded
        } else {
            FileState::External
        };
        let value = EntryValue {
            stat: info,
            state: state_flag,
            objname: name.to_string(),
            realpath,
            data,
        };
        self.store.put(&key, &value.encode())?;

        self.schedule_split(&handle, &mut state, index);
        Ok(Reply::Ok)
    }

    fn create_zeroth(&self, dir_id: InodeId) -> OpResult {
        let dir = self.dirs.get(dir_id);
        let _state = dir.lock();
        let key = EntryKey::bitmap(dir_id);
        if self.store.get(&key)?.is_some() {
            return Err(FsError::FileAlreadyExist);
        }
        let mapping = GigaMapping::new(dir_id as u32, self.server_id, self.config.server_count());
        self.store.put(&key, &mapping.to_bytes())?;
        tracing::debug!("Created zeroth row for directory {}", dir_id);
        Ok(Reply::Ok)
    }

    fn apply_chmod(
        &self,
        dir_id: InodeId,
        partition: u32,
        name: &str,
        perm: u32,
    ) -> Result<(), FsError> {
        let mut value = self.load_entry(dir_id, partition, name)?;
        value.stat.mode = (value.stat.mode & !0o7777) | (perm & 0o7777);
        value.stat.ctime = now_secs();
        self.store_entry(dir_id, partition, name, &value)
    }

    fn chmod(&self, dir_id: InodeId, name: &str, perm: u32) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mut state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let value = self.load_entry(dir_id, index, name)?;
        if value.stat.is_dir() {
            let entry = self.write_lock_dirent(&handle, &mut state, dir_id, name);
            let result = self.apply_chmod(dir_id, index, name, perm);
            self.unlock_dirent(&handle, &entry);
            result?;
        } else {
            self.apply_chmod(dir_id, index, name, perm)?;
        }
        Ok(Reply::Ok)
    }

    fn remove(&self, dir_id: InodeId, name: &str) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mut state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let value = self.load_entry(dir_id, index, name)?;
        let key = EntryKey::new(dir_id, index as i64, name_hash(name));
        if value.stat.is_dir() {
            let entry = self.write_lock_dirent(&handle, &mut state, dir_id, name);
            let result = self.store.delete(&key);
            self.unlock_dirent(&handle, &entry);
            result?;
        } else {
            self.store.delete(&key)?;
        }
        // The lookup cache must not serve the removed entry.
        self.dents.evict(dir_id, name);
        Ok(Reply::Ok)
    }

    fn rename(&self, src_id: InodeId, src_name: &str, dst_id: InodeId, dst_name: &str) -> OpResult {
        if src_id != dst_id {
            return Err(FsError::FileNotInSameServer);
        }
        let handle = self.fetch_dir(src_id)?;
        let mut state = handle.dir.lock();
        let src_index = self.addressed_partition(&handle, src_name)?;

        let value = self.load_entry(src_id, src_index, src_name)?;
        // The destination must land on this server too; a cross-server
        // rename is out of protocol.
        let dst_index = {
            let mapping = handle.mapping.lock();
            let index = mapping.partition_for_name(dst_name);
            if mapping.server_for_index(index) != self.server_id {
                return Err(FsError::FileNotInSameServer);
            }
            index
        };

        let dst_key = EntryKey::new(dst_id, dst_index as i64, name_hash(dst_name));
        if self.store.get(&dst_key)?.is_some() {
            return Err(FsError::FileAlreadyExist);
        }
        let src_key = EntryKey::new(src_id, src_index as i64, name_hash(src_name));
        let moved = EntryValue {
            objname: dst_name.to_string(),
            ..value.clone()
        };

        if value.stat.is_dir() {
            let entry = self.write_lock_dirent(&handle, &mut state, src_id, src_name);
            let result = self
                .store
                .put(&dst_key, &moved.encode())
                .and_then(|_| self.store.delete(&src_key));
            self.unlock_dirent(&handle, &entry);
            result?;
        } else {
            self.store.put(&dst_key, &moved.encode())?;
            self.store.delete(&src_key)?;
        }
        self.dents.evict(src_id, src_name);
        Ok(Reply::Ok)
    }

    fn scan_names(
        &self,
        dir_id: InodeId,
        partition: i64,
        start_hash: Option<crate::giga::NameHash>,
        limit: u32,
    ) -> Result<(Vec<EntryValue>, Option<crate::giga::NameHash>, bool), FsError> {
        let page = self
            .store
            .scan(dir_id, partition, start_hash, limit.max(1) as usize)?;
        let mut values = Vec::with_capacity(page.values.len());
        for bytes in &page.values {
            values.push(EntryValue::decode(bytes).map_err(|e| FsError::Io(e.to_string()))?);
        }
        Ok((values, page.end_hash, page.more))
    }

    fn readdir(
        &self,
        dir_id: InodeId,
        partition: i64,
        start_hash: Option<crate::giga::NameHash>,
        limit: u32,
    ) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mapping = WireBitmap::from(&*handle.mapping.lock());
        let (values, end_hash, more) = self.scan_names(dir_id, partition, start_hash, limit)?;
        Ok(Reply::Scan(ScanReply {
            mapping,
            names: values.into_iter().map(|v| v.objname).collect(),
            end_hash,
            more,
        }))
    }

    fn readdir_plus(
        &self,
        dir_id: InodeId,
        partition: i64,
        start_hash: Option<crate::giga::NameHash>,
        limit: u32,
    ) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mapping = WireBitmap::from(&*handle.mapping.lock());
        let (values, end_hash, more) = self.scan_names(dir_id, partition, start_hash, limit)?;
        let mut names = Vec::with_capacity(values.len());
        let mut infos = Vec::with_capacity(values.len());
        for value in values {
            names.push(value.objname);
            infos.push(value.stat);
        }
        Ok(Reply::ScanPlus(ScanPlusReply {
            mapping,
            names,
            infos,
            end_hash,
            more,
        }))
    }

    fn read_bitmap(&self, dir_id: InodeId) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let mapping = WireBitmap::from(&*handle.mapping.lock());
        Ok(Reply::Bitmap(mapping))
    }

    fn update_bitmap(&self, dir_id: InodeId, wire: &WireBitmap) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let update = wire.to_mapping()?;
        let _state = handle.dir.lock();
        let mut mapping = handle.mapping.lock();
        mapping.merge(&update);
        self.store
            .put(&EntryKey::bitmap(dir_id), &mapping.to_bytes())?;
        Ok(Reply::Ok)
    }

    // ---- file data path ------------------------------------------------

    /// Backing file location for a spilled file body.
    fn backing_paths(&self, dir_id: InodeId, name: &str) -> (PathBuf, PathBuf) {
        let dir = self
            .config
            .paths
            .file_dir
            .join("files")
            .join(dir_id.to_string());
        let file = dir.join(format!("{name}.dat"));
        (file, dir)
    }

    fn open_file(&self, dir_id: InodeId, name: &str, _mode: u32) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let _state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let value = self.load_entry(dir_id, index, name)?;
        let reply = match value.state {
            FileState::Embedded => OpenReply {
                is_embedded: true,
                data: value.data,
                path: String::new(),
            },
            FileState::External => OpenReply {
                is_embedded: false,
                data: Vec::new(),
                path: value.realpath,
            },
        };
        Ok(Reply::Open(reply))
    }

    fn read_file(&self, dir_id: InodeId, name: &str, offset: u64, size: u32) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let _state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let value = self.load_entry(dir_id, index, name)?;
        let reply = match value.state {
            FileState::Embedded => {
                let offset = offset as usize;
                let data = if offset < value.data.len() {
                    let end = (offset + size as usize).min(value.data.len());
                    value.data[offset..end].to_vec()
                } else {
                    Vec::new()
                };
                OpenReply {
                    is_embedded: true,
                    data,
                    path: String::new(),
                }
            }
            FileState::External => OpenReply {
                is_embedded: false,
                data: Vec::new(),
                path: value.realpath,
            },
        };
        Ok(Reply::Read(reply))
    }

    fn write_file(&self, dir_id: InodeId, name: &str, data: Vec<u8>, offset: u64) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let _state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let mut value = self.load_entry(dir_id, index, name)?;
        if value.state == FileState::External {
            return Ok(Reply::Write(WriteReply {
                is_embedded: false,
                data: Vec::new(),
                link: value.realpath,
            }));
        }

        let end = offset as usize + data.len();
        if end <= self.config.tuning.file_embed_threshold {
            if value.data.len() < end {
                value.data.resize(end, 0);
            }
            value.data[offset as usize..end].copy_from_slice(&data);
            value.stat.size = value.data.len() as i64;
            value.stat.mtime = now_secs();
            self.store_entry(dir_id, index, name, &value)?;
            return Ok(Reply::Write(WriteReply {
                is_embedded: true,
                data: Vec::new(),
                link: String::new(),
            }));
        }

        // The write pushes the body past the embed threshold: flip the
        // entry to a backing file and hand the old bytes back for the
        // client to replay before its own write.
        let (file_path, file_dir) = self.backing_paths(dir_id, name);
        std::fs::create_dir_all(&file_dir).map_err(|e| FsError::Io(e.to_string()))?;
        let link = file_path.to_string_lossy().into_owned();
        let old_data = std::mem::take(&mut value.data);
        value.state = FileState::External;
        value.realpath = link.clone();
        value.stat.mtime = now_secs();
        self.store_entry(dir_id, index, name, &value)?;
        tracing::debug!(
            "Spilled {:?} in dir {} to backing file {}",
            name,
            dir_id,
            link
        );
        Ok(Reply::Write(WriteReply {
            is_embedded: false,
            data: old_data,
            link,
        }))
    }

    fn close_file(&self, dir_id: InodeId, name: &str, _mode: u32) -> OpResult {
        let handle = self.fetch_dir(dir_id)?;
        let _state = handle.dir.lock();
        let index = self.addressed_partition(&handle, name)?;

        let mut value = self.load_entry(dir_id, index, name)?;
        if value.state == FileState::External {
            if let Ok(meta) = std::fs::metadata(&value.realpath) {
                value.stat.size = meta.len() as i64;
            }
        }
        value.stat.mtime = now_secs();
        self.store_entry(dir_id, index, name, &value)?;
        Ok(Reply::Ok)
    }
}

pub(crate) fn now_secs() -> i64 {
    (now_micros() / 1_000_000) as i64
}
