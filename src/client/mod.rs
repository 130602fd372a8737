//! The metadata client
//!
//! Clients are stateless as far as the cluster is concerned: everything
//! they cache (directory mappings, lookup results) is a lease-bounded or
//! monotonically-mergeable copy of server state. Path resolution walks
//! the parent components through the lookup cache, filling misses with
//! `Access` RPCs; operations on the final component are routed by the
//! cached bitmap and retried on redirection until the bitmap converges.

pub mod file;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::{CachedMapping, ClientDentCache, ClientDirEntry, DirMappingCache};
use crate::config::{ConfigError, ServerConfig};
use crate::giga::hash::{name_hash, reverse_low_bits, NameHash};
use crate::metadata::{now_micros, DirRef, DirectoryTable, InodeId, ServerId, StatInfo, ROOT_INODE};
use crate::rpc::proto::{AccessGrant, Reply, Request};
use crate::rpc::{FsError, RpcClient, WireBitmap};
use file::FdTable;

/// Redirections followed per operation before giving up.
pub const MAX_REDIRECTS: usize = 10;

/// Rows requested per readdir RPC.
pub const READDIR_LIMIT: u32 = 256;

/// A resolved path: the parent directory and the final component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub parent: InodeId,
    pub zeroth_server: ServerId,
    pub name: String,
    pub depth: u32,
}

struct DirHandle {
    dir: DirRef,
    mapping: CachedMapping,
}

pub struct FsClient {
    rpc: RpcClient,
    dirs: Arc<DirectoryTable>,
    dmaps: DirMappingCache,
    dents: ClientDentCache,
    files: Mutex<FdTable>,
}

impl FsClient {
    pub fn new(config: &ServerConfig) -> Result<Self, ConfigError> {
        let rpc = RpcClient::new(
            config.server_addrs()?,
            Duration::from_secs(config.network.timeout_secs),
        );
        Ok(Self {
            rpc,
            dirs: DirectoryTable::new(config.tuning.dir_table_shards),
            dmaps: DirMappingCache::new(config.tuning.dmap_cache_entries),
            dents: ClientDentCache::new(config.tuning.dent_cache_entries),
            files: Mutex::new(FdTable::new()),
        })
    }

    /// Probe the cluster.
    pub fn ping(&self) -> Result<bool, FsError> {
        match self.rpc.call(0, &Request::Init)? {
            Reply::Init(ok) => Ok(ok),
            _ => Err(unexpected_reply()),
        }
    }

    // ---- path resolution -----------------------------------------------

    /// Initial lease hint for a parent lookup: components close to the
    /// root are hotter and get longer leases.
    fn lease_hint(depth: u32) -> u64 {
        (6_400_000 / (depth as u64 + 1)).max(100_000)
    }

    /// Validate and normalize a path: absolute, trailing slashes
    /// stripped.
    fn normalize(path: &str) -> Result<&str, FsError> {
        if path.is_empty() {
            return Err(FsError::IllegalPath(path.to_string()));
        }
        if !path.starts_with('/') {
            return Err(FsError::IllegalPath(path.to_string()));
        }
        let mut clean = path;
        while clean.len() > 1 && clean.ends_with('/') {
            clean = &clean[..clean.len() - 1];
        }
        Ok(clean)
    }

    /// Resolve every non-terminal component of `path`, returning the
    /// parent directory and the final entry name.
    pub fn resolve_path(&self, path: &str) -> Result<ResolvedPath, FsError> {
        let clean = Self::normalize(path)?;
        if clean == "/" {
            return Ok(ResolvedPath {
                parent: ROOT_INODE,
                zeroth_server: 0,
                name: "/".to_string(),
                depth: 0,
            });
        }

        let mut parent = ROOT_INODE;
        let mut zeroth_server: ServerId = 0;
        let mut depth = 0u32;

        let components: Vec<&str> = clean[1..].split('/').filter(|c| !c.is_empty()).collect();
        let (last, parents) = match components.split_last() {
            Some(split) => split,
            None => return Err(FsError::IllegalPath(path.to_string())),
        };

        for component in parents {
            depth += 1;
            let now = now_micros();
            let cached = self
                .dents
                .get(parent, component)
                .filter(|entry| entry.is_valid(now));
            let entry = match cached {
                Some(entry) => entry,
                None => {
                    let grant = self
                        .lookup(zeroth_server, parent, component, Self::lease_hint(depth))
                        .map_err(|e| match e {
                            // A missing intermediate component is its own
                            // failure, distinct from a missing final entry.
                            FsError::FileNotFound => FsError::ParentPathNotFound,
                            other => other,
                        })?;
                    let entry = ClientDirEntry {
                        inode_id: grant.inode,
                        zeroth_server: grant.zeroth_server,
                        expire_time: grant.expire_time,
                    };
                    self.dents.put(parent, component, entry);
                    entry
                }
            };
            parent = entry.inode_id;
            zeroth_server = entry.zeroth_server;
        }

        Ok(ResolvedPath {
            parent,
            zeroth_server,
            name: (*last).to_string(),
            depth,
        })
    }

    /// Resolve a path that names a directory itself (rather than an entry
    /// inside its parent).
    fn resolve_dir(&self, path: &str) -> Result<ResolvedPath, FsError> {
        let clean = Self::normalize(path)?;
        if clean == "/" {
            return Ok(ResolvedPath {
                parent: ROOT_INODE,
                zeroth_server: 0,
                name: "/".to_string(),
                depth: 0,
            });
        }
        // Resolving "<path>/x" walks every component of `path` itself.
        let probe = format!("{clean}/x");
        self.resolve_path(&probe)
    }

    /// Cached lookup with lease: `Access` against the parent's cluster.
    fn lookup(
        &self,
        zeroth_server: ServerId,
        parent: InodeId,
        name: &str,
        lease_time: u64,
    ) -> Result<AccessGrant, FsError> {
        let handle = self.fetch_dir(parent, zeroth_server)?;
        let reply = self.call_entry_op(&handle, name, || Request::Access {
            dir_id: parent,
            name: name.to_string(),
            lease_time,
        })?;
        match reply {
            Reply::Access(grant) => Ok(grant),
            _ => Err(unexpected_reply()),
        }
    }

    // ---- directory handles and routing ---------------------------------

    /// Pin the control block and bitmap of a directory, fetching the
    /// bitmap from the zeroth server on a cache miss. A cached bitmap may
    /// be stale; redirections repair it.
    fn fetch_dir(&self, dir_id: InodeId, zeroth_server: ServerId) -> Result<DirHandle, FsError> {
        let dir = self.dirs.get(dir_id);
        if let Some(mapping) = self.dmaps.get(dir_id) {
            return Ok(DirHandle { dir, mapping });
        }
        let state = dir.lock();
        if let Some(mapping) = self.dmaps.get(dir_id) {
            drop(state);
            return Ok(DirHandle { dir, mapping });
        }
        let reply = self
            .rpc
            .call(zeroth_server, &Request::ReadBitmap { dir_id })?;
        let mapping = match reply {
            Reply::Bitmap(wire) => wire.to_mapping()?,
            _ => return Err(unexpected_reply()),
        };
        let mapping = self.dmaps.insert(dir_id, mapping);
        drop(state);
        Ok(DirHandle { dir, mapping })
    }

    fn select_server(&self, handle: &DirHandle, name: &str) -> ServerId {
        handle.mapping.lock().server_for_name(name)
    }

    /// Fold a server's bitmap into the cached one.
    fn merge_bitmap(&self, handle: &DirHandle, wire: &WireBitmap) -> Result<(), FsError> {
        let update = wire.to_mapping()?;
        let _state = handle.dir.lock();
        handle.mapping.lock().merge(&update);
        Ok(())
    }

    /// Issue an entry-scoped request, merging bitmaps and retrying while
    /// servers redirect. More bits reach the cache with every round, so
    /// the route converges or the retry cap trips.
    fn call_entry_op(
        &self,
        handle: &DirHandle,
        name: &str,
        make_request: impl Fn() -> Request,
    ) -> Result<Reply, FsError> {
        for _ in 0..MAX_REDIRECTS {
            let server = self.select_server(handle, name);
            match self.rpc.call(server, &make_request()) {
                Err(FsError::Redirect(wire)) => {
                    tracing::debug!("Redirected while routing {:?}, merging bitmap", name);
                    self.merge_bitmap(handle, &wire)?;
                }
                other => return other,
            }
        }
        Err(FsError::TooManyRedirections)
    }

    // ---- namespace operations ------------------------------------------

    pub fn getattr(&self, path: &str) -> Result<StatInfo, FsError> {
        let resolved = self.resolve_path(path)?;
        if resolved.name == "/" {
            // The root exists by construction.
            let mut stat = StatInfo::new_dir(ROOT_INODE, 0o755, 0, 0);
            stat.nlink = 2;
            return Ok(stat);
        }
        let handle = self.fetch_dir(resolved.parent, resolved.zeroth_server)?;
        let reply = self.call_entry_op(&handle, &resolved.name, || Request::Getattr {
            dir_id: resolved.parent,
            name: resolved.name.clone(),
            lease_time: Self::lease_hint(resolved.depth),
        })?;
        match reply {
            Reply::Stat(stat) => Ok(stat),
            _ => Err(unexpected_reply()),
        }
    }

    pub fn mknod(&self, path: &str, perm: u32) -> Result<(), FsError> {
        let resolved = self.resolve_path(path)?;
        let handle = self.fetch_dir(resolved.parent, resolved.zeroth_server)?;
        self.call_entry_op(&handle, &resolved.name, || Request::Mknod {
            dir_id: resolved.parent,
            name: resolved.name.clone(),
            perm,
        })
        .map(|_| ())
    }

    pub fn mkdir(&self, path: &str, perm: u32) -> Result<(), FsError> {
        let resolved = self.resolve_path(path)?;
        let handle = self.fetch_dir(resolved.parent, resolved.zeroth_server)?;
        // Spread new directories over the cluster by the full path.
        let hint_server = self.hint_server(path);
        self.call_entry_op(&handle, &resolved.name, || Request::Mkdir {
            dir_id: resolved.parent,
            name: resolved.name.clone(),
            perm,
            hint_server,
        })
        .map(|_| ())
    }

    fn hint_server(&self, path: &str) -> ServerId {
        let hash = name_hash(path);
        (u64::from_le_bytes(hash) % self.rpc.server_count() as u64) as ServerId
    }

    pub fn chmod(&self, path: &str, perm: u32) -> Result<(), FsError> {
        let resolved = self.resolve_path(path)?;
        let handle = self.fetch_dir(resolved.parent, resolved.zeroth_server)?;
        self.call_entry_op(&handle, &resolved.name, || Request::Chmod {
            dir_id: resolved.parent,
            name: resolved.name.clone(),
            perm,
        })
        .map(|_| ())
    }

    pub fn remove(&self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve_path(path)?;
        let handle = self.fetch_dir(resolved.parent, resolved.zeroth_server)?;
        self.call_entry_op(&handle, &resolved.name, || Request::Remove {
            dir_id: resolved.parent,
            name: resolved.name.clone(),
        })?;
        self.dents.evict(resolved.parent, &resolved.name);
        Ok(())
    }

    /// Rename within one parent goes through the server's atomic op;
    /// across parents it degrades to copy-entry-then-remove.
    pub fn rename(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let src_resolved = self.resolve_path(src)?;
        let dst_resolved = self.resolve_path(dst)?;

        if src_resolved.parent == dst_resolved.parent {
            let handle = self.fetch_dir(src_resolved.parent, src_resolved.zeroth_server)?;
            self.call_entry_op(&handle, &src_resolved.name, || Request::Rename {
                src_id: src_resolved.parent,
                src_name: src_resolved.name.clone(),
                dst_id: dst_resolved.parent,
                dst_name: dst_resolved.name.clone(),
            })?;
            self.dents.evict(src_resolved.parent, &src_resolved.name);
            return Ok(());
        }

        let stat = self.getattr(src)?;
        let dst_handle = self.fetch_dir(dst_resolved.parent, dst_resolved.zeroth_server)?;
        self.call_entry_op(&dst_handle, &dst_resolved.name, || Request::CreateEntry {
            dir_id: dst_resolved.parent,
            name: dst_resolved.name.clone(),
            info: stat,
            realpath: String::new(),
            data: Vec::new(),
        })?;
        self.remove(src)
    }

    /// List a directory: walk its partitions in reverse-bit order and
    /// page through each on its owning server.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let mut names = Vec::new();
        self.walk_partitions(path, |this, handle, dir_id, partition| {
            let mut start: Option<NameHash> = None;
            loop {
                let server = handle.mapping.lock().server_for_index(partition);
                let reply = this.rpc.call(
                    server,
                    &Request::Readdir {
                        dir_id,
                        partition: partition as i64,
                        start_hash: start,
                        limit: READDIR_LIMIT,
                    },
                );
                match reply {
                    Ok(Reply::Scan(scan)) => {
                        this.merge_bitmap(handle, &scan.mapping)?;
                        names.extend(scan.names);
                        if !scan.more {
                            return Ok(());
                        }
                        start = scan.end_hash;
                    }
                    Ok(_) => return Err(unexpected_reply()),
                    // The partition may have moved mid-walk; the bitmap
                    // walk picks it up at its new home.
                    Err(FsError::Redirect(_)) | Err(FsError::FileNotFound) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })?;
        Ok(names)
    }

    /// Like [`readdir`](Self::readdir) but also returns the attributes.
    pub fn readdir_plus(&self, path: &str) -> Result<(Vec<String>, Vec<StatInfo>), FsError> {
        let mut names = Vec::new();
        let mut infos = Vec::new();
        self.walk_partitions(path, |this, handle, dir_id, partition| {
            let mut start: Option<NameHash> = None;
            loop {
                let server = handle.mapping.lock().server_for_index(partition);
                let reply = this.rpc.call(
                    server,
                    &Request::ReaddirPlus {
                        dir_id,
                        partition: partition as i64,
                        start_hash: start,
                        limit: READDIR_LIMIT,
                    },
                );
                match reply {
                    Ok(Reply::ScanPlus(scan)) => {
                        this.merge_bitmap(handle, &scan.mapping)?;
                        names.extend(scan.names);
                        infos.extend(scan.infos);
                        if !scan.more {
                            return Ok(());
                        }
                        start = scan.end_hash;
                    }
                    Ok(_) => return Err(unexpected_reply()),
                    Err(FsError::Redirect(_)) | Err(FsError::FileNotFound) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })?;
        Ok((names, infos))
    }

    /// Enumerate the set partitions of a directory in reverse-bit order,
    /// re-reading the radix every round since scans can merge in a grown
    /// bitmap.
    fn walk_partitions(
        &self,
        path: &str,
        mut visit: impl FnMut(&Self, &DirHandle, InodeId, u32) -> Result<(), FsError>,
    ) -> Result<(), FsError> {
        let resolved = self.resolve_dir(path)?;
        let handle = self.fetch_dir(resolved.parent, resolved.zeroth_server)?;
        let mut index: u32 = 0;
        loop {
            let radix = handle.mapping.lock().radix();
            if index >= (1u32 << radix) {
                break;
            }
            let partition = reverse_low_bits(index as u8, radix) as u32;
            let owned = handle.mapping.lock().bit(partition);
            if owned {
                visit(self, &handle, resolved.parent, partition)?;
            }
            index += 1;
        }
        Ok(())
    }
}

pub(crate) fn unexpected_reply() -> FsError {
    FsError::Io("unexpected reply variant".to_string())
}
