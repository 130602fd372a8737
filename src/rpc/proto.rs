//! Wire protocol of the metadata service
//!
//! Requests and replies are bincode-encoded enums; every RPC is a single
//! request frame answered by a single `Result<Reply, FsError>` frame.
//! Directory mappings cross the wire in the legacy bitmap layout so that
//! mixed-version clusters keep agreeing on partition placement.

use serde::{Deserialize, Serialize};

use crate::giga::hash::NameHash;
use crate::giga::{GigaMapping, MAX_BMAP_LEN};
use crate::metadata::{InodeId, ServerId, StatInfo};

/// A `GigaMapping` in wire form. Field order and the 7-bits-per-byte
/// bitmap packing are fixed by the historical format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBitmap {
    pub id: u32,
    pub bitmap: Vec<u8>,
    pub curr_radix: u32,
    pub zeroth_server: u32,
    pub num_servers: u32,
}

impl From<&GigaMapping> for WireBitmap {
    fn from(mapping: &GigaMapping) -> Self {
        Self {
            id: mapping.id,
            bitmap: mapping.bitmap_bytes().to_vec(),
            curr_radix: mapping.radix(),
            zeroth_server: mapping.zeroth_server,
            num_servers: mapping.server_count,
        }
    }
}

impl WireBitmap {
    /// Rebuild the mapping; a malformed bitmap degrades to `FsError::Io`
    /// at the call site.
    pub fn to_mapping(&self) -> Result<GigaMapping, FsError> {
        GigaMapping::from_parts(self.id, self.zeroth_server, self.num_servers, &self.bitmap)
            .map_err(|e| FsError::Io(format!("bad wire bitmap: {}", e)))
    }

    pub fn is_well_formed(&self) -> bool {
        self.bitmap.len() == MAX_BMAP_LEN && self.num_servers > 0
    }
}

/// Operation failures, kept distinct from the handler to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum FsError {
    #[error("illegal path: {0}")]
    IllegalPath(String),

    #[error("no such file or directory")]
    FileNotFound,

    #[error("parent path not found")]
    ParentPathNotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("file already exists")]
    FileAlreadyExist,

    /// The request was routed with a stale bitmap; the payload is the
    /// server's current one. Clients merge and retry.
    #[error("request addressed to the wrong server")]
    Redirect(WireBitmap),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("entries are not on the same server")]
    FileNotInSameServer,

    #[error("too many redirections")]
    TooManyRedirections,
}

impl From<crate::store::StoreError> for FsError {
    fn from(e: crate::store::StoreError) -> Self {
        FsError::Io(e.to_string())
    }
}

/// Lookup result with a lease: the entry will not change before
/// `expire_time` (server clock, microseconds).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccessGrant {
    pub inode: InodeId,
    pub zeroth_server: ServerId,
    pub expire_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReply {
    pub mapping: WireBitmap,
    pub names: Vec<String>,
    pub end_hash: Option<NameHash>,
    pub more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPlusReply {
    pub mapping: WireBitmap,
    pub names: Vec<String>,
    pub infos: Vec<StatInfo>,
    pub end_hash: Option<NameHash>,
    pub more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenReply {
    pub is_embedded: bool,
    /// Embedded body when `is_embedded`, otherwise empty.
    pub data: Vec<u8>,
    /// Backing file path when not embedded.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReply {
    pub is_embedded: bool,
    /// On spill, the previously embedded body the client must replay
    /// into the backing file before its own write.
    pub data: Vec<u8>,
    /// Backing file path once the file is no longer embedded.
    pub link: String,
}

/// File open modes (wire encoding of the mode bits).
pub const OPEN_READ: u32 = 0x1;
pub const OPEN_WRITE: u32 = 0x2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Init,
    Getattr {
        dir_id: InodeId,
        name: String,
        lease_time: u64,
    },
    Access {
        dir_id: InodeId,
        name: String,
        lease_time: u64,
    },
    Mknod {
        dir_id: InodeId,
        name: String,
        perm: u32,
    },
    Mkdir {
        dir_id: InodeId,
        name: String,
        perm: u32,
        hint_server: ServerId,
    },
    CreateEntry {
        dir_id: InodeId,
        name: String,
        info: StatInfo,
        realpath: String,
        data: Vec<u8>,
    },
    CreateZeroth {
        dir_id: InodeId,
    },
    Chmod {
        dir_id: InodeId,
        name: String,
        perm: u32,
    },
    Remove {
        dir_id: InodeId,
        name: String,
    },
    Rename {
        src_id: InodeId,
        src_name: String,
        dst_id: InodeId,
        dst_name: String,
    },
    Readdir {
        dir_id: InodeId,
        partition: i64,
        start_hash: Option<NameHash>,
        limit: u32,
    },
    ReaddirPlus {
        dir_id: InodeId,
        partition: i64,
        start_hash: Option<NameHash>,
        limit: u32,
    },
    ReadBitmap {
        dir_id: InodeId,
    },
    UpdateBitmap {
        dir_id: InodeId,
        mapping: WireBitmap,
    },
    InsertSplit {
        dir_id: InodeId,
        parent_index: u32,
        child_index: u32,
        table_dir: String,
        mapping: WireBitmap,
        min_seq: u64,
        max_seq: u64,
        num_entries: u64,
    },
    OpenFile {
        dir_id: InodeId,
        name: String,
        mode: u32,
    },
    ReadFile {
        dir_id: InodeId,
        name: String,
        offset: u64,
        size: u32,
    },
    WriteFile {
        dir_id: InodeId,
        name: String,
        data: Vec<u8>,
        offset: u64,
    },
    CloseFile {
        dir_id: InodeId,
        name: String,
        mode: u32,
    },
}

impl Request {
    /// Operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Init => "init",
            Request::Getattr { .. } => "getattr",
            Request::Access { .. } => "access",
            Request::Mknod { .. } => "mknod",
            Request::Mkdir { .. } => "mkdir",
            Request::CreateEntry { .. } => "createentry",
            Request::CreateZeroth { .. } => "createzeroth",
            Request::Chmod { .. } => "chmod",
            Request::Remove { .. } => "remove",
            Request::Rename { .. } => "rename",
            Request::Readdir { .. } => "readdir",
            Request::ReaddirPlus { .. } => "readdirplus",
            Request::ReadBitmap { .. } => "readbitmap",
            Request::UpdateBitmap { .. } => "updatebitmap",
            Request::InsertSplit { .. } => "insertsplit",
            Request::OpenFile { .. } => "open",
            Request::ReadFile { .. } => "read",
            Request::WriteFile { .. } => "write",
            Request::CloseFile { .. } => "close",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    Init(bool),
    Stat(StatInfo),
    Access(AccessGrant),
    Bitmap(WireBitmap),
    Scan(ScanReply),
    ScanPlus(ScanPlusReply),
    Open(OpenReply),
    Read(OpenReply),
    Write(WriteReply),
}

/// What actually crosses the wire back to the caller.
pub type OpResult = Result<Reply, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_bitmap_round_trip() {
        let mut mapping = GigaMapping::new(3, 1, 4);
        mapping.mark_split_done(1);
        mapping.mark_split_done(2);

        let wire = WireBitmap::from(&mapping);
        assert!(wire.is_well_formed());
        assert_eq!(wire.curr_radix, 2);

        let back = wire.to_mapping().unwrap();
        assert_eq!(back, mapping);
    }

    #[test]
    fn test_request_encodes_with_bincode() {
        let req = Request::Mknod {
            dir_id: 7,
            name: "file".to_string(),
            perm: 0o644,
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: Request = bincode::deserialize(&bytes).unwrap();
        match back {
            Request::Mknod { dir_id, name, perm } => {
                assert_eq!((dir_id, name.as_str(), perm), (7, "file", 0o644));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_op_result_carries_redirect() {
        let mapping = GigaMapping::new(1, 0, 2);
        let result: OpResult = Err(FsError::Redirect(WireBitmap::from(&mapping)));
        let bytes = bincode::serialize(&result).unwrap();
        let back: OpResult = bincode::deserialize(&bytes).unwrap();
        match back {
            Err(FsError::Redirect(wire)) => {
                assert_eq!(wire.to_mapping().unwrap(), mapping);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
