// Namespace entry types and per-directory control state
pub mod directory;
pub mod id_alloc;
pub mod types;

pub use directory::{DirRef, Directory, DirectoryState, DirectoryTable};
pub use id_alloc::InodeAllocator;
pub use types::{EntryValue, FileState, InodeId, ServerId, StatInfo};

/// Inode number of the file-system root. The root's zeroth server is
/// always server 0.
pub const ROOT_INODE: InodeId = 0;

/// Inode numbers advance in steps of `1 << 9` so that allocators seeded
/// with distinct server ids never collide.
pub const INODE_STEP: u64 = 1 << 9;

/// Current time in microseconds since the Unix epoch; the clock leases
/// and stat times are expressed in.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
