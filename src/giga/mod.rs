// GIGA+ per-directory partitioning index
pub mod hash;
pub mod mapping;

pub use hash::{index_from_hash, migrates_to, name_hash, reverse_low_bits, NameHash, HASH_LEN};
pub use mapping::{radix_from_index, GigaMapping, SplitPolicy};

/// Highest supported partition radix: a directory can grow to at most
/// `2^MAX_RADIX` partitions.
pub const MAX_RADIX: u32 = 8;

/// Maximum number of partitions per directory.
pub const MAX_PARTITIONS: u32 = 1 << MAX_RADIX;

// The legacy bitmap layout stores 7 usable bits per byte; the high bit of
// every byte is left clear (historical sign-safety of the C encoding).
// The on-wire and on-disk formats depend on this packing, so it must be
// preserved bit-exact.
pub const BITS_PER_MAP: u32 = 7;

/// Length in bytes of the packed partition bitmap.
pub const MAX_BMAP_LEN: usize = ((MAX_PARTITIONS + BITS_PER_MAP - 1) / BITS_PER_MAP) as usize;

/// Hard cap on partitions a single server may own under the
/// `NumServersBound` split policy.
pub const MAX_PARTITIONS_PER_SERVER: u32 = 1;
