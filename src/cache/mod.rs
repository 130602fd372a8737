// LRU caches for directory mappings and directory-entry lookups
pub mod dent_cache;
pub mod dmap_cache;

pub use dent_cache::{
    ClientDentCache, ClientDirEntry, LeaseStatus, ServerDentCache, ServerDirEntry,
};
pub use dmap_cache::{CachedMapping, DirMappingCache};
