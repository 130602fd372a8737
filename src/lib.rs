//! GigaFS - A Distributed File-System Metadata Service
//!
//! GigaFS stores a file-system namespace as rows in an ordered key-value
//! store, distributed across a cluster of metadata servers. Each directory
//! is sharded into hash partitions by a growing bitmap (GIGA+ style), so a
//! single directory can spread over every server in the cluster instead of
//! hot-spotting one of them:
//!
//! - **Per-directory partitioning** ([`giga`]): a splittable bitmap over
//!   partition indices maps any entry name to a partition and, through a
//!   zeroth-server offset, to the server that owns it
//! - **Metadata servers** ([`server`]): per-directory concurrency control,
//!   server-issued directory-entry leases, and background partition splits
//!   (range extraction plus bulk ingest into the target shard)
//! - **Stateless clients** ([`client`]): path resolution over cached,
//!   lease-bounded lookups with a retry loop that absorbs the server
//!   redirections produced by stale bitmaps
//! - **Storage layer** ([`store`]): an ordered key-value engine addressed
//!   by `(parent inode, partition, name hash)` composite keys
//! - **Cache layer** ([`cache`]): LRU caches for directory mappings and
//!   directory-entry lookups on both the server and the client side
//! - **RPC layer** ([`rpc`]): length-prefixed binary framing over TCP with
//!   blocking worker threads per connection
//!
//! # Example
//!
//! ```rust,no_run
//! use gigafs::client::FsClient;
//! use gigafs::config::ServerConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_file("gigafs.toml")?;
//! let client = FsClient::new(&config)?;
//!
//! client.mkdir("/projects", 0o755)?;
//! client.mknod("/projects/readme", 0o644)?;
//! let names = client.readdir("/projects")?;
//! assert_eq!(names, vec!["readme".to_string()]);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod giga;
pub mod logging;
pub mod metadata;
pub mod rpc;
pub mod server;
pub mod store;
