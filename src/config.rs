//! GigaFS server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::giga::SplitPolicy;

/// Default configuration constants
///
/// All tunables of the metadata service in one place, so deployments
/// adjust a single module instead of hunting literals.
pub mod defaults {

    /// Entries a partition may hold before it is scheduled for a split.
    pub const SPLIT_THRESHOLD: i64 = 1 << 11; // 2048

    /// Shard count of the directory control-block table.
    pub const DIR_TABLE_SHARDS: usize = 16;

    /// Directory-mapping cache capacity (entries).
    pub const DMAP_CACHE_ENTRIES: usize = 1 << 15;

    /// Directory-entry lookup cache capacity (entries).
    pub const DENT_CACHE_ENTRIES: usize = 1 << 16;

    /// Inode numbers reserved per bulk directory creation.
    pub const DIR_BULK_SIZE: usize = 1 << 10;

    /// Largest file body kept inside the metadata row: 64 KiB.
    /// Bigger files spill to a backing file under `file_dir`.
    pub const FILE_EMBED_THRESHOLD: usize = 64 * 1024;

    /// Connection timeout towards peer servers: 30 seconds.
    pub const TIMEOUT_SECS: u64 = 30;

    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// GigaFS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Identity of this server
    pub node: NodeConfig,

    /// On-disk locations
    pub paths: PathConfig,

    /// Cluster membership and transport
    pub network: NetworkConfig,

    /// Partitioning and cache tunables
    #[serde(default)]
    pub tuning: TuningConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Index of this server in `network.servers`
    pub server_id: u32,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

/// On-disk locations owned by this server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Metadata store directory
    pub store_dir: PathBuf,

    /// Backing files for spilled (non-embedded) file bodies
    pub file_dir: PathBuf,

    /// Staging area for split extraction tables
    pub split_dir: PathBuf,
}

/// Cluster membership and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// All metadata servers as `host:port`, ordered by server id
    pub servers: Vec<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    defaults::TIMEOUT_SECS
}

/// Partitioning and cache tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Entries a partition may hold before it splits (default: 2048)
    #[serde(default = "default_split_threshold")]
    pub split_threshold: i64,

    /// When partitions are allowed to split
    #[serde(default)]
    pub split_policy: SplitPolicy,

    /// Shards of the directory control-block table
    #[serde(default = "default_dir_table_shards")]
    pub dir_table_shards: usize,

    /// Directory-mapping cache entries
    #[serde(default = "default_dmap_cache_entries")]
    pub dmap_cache_entries: usize,

    /// Directory-entry cache entries
    #[serde(default = "default_dent_cache_entries")]
    pub dent_cache_entries: usize,

    /// Inode numbers reserved per bulk directory creation
    #[serde(default = "default_dir_bulk_size")]
    pub dir_bulk_size: usize,

    /// Embedded-file threshold in bytes (default: 64 KiB)
    #[serde(default = "default_file_embed_threshold")]
    pub file_embed_threshold: usize,
}

fn default_split_threshold() -> i64 {
    defaults::SPLIT_THRESHOLD
}

fn default_dir_table_shards() -> usize {
    defaults::DIR_TABLE_SHARDS
}

fn default_dmap_cache_entries() -> usize {
    defaults::DMAP_CACHE_ENTRIES
}

fn default_dent_cache_entries() -> usize {
    defaults::DENT_CACHE_ENTRIES
}

fn default_dir_bulk_size() -> usize {
    defaults::DIR_BULK_SIZE
}

fn default_file_embed_threshold() -> usize {
    defaults::FILE_EMBED_THRESHOLD
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            split_threshold: default_split_threshold(),
            split_policy: SplitPolicy::default(),
            dir_table_shards: default_dir_table_shards(),
            dmap_cache_entries: default_dmap_cache_entries(),
            dent_cache_entries: default_dent_cache_entries(),
            dir_bulk_size: default_dir_bulk_size(),
            file_embed_threshold: default_file_embed_threshold(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                server_id: 0,
                log_level: default_log_level(),
            },
            paths: PathConfig {
                store_dir: PathBuf::from("/tmp/gigafs/store"),
                file_dir: PathBuf::from("/tmp/gigafs/files"),
                split_dir: PathBuf::from("/tmp/gigafs/splits"),
            },
            network: NetworkConfig {
                servers: vec!["127.0.0.1:45678".to_string()],
                timeout_secs: default_timeout(),
            },
            tuning: TuningConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "Server list cannot be empty".to_string(),
            ));
        }

        if self.node.server_id as usize >= self.network.servers.len() {
            return Err(ConfigError::ValidationError(format!(
                "Server id {} is out of range for a {}-server cluster",
                self.node.server_id,
                self.network.servers.len()
            )));
        }

        if self.tuning.split_threshold <= 0 {
            return Err(ConfigError::ValidationError(
                "Split threshold must be positive".to_string(),
            ));
        }

        match self.node.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.node.log_level
                )));
            }
        }

        self.server_addrs()?;

        Ok(())
    }

    /// Parsed socket addresses of the whole cluster, ordered by server id
    pub fn server_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.network
            .servers
            .iter()
            .map(|s| {
                s.parse::<SocketAddr>().map_err(|e| {
                    ConfigError::ValidationError(format!("Invalid server address {}: {}", s, e))
                })
            })
            .collect()
    }

    /// Number of servers in the cluster
    pub fn server_count(&self) -> u32 {
        self.network.servers.len() as u32
    }

    /// Address this server listens on
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(self.server_addrs()?[self.node.server_id as usize])
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.node.server_id, 0);
        assert_eq!(config.tuning.split_threshold, 2048);
        assert_eq!(config.tuning.file_embed_threshold, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::default();

        config.node.server_id = 1;
        assert!(config.validate().is_err());
        config.node.server_id = 0;

        config.tuning.split_threshold = 0;
        assert!(config.validate().is_err());
        config.tuning.split_threshold = 2048;

        config.node.log_level = "loud".to_string();
        assert!(config.validate().is_err());
        config.node.log_level = "info".to_string();

        config.network.servers = vec!["not-an-address".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = ServerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: ServerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(deserialized.node.server_id, config.node.server_id);
        assert_eq!(
            deserialized.tuning.split_threshold,
            config.tuning.split_threshold
        );
        assert_eq!(deserialized.network.servers, config.network.servers);
    }

    #[test]
    fn test_tuning_defaults_fill_in() {
        let toml_str = r#"
            [node]
            server_id = 0

            [paths]
            store_dir = "/tmp/g/store"
            file_dir = "/tmp/g/files"
            split_dir = "/tmp/g/splits"

            [network]
            servers = ["127.0.0.1:45678", "127.0.0.1:45679"]
        "#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tuning.split_threshold, 2048);
        assert_eq!(config.server_count(), 2);
        assert!(config.validate().is_ok());
    }
}
