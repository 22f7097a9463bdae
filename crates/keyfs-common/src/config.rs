//! Configuration types for KeyFS
//!
//! Every section is defaulted so a config file only needs to name what it
//! changes. The admin binary layers CLI flags on top of the loaded file.

use crate::error::{Error, Result};
use crate::types::{DriveId, DriveRef, Partition, PartitionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for KeyFS
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub path_map: PathMapConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the namespace cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, partition) in self.cluster.partitions.iter().enumerate() {
            if partition.drives.is_empty() {
                return Err(Error::Configuration(format!(
                    "partition {index} has no drives"
                )));
            }
            for drive in &partition.drives {
                let id = DriveId::new(&drive.host, drive.port);
                if !seen.insert(id.clone()) {
                    return Err(Error::Configuration(format!(
                        "drive {id} listed more than once"
                    )));
                }
            }
        }
        if self.cache.capacity == 0 {
            return Err(Error::Configuration("cache.capacity must be > 0".into()));
        }
        if self.path_map.max_symlink_hops == 0 {
            return Err(Error::Configuration(
                "path_map.max_symlink_hops must be > 0".into(),
            ));
        }
        if self.path_map.snapshot_interval == 0 {
            return Err(Error::Configuration(
                "path_map.snapshot_interval must be > 0".into(),
            ));
        }
        if self.client.block_size == 0 {
            return Err(Error::Configuration("client.block_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Cluster membership as initially configured
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name (human-readable identifier)
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Directory holding redb drive files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Partitions in hash order
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            data_dir: default_data_dir(),
            partitions: Vec::new(),
        }
    }
}

impl ClusterConfig {
    /// Build the initial cluster map (all drives GREEN, version 0)
    #[must_use]
    pub fn initial_partitions(&self) -> Vec<Partition> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(index, p)| {
                let drives = p
                    .drives
                    .iter()
                    .map(|d| DriveRef::new(d.host.clone(), d.port))
                    .collect();
                #[allow(clippy::cast_possible_truncation)]
                Partition::new(index as PartitionId, drives)
            })
            .collect()
    }
}

fn default_cluster_name() -> String {
    "keyfs".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/keyfs")
}

/// A partition's drive list
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub drives: Vec<DriveAddress>,
}

/// Address of a single drive
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriveAddress {
    pub host: String,
    pub port: u16,
}

/// Replicated namespace tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Per-request drive timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bound on refresh/disable retries for a single operation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keys fetched per range request during resync
    #[serde(default = "default_key_range_page_size")]
    pub key_range_page_size: usize,
}

impl NamespaceConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            key_range_page_size: default_key_range_page_size(),
        }
    }
}

const fn default_request_timeout_ms() -> u64 {
    5000
}

const fn default_max_retries() -> u32 {
    8
}

const fn default_key_range_page_size() -> usize {
    1000
}

/// Metadata cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Nominal entry count (dirty entries may push past it)
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime; `None` disables expiration
    #[serde(default)]
    pub expiration_ms: Option<u64>,
}

impl CacheConfig {
    #[must_use]
    pub fn expiration(&self) -> Option<Duration> {
        self.expiration_ms.map(Duration::from_millis)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            expiration_ms: None,
        }
    }
}

const fn default_cache_capacity() -> usize {
    4096
}

/// Path virtualization configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathMapConfig {
    /// Symlink substitutions allowed in one resolution
    #[serde(default = "default_max_symlink_hops")]
    pub max_symlink_hops: usize,
    /// Persist a snapshot every N log entries
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
    /// Bound on catch-up/re-verify cycles when appending
    #[serde(default = "default_max_append_retries")]
    pub max_append_retries: u32,
}

impl Default for PathMapConfig {
    fn default() -> Self {
        Self {
            max_symlink_hops: default_max_symlink_hops(),
            snapshot_interval: default_snapshot_interval(),
            max_append_retries: default_max_append_retries(),
        }
    }
}

const fn default_max_symlink_hops() -> usize {
    40
}

const fn default_snapshot_interval() -> u64 {
    64
}

const fn default_max_append_retries() -> u32 {
    16
}

/// File-level helper configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bound on optimistic read-modify-write attempts
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,

    /// Bytes per data block; a file of `size` bytes spans
    /// `size.div_ceil(block_size)` blocks
    #[serde(default = "default_block_size")]
    pub block_size: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_update_retries: default_max_update_retries(),
            block_size: default_block_size(),
        }
    }
}

const fn default_block_size() -> u64 {
    1024 * 1024
}

const fn default_max_update_retries() -> u32 {
    10
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (e.g. "info", "keyfs_namespace=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.namespace.request_timeout_ms, 5000);
        assert_eq!(config.path_map.max_symlink_hops, 40);
        assert!(config.cache.expiration().is_none());
        assert_eq!(config.client.block_size, 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_block_size() {
        let mut config = Config::default();
        config.client.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partitions() {
        let config = Config::from_toml_str(
            r#"
            [cluster]
            name = "test"

            [[cluster.partitions]]
            drives = [{ host = "10.0.0.1", port = 8123 }, { host = "10.0.0.2", port = 8123 }]

            [[cluster.partitions]]
            drives = [{ host = "10.0.0.3", port = 8123 }]

            [cache]
            capacity = 16
            expiration_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.name, "test");
        assert_eq!(config.cache.capacity, 16);
        assert_eq!(config.cache.expiration(), Some(Duration::from_millis(250)));
        assert_eq!(config.namespace.max_retries, 8);

        let partitions = config.cluster.initial_partitions();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[1].partition_id, 1);
        assert_eq!(partitions[0].drives.len(), 2);
        assert!(partitions[0].all_green());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = Config::from_toml_str(
            r#"
            [[cluster.partitions]]
            drives = [{ host = "a", port = 1 }]

            [[cluster.partitions]]
            drives = [{ host = "a", port = 1 }]
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_empty_partition() {
        let mut config = Config::default();
        config.cluster.partitions.push(PartitionConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::from_toml_str("[cache\ncapacity=").is_err());
    }
}
