//! runtime configuration of one filesystem instance
use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Tunables for volumes, caches, journal and the cluster coordinator.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FsConfig {
    /// data block size of newly created volumes
    pub block_size: u32,
    /// allocation cluster size, a multiple of `block_size`
    pub cluster_size: u32,
    pub journal_enabled: bool,
    /// size of the journal region in bytes
    pub journal_size: u64,
    pub global_cache_lines: usize,
    pub volume_cache_lines: usize,
    pub file_cache_lines: usize,
    pub directory_cache_lines: usize,
    // toggles only, no data transformation is performed
    pub encryption: bool,
    pub compression: bool,
    pub deduplication: bool,
    /// identity of the local node in the cluster
    pub node_id: u64,
    pub node_name: String,
    pub node_address: String,
    pub node_port: u16,
    /// online nodes required for an authoritative coordinator decision
    pub quorum_size: usize,
    pub heartbeat_timeout_ms: u64,
    pub default_lock_timeout_ms: u64,
    pub default_replication_factor: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cluster_size: 4096,
            journal_enabled: true,
            journal_size: 1 << 20,
            global_cache_lines: 1024,
            volume_cache_lines: 256,
            file_cache_lines: 32,
            directory_cache_lines: 8,
            encryption: false,
            compression: false,
            deduplication: false,
            node_id: 1,
            node_name: "node-1".to_string(),
            node_address: "127.0.0.1".to_string(),
            node_port: 7070,
            quorum_size: 1,
            heartbeat_timeout_ms: 30_000,
            default_lock_timeout_ms: 5_000,
            default_replication_factor: 1,
        }
    }
}

impl FsConfig {
    pub fn from_json_file<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: FsConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FsResult<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(FsError::InvalidArgument(format!(
                "block size {} must be a power of two of at least 512",
                self.block_size
            )));
        }
        if self.cluster_size == 0 || self.cluster_size % self.block_size != 0 {
            return Err(FsError::InvalidArgument(format!(
                "cluster size {} is not a multiple of block size {}",
                self.cluster_size, self.block_size
            )));
        }
        if self.journal_enabled && self.journal_size < self.block_size as u64 {
            return Err(FsError::InvalidArgument(format!(
                "journal of {} bytes holds no {} byte slot",
                self.journal_size, self.block_size
            )));
        }
        let caches = [
            self.global_cache_lines,
            self.volume_cache_lines,
            self.file_cache_lines,
            self.directory_cache_lines,
        ];
        if caches.contains(&0) {
            return Err(FsError::InvalidArgument(
                "cache capacities must be non-zero".into(),
            ));
        }
        if self.quorum_size == 0 {
            return Err(FsError::InvalidArgument("quorum size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.default_lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dslsfs.json");
        fs::write(&path, r#"{ "block_size": 1024, "cluster_size": 2048 }"#)?;
        let config = FsConfig::from_json_file(&path)?;
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.cluster_size, 2048);
        assert_eq!(config.quorum_size, 1);
        assert!(config.journal_enabled);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let config = FsConfig {
            block_size: 3000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FsConfig {
            cluster_size: 6144,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FsConfig {
            journal_size: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
