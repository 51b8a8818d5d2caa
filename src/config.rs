//! Configuration for elohim-chunks

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest retention or sweep window accepted (100 years)
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Unix milliseconds `secs` from now, saturating instead of overflowing
pub fn millis_from_now(secs: u64) -> i64 {
    let window = i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000);
    chrono::Utc::now().timestamp_millis().saturating_add(window)
}

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-chunks")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for metadata and the chunk cache
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Chunk cache directory, relative to `storage_dir`
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Live replicas required when the caller does not specify one
    #[serde(default = "default_redundancy")]
    pub default_redundancy: u32,

    /// Retention window applied when the caller does not specify an expiry
    #[serde(default = "default_expiry_secs")]
    pub default_expiry_secs: u64,

    /// Fixed chunk size used when splitting blobs
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Interval between periodic sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Chunks expiring within this window are picked up by a sweep
    #[serde(default = "default_sweep_horizon")]
    pub sweep_horizon_secs: u64,

    /// Upper bound on concurrent chunk/file reconsiderations
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciliations: usize,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("cache")
}

fn default_redundancy() -> u32 {
    2
}

fn default_expiry_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_horizon() -> u64 {
    24 * 60 * 60
}

fn default_max_concurrent() -> usize {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            cache_path: default_cache_path(),
            default_redundancy: default_redundancy(),
            default_expiry_secs: default_expiry_secs(),
            chunk_size_bytes: default_chunk_size(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_horizon_secs: default_sweep_horizon(),
            max_concurrent_reconciliations: default_max_concurrent(),
        }
    }
}

impl Config {
    /// Config rooted at `storage_dir` with all other fields defaulted
    pub fn with_storage_dir<P: AsRef<Path>>(storage_dir: P) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the storage engine cannot operate with
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.chunk_size_bytes == 0 {
            return Err(StorageError::Config("chunk_size_bytes must be > 0".into()));
        }
        if self.default_redundancy == 0 {
            return Err(StorageError::Config("default_redundancy must be > 0".into()));
        }
        if self.max_concurrent_reconciliations == 0 {
            return Err(StorageError::Config(
                "max_concurrent_reconciliations must be > 0".into(),
            ));
        }
        if self.default_expiry_secs > MAX_WINDOW_SECS {
            return Err(StorageError::Config(format!(
                "default_expiry_secs must be <= {}",
                MAX_WINDOW_SECS
            )));
        }
        if self.sweep_horizon_secs > MAX_WINDOW_SECS {
            return Err(StorageError::Config(format!(
                "sweep_horizon_secs must be <= {}",
                MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    /// Get chunk cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.storage_dir.join(&self.cache_path)
    }

    /// Get metadata database path
    pub fn metadata_db_path(&self) -> PathBuf {
        self.storage_dir.join("metadata.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Default expiry in unix milliseconds, measured from now
    pub fn default_expires_at(&self) -> i64 {
        millis_from_now(self.default_expiry_secs)
    }
}
