//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Upper bound for a single store round trip (milliseconds)
    pub store_timeout_ms: u64,

    /// Decimal places kept for WINIX amounts
    pub winix_scale: u32,

    /// Retry policy for transient store errors
    pub retry: RetryConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-core".to_string(),
            store_timeout_ms: 2_000,
            winix_scale: 2,
            retry: RetryConfig::default(),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// Exponential backoff for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt for timeouts and outages
    pub max_retries: u32,

    /// First backoff delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor per retry
    pub backoff_multiplier: f64,

    /// Random spread applied to each delay (0.0 - 1.0)
    pub jitter_factor: f64,

    /// Separate budget for lost conditional writes
    pub max_conflict_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_conflict_retries: 64,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync every commit
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::LedgerError::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(timeout) = std::env::var("LEDGER_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = timeout.parse().map_err(|e| {
                crate::LedgerError::Config(format!("LEDGER_STORE_TIMEOUT_MS: {}", e))
            })?;
        }

        if let Ok(retries) = std::env::var("LEDGER_MAX_RETRIES") {
            config.retry.max_retries = retries.parse().map_err(|e| {
                crate::LedgerError::Config(format!("LEDGER_MAX_RETRIES: {}", e))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "ledger-core");
        assert_eq!(config.winix_scale, 2);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let mut config = Config::default();
        config.store_timeout_ms = 750;
        config.retry.max_retries = 5;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.store_timeout_ms, 750);
        assert_eq!(loaded.retry.max_retries, 5);
    }
}
