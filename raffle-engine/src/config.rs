//! Configuration for the raffle engine

use ledger_core::config::RocksDBConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raffle engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Data directory for the raffle RocksDB
    pub data_dir: PathBuf,

    /// Most entries one participation call may buy
    pub max_entries_per_call: u32,

    /// How long a finalizing or cancelling worker owns a raffle (seconds)
    pub finalize_lease_secs: i64,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// RocksDB tuning for the raffle store
    pub rocksdb: RocksDBConfig,

    /// Ledger configuration
    pub ledger: ledger_core::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "raffle-engine".to_string(),
            data_dir: PathBuf::from("./data/raffles"),
            max_entries_per_call: 100,
            finalize_lease_secs: 120,
            scheduler: SchedulerConfig::default(),
            rocksdb: RocksDBConfig::default(),
            ledger: ledger_core::Config::default(),
        }
    }
}

/// Background scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between passes
    pub interval_secs: u64,

    /// PENDING ledger records older than this are re-driven (seconds)
    pub reconcile_after_secs: i64,

    /// Most raffles and records handled per pass
    pub batch_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            reconcile_after_secs: 300,
            batch_limit: 100,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::RaffleError::Config(format!("Failed to read config: {}", e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::RaffleError::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config {
            ledger: ledger_core::Config::from_env()?,
            ..Config::default()
        };

        if let Ok(data_dir) = std::env::var("RAFFLE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(max_entries) = std::env::var("RAFFLE_MAX_ENTRIES") {
            config.max_entries_per_call = max_entries
                .parse()
                .map_err(|e| crate::RaffleError::Config(format!("RAFFLE_MAX_ENTRIES: {}", e)))?;
        }

        if let Ok(interval) = std::env::var("RAFFLE_SCHEDULER_INTERVAL_SECS") {
            config.scheduler.interval_secs = interval.parse().map_err(|e| {
                crate::RaffleError::Config(format!("RAFFLE_SCHEDULER_INTERVAL_SECS: {}", e))
            })?;
        }

        Ok(config)
    }
}
