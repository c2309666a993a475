//! Configuration for the wallet core

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Wallet identity string
    pub wallet_id: String,

    /// Identity string of the trusted issuer
    pub issuer_id: String,

    /// Purchase configuration
    pub purchase: PurchaseConfig,

    /// Maintenance sweep configuration
    pub sweep: SweepConfig,

    /// Transaction engine configuration
    pub engine: EngineConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet"),
            wallet_id: "wallet".to_string(),
            issuer_id: "issuer".to_string(),
            purchase: PurchaseConfig::default(),
            sweep: SweepConfig::default(),
            engine: EngineConfig::default(),
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// Token purchase configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseConfig {
    /// Minimum purchase amount
    pub min_amount: Decimal,

    /// Maximum purchase amount
    pub max_amount: Decimal,

    /// Validity of freshly minted tokens (days)
    pub token_validity_days: i64,
}

impl Default for PurchaseConfig {
    fn default() -> Self {
        Self {
            min_amount: Decimal::ONE,              // 1.00
            max_amount: Decimal::new(10_000_00, 2), // 10,000.00
            token_validity_days: 30,
        }
    }
}

/// Periodic maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Interval between maintenance ticks (seconds)
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300, // every 5 minutes
        }
    }
}

/// Funding-selection policy for covering a payment amount.
///
/// A policy choice, not an invariant: both strategies conserve value, they
/// only differ in how much the token set fragments over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Fewest tokens that cover the amount (greedy largest-first)
    LargestFirst,
    /// Consume small tokens first to limit dust accumulation
    SmallestFirst,
}

/// Transaction engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Window for the duplicate-submission guard (seconds)
    pub duplicate_window_secs: i64,

    /// Funding selection strategy
    pub selection_strategy: SelectionStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duplicate_window_secs: 300,
            selection_strategy: SelectionStrategy::LargestFirst,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 16, // handheld-sized, not server-sized
            max_write_buffer_number: 2,
            max_background_jobs: 2,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(wallet_id) = std::env::var("WALLET_ID") {
            config.wallet_id = wallet_id;
        }

        if let Ok(issuer_id) = std::env::var("WALLET_ISSUER_ID") {
            config.issuer_id = issuer_id;
        }

        if let Ok(secs) = std::env::var("WALLET_SWEEP_INTERVAL_SECS") {
            config.sweep.interval_secs = secs
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid sweep interval: {}", e)))?;
        }

        Ok(config)
    }
}
