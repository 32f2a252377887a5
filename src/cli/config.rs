//! Operator configuration file handling.
//!
//! Deployment settings (identity, paths, tunables) live in a TOML file
//! under the database root. Every protocol constant is configurable here;
//! the defaults are the network values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 4 MiB chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 22;
/// Starting estimate per prover: 128 chunks (512 MiB).
pub const DEFAULT_N_CHUNKS: u64 = 128;
/// Additive increase after a verified challenge (1 GiB).
pub const VALIDATION_INCREASING_RATE: u64 = 256;
/// Frontier window and decrease step (256 MiB).
pub const VALIDATION_DECREASING_RATE: u64 = 64;
/// Score moving-average factor.
pub const ALPHA: f32 = 0.9;
/// Seconds between validation steps.
pub const STEP_TIME_SECS: u64 = 20;
/// Seconds between weight emissions.
pub const SCORES_TIME_SECS: u64 = 600;
/// Seconds between prover reallocation passes.
pub const REALLOCATE_SECS: u64 = 600;
/// Default prover allocation in GB.
pub const MIN_SIZE_IN_GB: f64 = 100.0;
/// Placements per sharded chunk.
pub const CHUNK_STORE_COUNT: usize = 1;
/// Retry rounds in the file sharder.
pub const LIMIT_LOOP_COUNT: usize = 3;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorageConfig {
    pub node: NodeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub auditor: AuditorSection,

    #[serde(default)]
    pub sharder: SharderSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity and filesystem roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Wallet name, first path segment under the database root.
    pub wallet: String,

    /// Hotkey name, second path segment.
    pub hotkey: String,

    /// Own SS58 identity in the peer directory.
    pub peer_id: String,

    /// Root of the shard database tree.
    #[serde(default = "default_db_root")]
    pub db_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Total disk the prover spreads across auditors, in GB.
    #[serde(default = "default_size_gb")]
    pub size_gb: f64,

    /// Worker pool size; 0 means one per host CPU.
    #[serde(default)]
    pub workers: usize,

    #[serde(default = "default_reallocate_secs")]
    pub reallocate_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorSection {
    #[serde(default = "default_n_chunks")]
    pub default_n_chunks: u64,

    #[serde(default = "default_increase_rate")]
    pub increase_rate: u64,

    #[serde(default = "default_decrease_rate")]
    pub decrease_rate: u64,

    #[serde(default = "default_alpha")]
    pub alpha: f32,

    #[serde(default = "default_step_time")]
    pub step_time_secs: u64,

    #[serde(default = "default_scores_time")]
    pub scores_time_secs: u64,

    /// Skip persisting allocations after weight emission.
    #[serde(default)]
    pub no_store_weights: bool,

    /// Ignore persisted allocations at startup.
    #[serde(default)]
    pub no_restore_weights: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharderSection {
    #[serde(default = "default_chunk_store_count")]
    pub chunk_store_count: usize,

    #[serde(default = "default_limit_loop_count")]
    pub limit_loop_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_db_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tensorage-db")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_size_gb() -> f64 {
    MIN_SIZE_IN_GB
}

fn default_reallocate_secs() -> u64 {
    REALLOCATE_SECS
}

fn default_n_chunks() -> u64 {
    DEFAULT_N_CHUNKS
}

fn default_increase_rate() -> u64 {
    VALIDATION_INCREASING_RATE
}

fn default_decrease_rate() -> u64 {
    VALIDATION_DECREASING_RATE
}

fn default_alpha() -> f32 {
    ALPHA
}

fn default_step_time() -> u64 {
    STEP_TIME_SECS
}

fn default_scores_time() -> u64 {
    SCORES_TIME_SECS
}

fn default_chunk_store_count() -> usize {
    CHUNK_STORE_COUNT
}

fn default_limit_loop_count() -> usize {
    LIMIT_LOOP_COUNT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            size_gb: MIN_SIZE_IN_GB,
            workers: 0,
            reallocate_secs: REALLOCATE_SECS,
        }
    }
}

impl Default for AuditorSection {
    fn default() -> Self {
        Self {
            default_n_chunks: DEFAULT_N_CHUNKS,
            increase_rate: VALIDATION_INCREASING_RATE,
            decrease_rate: VALIDATION_DECREASING_RATE,
            alpha: ALPHA,
            step_time_secs: STEP_TIME_SECS,
            scores_time_secs: SCORES_TIME_SECS,
            no_store_weights: false,
            no_restore_weights: false,
        }
    }
}

impl Default for SharderSection {
    fn default() -> Self {
        Self {
            chunk_store_count: CHUNK_STORE_COUNT,
            limit_loop_count: LIMIT_LOOP_COUNT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl TensorageConfig {
    pub fn new(wallet: String, hotkey: String, peer_id: String) -> Self {
        Self {
            node: NodeConfig {
                wallet,
                hotkey,
                peer_id,
                db_root: default_db_root(),
            },
            storage: StorageConfig::default(),
            auditor: AuditorSection::default(),
            sharder: SharderSection::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: TensorageConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;
        Ok(())
    }

    /// Resolved worker count: the configured value, or one per host CPU.
    pub fn workers(&self) -> usize {
        if self.storage.workers > 0 {
            self.storage.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Prover allocation budget in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.storage.size_gb * (1u64 << 30) as f64) as u64
    }
}

/// Default config file location under the database root.
pub fn default_config_path(db_root: &Path) -> PathBuf {
    db_root.join("config.toml")
}
