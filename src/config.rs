//! Runtime configuration for kv-slot-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Pool sizing lives in [`PoolConfig`]; knobs of the replay scheduler live in
//! [`SchedulerConfig`].

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::selector::SlotPolicy;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-slot-sim", about = "Replay a request workload against the prefix-cache slot pool")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Path to the workload file (JSON).
    #[arg(short, long)]
    pub workload: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Slot pool sizing.
    pub pool: PoolConfig,

    /// Request scheduling.
    pub scheduler: SchedulerConfig,
}

/// Slot pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of parallel sequences, one slot each.
    pub num_slots: usize,

    /// Total KV cache size in inputs, split evenly between slots.
    pub kv_size: usize,

    /// Largest batch evaluated at once; each slot must hold at least one batch.
    pub batch_size: usize,

    /// Use best-match selection (forks and LRU eviction) instead of
    /// longest-match. Better hit rates when many users share the server.
    pub multi_user_cache: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_slots: 4,
            kv_size: 8192,
            batch_size: 512,
            multi_user_cache: false,
        }
    }
}

impl PoolConfig {
    /// Per-slot context capacity.
    pub fn num_ctx(&self) -> usize {
        if self.num_slots == 0 {
            return 0;
        }
        self.kv_size / self.num_slots
    }

    /// Selection policy implied by `multi_user_cache`.
    pub fn policy(&self) -> SlotPolicy {
        if self.multi_user_cache {
            SlotPolicy::Best
        } else {
            SlotPolicy::Longest
        }
    }
}

/// Settings of the replay scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default number of leading inputs protected from context shifts.
    pub num_keep: usize,

    /// Default for reusing cached prompt prefixes.
    pub cache_prompt: bool,

    /// Size of the synthetic vocabulary generated tokens are drawn from.
    pub vocab_size: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_keep: 4,
            cache_prompt: true,
            vocab_size: 32000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
