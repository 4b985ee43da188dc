//! Runtime configuration for kv-prefix-pool.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Pool sizing, the per-token KV layout and the simulated workload live here.

use std::path::PathBuf;

use anyhow::ensure;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-prefix-pool", about = "Prefix-sharing KV block pool simulator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the number of simulated requests.
    #[arg(long)]
    pub requests: Option<usize>,

    /// Print the prometheus exposition after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block pool sizing and policy.
    pub pool: PoolConfig,

    /// Per-token KV layout, used to size storage buffers.
    pub layout: LayoutConfig,

    /// Synthetic workload for the simulator.
    pub workload: WorkloadConfig,
}

/// Block pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of blocks in the pool (fixed for its lifetime).
    pub num_blocks: usize,

    /// Tokens per block.
    pub block_size: usize,

    /// Keep blocks whose last claim is released resident (and evictable)
    /// instead of swapping them out and reclaiming them immediately.
    pub retain_released: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_blocks: 256,
            block_size: 16,
            retain_released: false,
        }
    }
}

/// Shape of the KV state held for one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Number of layers in the model.
    pub n_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Bytes per element (2 for FP16).
    pub dtype_bytes: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            n_kv_heads: 2,
            head_dim: 16,
            dtype_bytes: 2,
        }
    }
}

impl LayoutConfig {
    /// Bytes of K and V state per token across all layers.
    pub fn bytes_per_token(&self) -> usize {
        self.n_layers * self.n_kv_heads * self.head_dim * self.dtype_bytes * 2
    }
}

/// Synthetic request mix replayed by the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of requests to replay.
    pub requests: usize,

    /// Number of distinct shared prefixes (e.g. system prompts).
    pub prefix_groups: usize,

    /// Length of each shared prefix in tokens.
    pub shared_prefix_tokens: usize,

    /// Per-request prompt tokens after the shared prefix.
    pub unique_prompt_tokens: usize,

    /// Tokens generated per request.
    pub decode_tokens: usize,

    /// Requests kept running at once.
    pub max_running: usize,

    /// Seed for the token generator.
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            requests: 64,
            prefix_groups: 4,
            shared_prefix_tokens: 48,
            unique_prompt_tokens: 24,
            decode_tokens: 16,
            max_running: 8,
            seed: 42,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pool cannot be built from.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.pool.num_blocks > 0, "pool.num_blocks must be positive");
        ensure!(self.pool.block_size > 0, "pool.block_size must be positive");
        ensure!(
            self.layout.bytes_per_token() > 0,
            "layout must describe a non-empty per-token state"
        );
        Ok(())
    }

    /// Size of a single KV block in bytes.
    pub fn kv_block_bytes(&self) -> usize {
        self.pool.block_size * self.layout.bytes_per_token()
    }

    /// Fast-tier bytes needed to hold the whole pool resident.
    pub fn pool_bytes(&self) -> usize {
        self.pool.num_blocks * self.kv_block_bytes()
    }

    /// Tokens the pool can hold when every block is full.
    pub fn pool_tokens(&self) -> usize {
        self.pool.num_blocks * self.pool.block_size
    }
}
