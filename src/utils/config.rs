//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `MESH_*` environment variables override config file values.
//! Example: `MESH_TP_SIZE=2` overrides `distributed.tp_size`, and
//! `MESH_OPTIMIZER__LEARNING_RATE=3e-4` targets one section explicitly.

use crate::data::sampler::SplitKind;
use crate::distributed::mesh::MeshShape;
use crate::utils::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

const ENV_PREFIX: &str = "MESH_";

/// Topology and rendezvous settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// World size (total number of processes)
    #[serde(default = "default_one")]
    pub world_size: usize,

    /// Tensor parallelism degree
    #[serde(default = "default_one")]
    pub tp_size: usize,

    /// Data parallelism degree
    #[serde(default = "default_one")]
    pub dp_size: usize,

    /// Pipeline parallelism degree
    #[serde(default = "default_one")]
    pub pp_size: usize,

    /// Communication backend
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Rendezvous address
    #[serde(default = "default_master_addr")]
    pub master_addr: String,

    /// Rendezvous port
    #[serde(default = "default_master_port")]
    pub master_port: u16,

    /// Global rank of this process
    #[serde(default)]
    pub rank: usize,

    /// Position on the host; derived from `rank % ranks_per_host` when unset
    #[serde(default)]
    pub local_rank: Option<usize>,

    #[serde(default = "default_ranks_per_host")]
    pub ranks_per_host: usize,

    /// Seconds a collective waits for its peers
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    #[serde(default = "default_beta1")]
    pub beta1: f64,

    #[serde(default = "default_beta2")]
    pub beta2: f64,

    #[serde(default = "default_eps")]
    pub eps: f64,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Keep fp32 master weights and accumulate gradients in fp32
    #[serde(default = "default_true")]
    pub accumulate_grad_in_fp32: bool,

    /// 0 = replicated optimizer state, 1 = state sharded across data parallel
    #[serde(default)]
    pub zero_stage: u8,
}

/// One weighted domain of the training mix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainWeight {
    pub name: String,
    pub weight: f64,
}

/// Data-loading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_one")]
    pub micro_batch_size: usize,

    /// Tokens per sample, excluding the shifted label token
    #[serde(default = "default_seq_len")]
    pub sequence_length: usize,

    /// Split name containing "train" or "test"
    #[serde(default = "default_split")]
    pub split: String,

    /// Token ids drawn by the synthetic generator lie in `0..vocab_size`
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    #[serde(default)]
    pub domains: Vec<DomainWeight>,

    /// Samples already consumed across all data-parallel ranks
    #[serde(default)]
    pub consumed_train_samples: usize,
}

/// Process-wide switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Skip cross-rank batch checks for throughput
    #[serde(default = "default_true")]
    pub ignore_sanity_checks: bool,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshConfig {
    #[serde(default)]
    pub distributed: DistributedConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub general: GeneralConfig,
}

// Default value functions
fn default_one() -> usize { 1 }
fn default_true() -> bool { true }
fn default_backend() -> String { "local".to_string() }
fn default_master_addr() -> String { "localhost".to_string() }
fn default_master_port() -> u16 { 29500 }
fn default_ranks_per_host() -> usize { 8 }
fn default_timeout_secs() -> u64 { 1800 }
fn default_lr() -> f64 { 1e-4 }
fn default_beta1() -> f64 { 0.9 }
fn default_beta2() -> f64 { 0.999 }
fn default_eps() -> f64 { 1e-8 }
fn default_weight_decay() -> f64 { 0.1 }
fn default_seed() -> u64 { 42 }
fn default_seq_len() -> usize { 2048 }
fn default_split() -> String { "train".to_string() }
fn default_vocab_size() -> usize { 32000 }

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: default_one(),
            tp_size: default_one(),
            dp_size: default_one(),
            pp_size: default_one(),
            backend: default_backend(),
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            rank: 0,
            local_rank: None,
            ranks_per_host: default_ranks_per_host(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: default_weight_decay(),
            accumulate_grad_in_fp32: true,
            zero_stage: 0,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            micro_batch_size: default_one(),
            sequence_length: default_seq_len(),
            split: default_split(),
            vocab_size: default_vocab_size(),
            domains: Vec::new(),
            consumed_train_samples: 0,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { ignore_sanity_checks: true }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MeshError::Config(format!("invalid value {:?} for {}", value, key)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(MeshError::Config(format!("invalid boolean {:?} for {}", value, key))),
    }
}

impl MeshConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| MeshError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Nested keys use double underscore: `MESH_DISTRIBUTED__TP_SIZE`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(env::vars())?;
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(env::vars())?;
        Ok(config)
    }

    /// Apply `MESH_*` overrides from an iterator of (key, value) pairs.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(config_key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let config_key = config_key.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            let applied = match parts.as_slice() {
                ["distributed", field] => self.apply_distributed_override(field, &key, &value)?,
                ["optimizer", field] => self.apply_optimizer_override(field, &key, &value)?,
                ["data", field] => self.apply_data_override(field, &key, &value)?,
                ["general", field] => self.apply_general_override(field, &key, &value)?,
                [field] => {
                    // Try each section for simple keys
                    self.apply_distributed_override(field, &key, &value)?
                        | self.apply_optimizer_override(field, &key, &value)?
                        | self.apply_data_override(field, &key, &value)?
                        | self.apply_general_override(field, &key, &value)?
                }
                _ => false,
            };
            if !applied {
                debug!(key = %key, "Unknown config key pattern");
            }
        }
        Ok(())
    }

    fn apply_distributed_override(&mut self, field: &str, key: &str, value: &str) -> Result<bool> {
        let d = &mut self.distributed;
        match field {
            "world_size" => d.world_size = parse(key, value)?,
            "tp_size" => d.tp_size = parse(key, value)?,
            "dp_size" => d.dp_size = parse(key, value)?,
            "pp_size" => d.pp_size = parse(key, value)?,
            "backend" => d.backend = value.to_string(),
            "master_addr" => d.master_addr = value.to_string(),
            "master_port" => d.master_port = parse(key, value)?,
            "rank" => d.rank = parse(key, value)?,
            "local_rank" => d.local_rank = Some(parse(key, value)?),
            "ranks_per_host" => d.ranks_per_host = parse(key, value)?,
            "timeout_secs" => d.timeout_secs = parse(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn apply_optimizer_override(&mut self, field: &str, key: &str, value: &str) -> Result<bool> {
        let o = &mut self.optimizer;
        match field {
            "learning_rate" | "lr" => o.learning_rate = parse(key, value)?,
            "beta1" => o.beta1 = parse(key, value)?,
            "beta2" => o.beta2 = parse(key, value)?,
            "eps" => o.eps = parse(key, value)?,
            "weight_decay" => o.weight_decay = parse(key, value)?,
            "accumulate_grad_in_fp32" => o.accumulate_grad_in_fp32 = parse_bool(key, value)?,
            "zero_stage" => o.zero_stage = parse(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn apply_data_override(&mut self, field: &str, key: &str, value: &str) -> Result<bool> {
        let d = &mut self.data;
        match field {
            "seed" => d.seed = parse(key, value)?,
            "micro_batch_size" => d.micro_batch_size = parse(key, value)?,
            "sequence_length" | "seq_len" => d.sequence_length = parse(key, value)?,
            "vocab_size" => d.vocab_size = parse(key, value)?,
            "split" => d.split = value.to_string(),
            "consumed_train_samples" => d.consumed_train_samples = parse(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn apply_general_override(&mut self, field: &str, key: &str, value: &str) -> Result<bool> {
        match field {
            "ignore_sanity_checks" => self.general.ignore_sanity_checks = parse_bool(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        let d = &self.distributed;
        MeshShape::new(d.world_size, d.tp_size, d.dp_size, d.pp_size)?;

        if d.rank >= d.world_size {
            return Err(MeshError::Config(format!(
                "rank ({}) must be below world_size ({})",
                d.rank, d.world_size
            )));
        }
        if d.ranks_per_host == 0 || d.timeout_secs == 0 {
            return Err(MeshError::Config(
                "ranks_per_host and timeout_secs must be positive".to_string(),
            ));
        }

        let o = &self.optimizer;
        if o.zero_stage > 1 {
            return Err(MeshError::Config(format!(
                "zero_stage {} is not supported, expected 0 or 1",
                o.zero_stage
            )));
        }
        if !(0.0..1.0).contains(&o.beta1) || !(0.0..1.0).contains(&o.beta2) {
            return Err(MeshError::Config(format!(
                "betas ({}, {}) must lie in [0, 1)",
                o.beta1, o.beta2
            )));
        }

        let data = &self.data;
        if data.micro_batch_size == 0 {
            return Err(MeshError::Config("micro_batch_size must be positive".to_string()));
        }
        if data.sequence_length == 0 || data.vocab_size == 0 {
            return Err(MeshError::Config(
                "sequence_length and vocab_size must be positive".to_string(),
            ));
        }
        SplitKind::parse(&data.split)?;
        if let Some(bad) = data.domains.iter().find(|w| !(w.weight >= 0.0)) {
            return Err(MeshError::Config(format!(
                "domain {} has negative weight {}",
                bad.name, bad.weight
            )));
        }
        if !data.domains.is_empty() && data.domains.iter().map(|w| w.weight).sum::<f64>() <= 0.0 {
            return Err(MeshError::Config("domain weights must not all be zero".to_string()));
        }

        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MeshError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}
