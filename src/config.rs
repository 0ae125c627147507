//! Bridge configuration
//!
//! Tunables for the registry and the decode loop, read once from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "LLAMA_BRIDGE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDir(String),
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Context length used when the engine reports a non-positive default
    pub fallback_context_len: u32,
    /// Token scratch capacity for prompt tokenization
    pub token_capacity: usize,
    /// Byte scratch capacity for a single token's text, terminator included
    pub piece_capacity: usize,
    /// Temperatures at or below this use greedy sampling
    pub greedy_threshold: f32,
    /// Scale applied to every LoRA adapter
    pub adapter_scale: f32,
    /// Sampler seed (0 = fresh random seed per call)
    pub seed: u32,
    /// Default `tracing` directive when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fallback_context_len: 2048,
            token_capacity: 8192,
            piece_capacity: 256,
            greedy_threshold: 0.001,
            adapter_scale: 1.0,
            seed: 0,
            log_filter: "llama_bridge=info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Resets out-of-range values to their defaults.
    pub fn validate(&mut self) {
        let defaults = Self::default();

        if self.fallback_context_len == 0 {
            self.fallback_context_len = defaults.fallback_context_len;
        }
        if self.token_capacity == 0 {
            self.token_capacity = defaults.token_capacity;
        }
        // One byte of text plus the terminator at minimum
        if self.piece_capacity < 2 {
            self.piece_capacity = defaults.piece_capacity;
        }
        if !self.greedy_threshold.is_finite() || self.greedy_threshold < 0.0 {
            self.greedy_threshold = defaults.greedy_threshold;
        }
        if !self.adapter_scale.is_finite() {
            self.adapter_scale = defaults.adapter_scale;
        }
        if self.log_filter.trim().is_empty() {
            self.log_filter = defaults.log_filter;
        }
    }
}

/// Default config location: `{data_dir}/bridge.json`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "LlamaBridge", "LlamaBridge")
        .map(|dirs| dirs.data_dir().join("bridge.json"))
        .ok_or_else(|| ConfigError::DataDir("Could not determine data directory".to_string()))
}

/// Loads the config named by [`CONFIG_ENV`], or the default location.
///
/// Returns defaults if the file doesn't exist or is corrupted
pub fn load_config() -> BridgeConfig {
    let path = match std::env::var_os(CONFIG_ENV) {
        Some(p) => Ok(PathBuf::from(p)),
        None => default_config_path(),
    };
    match path.and_then(|p| load_config_from(&p)) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load bridge config, using defaults: {}", e);
            BridgeConfig::default()
        }
    }
}

/// Loads and validates the config at `path`. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<BridgeConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(BridgeConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut config: BridgeConfig = serde_json::from_str(&json)?;
    config.validate();

    tracing::debug!("Loaded bridge config from {}", path.display());
    Ok(config)
}
