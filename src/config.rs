//! TOML configuration with per-section defaults.
//!
//! Every section and field is optional; a missing config file yields a
//! fully defaulted [`Config`]. The Replicate token may come from the file
//! or the `REPLICATE_API_TOKEN` environment variable (env wins).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Stability SDXL image-to-image version used when none is configured.
pub const DEFAULT_MODEL_VERSION: &str =
    "39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditsConfig {
    /// Credits deducted per successful headshot generation.
    #[serde(default = "default_cost")]
    pub cost_per_generation: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database file holding the ledger and rate counters.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Replicate API token; `REPLICATE_API_TOKEN` overrides this.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Generation requests allowed per client key per window.
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_cost() -> i64 {
    2
}
fn default_db_path() -> PathBuf {
    PathBuf::from("lumishot.db")
}
fn default_provider() -> String {
    "replicate".to_string()
}
fn default_model_version() -> String {
    DEFAULT_MODEL_VERSION.to_string()
}
fn default_true() -> bool {
    true
}
fn default_rate_limit() -> u32 {
    10
}
fn default_window_secs() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            cost_per_generation: default_cost(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_version: default_model_version(),
            api_token: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            limit: default_rate_limit(),
            window_secs: default_window_secs(),
        }
    }
}

impl Config {
    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        if config.credits.cost_per_generation < 1 {
            anyhow::bail!("credits.cost_per_generation must be at least 1");
        }

        Ok(config)
    }

    /// Resolved Replicate token: environment variable first, then the file.
    pub fn replicate_token(&self) -> Option<String> {
        std::env::var("REPLICATE_API_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.generation.api_token.clone())
    }
}
