//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.cookie-analyst.toml` files.

use crate::agent::backend::BackendConfig;
use crate::agent::retry::RetryConfig;
use crate::analysis::reducer::ReductionConfig;
use crate::ingest::cookie_fun::DeltaInterval;
use crate::models::FailurePolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".cookie-analyst.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Reasoning model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Reduction loop settings.
    #[serde(default)]
    pub reduction: ReductionSettings,

    /// Market data ingestion settings.
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding ingestion runs, tweets, the ledger and the cache.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            verbose: false,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}

/// Reasoning model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name sent to the backend.
    #[serde(default = "default_model")]
    pub name: String,

    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Sampling temperature; reasoning models reject it, so it is unset by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default = "default_max_completion_tokens")]
    pub max_completion_tokens: u32,

    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Retries per batch on transient failures.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            temperature: None,
            max_completion_tokens: default_max_completion_tokens(),
            reasoning_effort: default_reasoning_effort(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
        }
    }
}

fn default_model() -> String {
    "o3-mini".to_string()
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_completion_tokens() -> u32 {
    30_000
}

fn default_reasoning_effort() -> Option<String> {
    Some("medium".to_string())
}

fn default_timeout() -> u64 {
    600
}

fn default_retries() -> u32 {
    3
}

/// Reduction loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReductionSettings {
    /// Maximum estimated tokens per batch.
    #[serde(default = "default_budget")]
    pub budget_tokens: usize,

    /// Batches evaluated at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Safety cap on rounds per run.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Characters per estimated token.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}

impl Default for ReductionSettings {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget(),
            concurrency: default_concurrency(),
            failure_policy: FailurePolicy::default(),
            max_rounds: default_max_rounds(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_budget() -> usize {
    60_000
}

fn default_concurrency() -> usize {
    3
}

fn default_max_rounds() -> usize {
    8
}

fn default_chars_per_token() -> f64 {
    crate::analysis::estimator::DEFAULT_CHARS_PER_TOKEN
}

/// Cookie.fun ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_url")]
    pub api_url: String,

    /// Environment variable holding the cookie.fun API key.
    #[serde(default = "default_ingest_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Pause between page requests in milliseconds.
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,

    #[serde(default)]
    pub delta_interval: DeltaInterval,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_url: default_ingest_url(),
            api_key_env: default_ingest_key_env(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            page_delay_ms: default_page_delay(),
            delta_interval: DeltaInterval::default(),
        }
    }
}

fn default_ingest_url() -> String {
    "https://api.cookie.fun/v2/".to_string()
}

fn default_ingest_key_env() -> String {
    "COOKIE_FUN_API_KEY".to_string()
}

fn default_page_size() -> u32 {
    25
}

fn default_max_pages() -> u32 {
    15
}

fn default_page_delay() -> u64 {
    500
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref dir) = args.storage_dir {
            self.general.storage_dir = dir.clone();
        }
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Apply `analyze`/`summarize-tweets` overrides.
    pub fn merge_with_run_args(&mut self, run: &crate::cli::RunArgs) {
        if let Some(budget) = run.budget {
            self.reduction.budget_tokens = budget;
        }
        if let Some(concurrency) = run.concurrency {
            self.reduction.concurrency = concurrency;
        }
        if run.best_effort {
            self.reduction.failure_policy = FailurePolicy::BestEffort;
        }
    }

    /// The model API key, or an error naming the variable to set.
    pub fn require_model_key(&self) -> Result<()> {
        match self.backend_config().api_key {
            Some(_) => Ok(()),
            None => anyhow::bail!(
                "{} is not set; the model API key is required to run an analysis",
                self.model.api_key_env
            ),
        }
    }

    /// Backend settings with the API key resolved from the environment.
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            api_url: self.model.api_url.clone(),
            api_key: std::env::var(&self.model.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model_name: self.model.name.clone(),
            temperature: self.model.temperature,
            max_completion_tokens: Some(self.model.max_completion_tokens),
            reasoning_effort: self.model.reasoning_effort.clone(),
            timeout_seconds: self.model.timeout_seconds,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_retries(self.model.retries)
    }

    pub fn reduction_config(&self) -> ReductionConfig {
        ReductionConfig {
            budget: self.reduction.budget_tokens,
            concurrency: self.reduction.concurrency,
            failure_policy: self.reduction.failure_policy,
            max_rounds: self.reduction.max_rounds,
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
