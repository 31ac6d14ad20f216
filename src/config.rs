//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.cropsys.toml` files.

use crate::batch::{BatchConfig, TimeEstimator};
use crate::indicators::IndicatorRegistry;
use crate::service::ServiceConfig;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = ".cropsys.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Batch calculation settings.
    #[serde(default)]
    pub batch: BatchSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding systems and the process log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            verbose: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".cropsys")
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Number of retries on transient failures.
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// AI calculation switch. When false, batch and single calculations
    /// are refused.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
            enabled: true,
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    120
}

fn default_retries() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// Batch orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Maximum in-flight AI calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on one AI call, retries included.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,

    /// Estimate used when no finished batch exists yet.
    #[serde(default = "default_fallback_rate")]
    pub fallback_seconds_per_indicator: f64,

    /// Number of recent batches averaged by the estimator.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Indicators the AI may fill, by key.
    #[serde(default = "default_calculable")]
    pub calculable: Vec<String>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            task_timeout_seconds: default_task_timeout(),
            fallback_seconds_per_indicator: default_fallback_rate(),
            history_window: default_history_window(),
            calculable: default_calculable(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_task_timeout() -> u64 {
    180
}

fn default_fallback_rate() -> f64 {
    4.0
}

fn default_history_window() -> usize {
    5
}

fn default_calculable() -> Vec<String> {
    IndicatorRegistry::default()
        .keys()
        .iter()
        .map(|k| k.as_str().to_string())
        .collect()
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
        if let Some(ref data_dir) = args.data_dir {
            self.general.data_dir = data_dir.clone();
        }
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }
        if args.no_ai {
            self.model.enabled = false;
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Settings handed to the indicator service.
    pub fn service_config(&self) -> Result<ServiceConfig> {
        let registry = IndicatorRegistry::from_names(self.batch.calculable.as_slice())
            .map_err(|e| anyhow!("Invalid [batch] calculable list: {}", e))?;
        if registry.is_empty() {
            return Err(anyhow!("[batch] calculable must name at least one indicator"));
        }

        if self.batch.concurrency == 0 {
            return Err(anyhow!("[batch] concurrency must be at least 1"));
        }

        Ok(ServiceConfig {
            registry,
            batch: BatchConfig {
                concurrency: self.batch.concurrency,
                task_timeout: Duration::from_secs(self.batch.task_timeout_seconds),
                ai_enabled: self.model.enabled,
            },
            estimator: TimeEstimator {
                history_window: self.batch.history_window,
                fallback_seconds_per_indicator: self.batch.fallback_seconds_per_indicator,
            },
        })
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
