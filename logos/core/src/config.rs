//! TOML Configuration File Support
//!
//! Centralized configuration for the scheduling engine, read from
//! `~/.config/logos/config.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`LOGOS_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [scheduler]
//! kind = "priority"
//! poll_interval_ms = 100
//! result_ttl_secs = 300
//!
//! [scoring]
//! cold_start_penalty = 5.0
//!
//! [classifier]
//! sigmoid_k = 0.2
//!
//! [classifier.default_policy]
//! threshold_privacy = "CLOUD_IN_EU_BY_US_PROVIDER"
//!
//! [azure]
//! capacity_threshold = 10
//!
//! [ollama]
//! total_vram_mb = 24576
//!
//! [health]
//! interval_secs = 30
//! auto_remove_after_secs = 300
//!
//! [[providers]]
//! id = "ollama-local"
//! kind = "ollama"
//! url = "http://127.0.0.1:11434"
//!
//! [[models]]
//! model_id = "llama3"
//! provider_id = "ollama-local"
//! privacy = "LOCAL"
//! weight_cost = 90
//! weight_quality = 55
//! slots = 2
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classification::{ClassifierConfig, ModelDescriptor};
use crate::providers::HealthConfig;
use crate::scheduling::{ManagerConfig, SchedulerKind, ScoringConfig};
use crate::sdi::{AzureConfig, OllamaConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the effective configuration last came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in defaults
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration Structures
// =============================================================================

/// `[scheduler]` section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Strategy
    pub kind: SchedulerKind,
    /// Idle wait between ticks
    pub poll_interval_ms: u64,
    /// Unclaimed result lifetime
    pub result_ttl_secs: u64,
    /// Slots for models not listed in `[[models]]`
    pub default_slots_per_model: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            kind: SchedulerKind::default(),
            poll_interval_ms: manager.poll_interval_ms,
            result_ttl_secs: manager.result_ttl_secs,
            default_slots_per_model: manager.default_slots_per_model,
        }
    }
}

impl SchedulerSection {
    /// Manager settings from this section
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            poll_interval_ms: self.poll_interval_ms,
            result_ttl_secs: self.result_ttl_secs,
            default_slots_per_model: self.default_slots_per_model,
        }
    }
}

/// Kind of statically configured provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Azure OpenAI; capacity from response headers
    Azure,
    /// Ollama; capacity from `/api/ps`
    Ollama,
}

/// `[[providers]]` entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Provider id referenced by `[[models]]`
    pub id: String,
    /// Provider kind
    pub kind: ProviderKind,
    /// Base URL (required for Ollama)
    #[serde(default)]
    pub url: Option<String>,
    /// Azure: model id to deployment name
    #[serde(default)]
    pub deployments: BTreeMap<String, String>,
}

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogosConfig {
    /// Scheduling loop
    pub scheduler: SchedulerSection,
    /// Priority scheduler weights
    pub scoring: ScoringConfig,
    /// Policy classifier
    pub classifier: ClassifierConfig,
    /// Azure facade
    pub azure: AzureConfig,
    /// Ollama facades
    pub ollama: OllamaConfig,
    /// Temp provider health monitor
    pub health: HealthConfig,
    /// Static providers
    pub providers: Vec<ProviderEndpoint>,
    /// Model catalog
    pub models: Vec<ModelDescriptor>,

    /// Where the configuration came from
    #[serde(skip)]
    pub source: ConfigSource,
    /// File the configuration was read from
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

impl LogosConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::ValidationError(msg)) };

        if self.scheduler.poll_interval_ms == 0 {
            return invalid("scheduler.poll_interval_ms must be greater than 0".into());
        }
        if !(self.classifier.sigmoid_k.is_finite() && self.classifier.sigmoid_k > 0.0) {
            return invalid(format!(
                "classifier.sigmoid_k must be a positive number, got {}",
                self.classifier.sigmoid_k
            ));
        }
        let scoring = &self.scoring;
        if [scoring.priority_weight, scoring.depth_weight, scoring.slot_weight, scoring.cold_start_penalty]
            .iter()
            .any(|w| !w.is_finite())
        {
            return invalid("scoring weights must be finite".into());
        }
        if self.ollama.total_vram_mb == 0 {
            return invalid("ollama.total_vram_mb must be greater than 0".into());
        }
        if self.health.interval_secs == 0 || self.health.probe_timeout_secs == 0 {
            return invalid("health.interval_secs and health.probe_timeout_secs must be greater than 0".into());
        }

        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if !provider_ids.insert(provider.id.as_str()) {
                return invalid(format!("duplicate provider id '{}'", provider.id));
            }
            if provider.kind == ProviderKind::Ollama && provider.url.is_none() {
                return invalid(format!("ollama provider '{}' needs a url", provider.id));
            }
        }

        let mut model_ids = HashSet::new();
        for model in &self.models {
            if !model_ids.insert(model.model_id.as_str()) {
                return invalid(format!("duplicate model id '{}'", model.model_id));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/logos/config.toml`, typically `~/.config/logos/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("logos").join("config.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<LogosConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_from_path(path: Option<&Path>) -> Result<LogosConfig, ConfigError> {
    let mut config = LogosConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                path: config_path.to_path_buf(),
                source: e,
            })?;
            config = LogosConfig::from_toml_str(&content)?;
            config.source = ConfigSource::File;
            config.config_file_path = Some(config_path.to_path_buf());

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config);
    Ok(config)
}

/// Apply `LOGOS_*` environment variables
pub fn apply_env_config(config: &mut LogosConfig) {
    apply_env_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from any key lookup (the process environment in production)
pub fn apply_env_from(config: &mut LogosConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
                None
            }
        }
    }

    let mut touched = false;
    if let Some(kind) = parsed::<SchedulerKind>(&lookup, "LOGOS_SCHEDULER") {
        config.scheduler.kind = kind;
        touched = true;
    }
    if let Some(ms) = parsed(&lookup, "LOGOS_POLL_INTERVAL_MS") {
        config.scheduler.poll_interval_ms = ms;
        touched = true;
    }
    if let Some(secs) = parsed(&lookup, "LOGOS_RESULT_TTL_SECS") {
        config.scheduler.result_ttl_secs = secs;
        touched = true;
    }
    if let Some(threshold) = parsed(&lookup, "LOGOS_AZURE_CAPACITY_THRESHOLD") {
        config.azure.capacity_threshold = threshold;
        touched = true;
    }
    if let Some(mb) = parsed(&lookup, "LOGOS_OLLAMA_TOTAL_VRAM_MB") {
        config.ollama.total_vram_mb = mb;
        touched = true;
    }
    if let Some(secs) = parsed(&lookup, "LOGOS_HEALTH_INTERVAL_SECS") {
        config.health.interval_secs = secs;
        touched = true;
    }
    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Scheduler strategy override
    pub scheduler: Option<SchedulerKind>,
    /// Poll interval override
    pub poll_interval: Option<Duration>,
    /// Health probe interval override
    pub health_interval: Option<Duration>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduler strategy
    #[must_use]
    pub fn with_scheduler(mut self, kind: SchedulerKind) -> Self {
        self.scheduler = Some(kind);
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the health probe interval
    #[must_use]
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = Some(interval);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.poll_interval.is_none() && self.health_interval.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut LogosConfig) {
        if self.is_empty() {
            return;
        }
        if let Some(kind) = self.scheduler {
            config.scheduler.kind = kind;
        }
        if let Some(interval) = self.poll_interval {
            config.scheduler.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(interval) = self.health_interval {
            config.health.interval_secs = interval.as_secs();
        }
        config.source = ConfigSource::Cli;
    }
}
