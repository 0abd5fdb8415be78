//! Ollama capacity facade
//!
//! Polls `GET /api/ps` for the set of resident models and their VRAM, and
//! derives how much of the configured VRAM budget is still free.
//!
//! # Ollama API
//!
//! ```text
//! GET /api/ps
//! {"models":[{"name":"llama3:latest","model":"llama3:latest",
//!             "size_vram":5137025024,"expires_at":"2024-06-04T14:38:31.83753-07:00"}]}
//! ```
//!
//! A model missing from the latest listing is cold. When the endpoint is
//! unreachable the previous listing stays in effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{CapacityInfo, ModelStatus, ProviderMetrics, SchedulingDataInterface};
use crate::scheduling::queue::PriorityQueueManager;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Ollama facade configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// VRAM budget of the host in MB
    pub total_vram_mb: u64,
    /// How often the refresh loop polls `/api/ps`
    pub refresh_interval_ms: u64,
    /// Per-request timeout for `/api/ps`
    pub request_timeout_ms: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            total_vram_mb: 16_384,
            refresh_interval_ms: 5_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl OllamaConfig {
    /// Set the VRAM budget
    #[must_use]
    pub fn with_total_vram_mb(mut self, total: u64) -> Self {
        self.total_vram_mb = total;
        self
    }

    /// Refresh cadence as a Duration
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Request timeout as a Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Debug, Deserialize)]
struct PsModel {
    name: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    size_vram: u64,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Clone, Debug)]
struct LoadedModel {
    vram_mb: u64,
    expires_at: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Default)]
struct OllamaState {
    /// Resident models from the latest successful poll, by listed name
    loaded: HashMap<String, LoadedModel>,
    /// `model` field to listed name, where the two differ
    aliases: HashMap<String, String>,
    /// VRAM each model needed the last time it was resident
    last_known_vram: HashMap<String, u64>,
    last_refresh: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl OllamaState {
    fn used_vram_mb(&self) -> u64 {
        self.loaded.values().map(|m| m.vram_mb).sum()
    }

    /// Match `llama3` against `llama3:latest` as Ollama reports it
    fn resolve(&self, map_key: &str) -> Option<String> {
        let tagged = format!("{map_key}:latest");
        let found = [map_key, tagged.as_str()].into_iter().find_map(|key| {
            if self.loaded.contains_key(key) {
                Some(key.to_string())
            } else {
                self.aliases.get(key).cloned()
            }
        });
        found
    }

    fn known_vram(&self, model_id: &str) -> Option<u64> {
        self.last_known_vram
            .get(model_id)
            .or_else(|| self.last_known_vram.get(&format!("{model_id}:latest")))
            .copied()
    }
}

/// Result of one poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Listing replaced
    Updated {
        /// Models resident after the refresh
        loaded_models: usize,
    },
    /// Poll failed; previous listing retained
    Stale {
        /// Why the poll failed
        reason: String,
    },
}

/// Capacity facade for one Ollama host
pub struct OllamaSdi {
    provider_id: String,
    base_url: String,
    config: OllamaConfig,
    http_client: reqwest::Client,
    queue: Option<Arc<PriorityQueueManager>>,
    state: RwLock<OllamaState>,
}

impl OllamaSdi {
    /// Create a facade for the Ollama host at `base_url`
    pub fn new(provider_id: impl Into<String>, base_url: impl Into<String>, config: OllamaConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
            http_client: reqwest::Client::new(),
            queue: None,
            state: RwLock::new(OllamaState::default()),
        }
    }

    /// Surface queue depth from this queue manager in model status
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<PriorityQueueManager>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Provider this facade polls
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn ps_url(&self) -> String {
        format!("{}/api/ps", self.base_url)
    }

    /// Poll the loaded-model listing
    ///
    /// Never fails: errors are logged and reported as [`RefreshOutcome::Stale`].
    pub async fn refresh_data(&self) -> RefreshOutcome {
        match self.fetch_ps().await {
            Ok(listing) => {
                let loaded_models = listing.models.len();
                self.apply_listing(listing);
                RefreshOutcome::Updated { loaded_models }
            }
            Err(reason) => {
                let failures = {
                    let mut state = self.state.write();
                    state.consecutive_failures += 1;
                    state.consecutive_failures
                };
                tracing::warn!(
                    provider_id = %self.provider_id,
                    error = %reason,
                    consecutive_failures = failures,
                    "Ollama refresh failed; keeping last known state"
                );
                RefreshOutcome::Stale { reason }
            }
        }
    }

    async fn fetch_ps(&self) -> Result<PsResponse, String> {
        let response = self
            .http_client
            .get(self.ps_url())
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("Ollama returned {}", response.status()));
        }

        response.json::<PsResponse>().await.map_err(|e| e.to_string())
    }

    fn apply_listing(&self, listing: PsResponse) {
        let mut loaded = HashMap::with_capacity(listing.models.len());
        let mut aliases = HashMap::new();
        for m in listing.models {
            let expires_at = m
                .expires_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
            let entry = LoadedModel {
                vram_mb: m.size_vram / BYTES_PER_MB,
                expires_at,
            };
            if let Some(alias) = m.model.filter(|alias| *alias != m.name) {
                aliases.insert(alias, m.name.clone());
            }
            loaded.insert(m.name, entry);
        }

        let mut state = self.state.write();
        for (name, model) in &loaded {
            state.last_known_vram.insert(name.clone(), model.vram_mb);
        }
        for (alias, name) in &aliases {
            if let Some(model) = loaded.get(name) {
                state.last_known_vram.insert(alias.clone(), model.vram_mb);
            }
        }
        state.loaded = loaded;
        state.aliases = aliases;
        state.last_refresh = Some(Utc::now());
        state.consecutive_failures = 0;

        tracing::debug!(
            provider_id = %self.provider_id,
            loaded = state.loaded.len(),
            used_vram_mb = state.used_vram_mb(),
            "Ollama state refreshed"
        );
    }

    /// VRAM budget minus resident models
    #[must_use]
    pub fn available_vram_mb(&self) -> u64 {
        let state = self.state.read();
        self.config.total_vram_mb.saturating_sub(state.used_vram_mb())
    }

    /// When the last successful poll happened
    #[must_use]
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_refresh
    }

    /// Poll on the configured cadence until the handle is aborted
    pub fn run_refresh_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.refresh_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.refresh_data().await;
            }
        })
    }

    fn metrics(&self, state: &OllamaState, model_id: &str) -> (bool, ProviderMetrics) {
        let resident = state.resolve(model_id).and_then(|k| state.loaded.get(&k).cloned());
        let mut loaded_models: Vec<String> = state.loaded.keys().cloned().collect();
        loaded_models.sort();

        let metrics = ProviderMetrics::Ollama {
            total_vram_mb: self.config.total_vram_mb,
            available_vram_mb: self.config.total_vram_mb.saturating_sub(state.used_vram_mb()),
            model_vram_mb: resident.as_ref().map_or(0, |m| m.vram_mb),
            loaded_models,
            expires_at: resident.as_ref().and_then(|m| m.expires_at),
        };
        (resident.is_some(), metrics)
    }
}

impl SchedulingDataInterface for OllamaSdi {
    fn name(&self) -> &str {
        "ollama"
    }

    fn get_model_status(&self, model_id: &str) -> ModelStatus {
        let (is_loaded, metrics) = {
            let state = self.state.read();
            self.metrics(&state, model_id)
        };
        ModelStatus {
            is_loaded,
            queue_state: self
                .queue
                .as_ref()
                .map(|q| q.get_state(model_id, &self.provider_id)),
            metrics,
        }
    }

    fn get_capacity_info(&self, provider_id: &str, deployment: &str) -> CapacityInfo {
        if provider_id != self.provider_id {
            tracing::debug!(
                provider_id,
                facade = %self.provider_id,
                "Capacity requested for a provider this facade does not poll"
            );
        }
        let state = self.state.read();
        let (is_loaded, metrics) = self.metrics(&state, deployment);
        let available = self.config.total_vram_mb.saturating_sub(state.used_vram_mb());
        let needed = state.known_vram(deployment).unwrap_or(0).max(1);

        CapacityInfo {
            has_capacity: is_loaded || available >= needed,
            metrics,
        }
    }
}
