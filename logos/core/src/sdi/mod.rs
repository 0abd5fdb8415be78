//! Scheduling Data Interface
//!
//! Facades that turn provider-specific telemetry into the two views the
//! scheduler understands:
//!
//! - [`ModelStatus`]: is the model warm, and how much work is queued for it
//! - [`CapacityInfo`]: can the provider take another request right now
//!
//! # Update Paths
//!
//! ```text
//!   Azure response headers ──push──> AzureSdi  ─┐
//!                                               ├──> SdiRegistry ──> PriorityScheduler
//!   GET /api/ps (own cadence) ──pull──> OllamaSdi ┘
//! ```
//!
//! Reads never touch the network. A facade whose telemetry source is down
//! keeps serving its last-known state.

mod azure;
mod ollama;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::scheduling::queue::QueueStatePerPriority;

pub use azure::{AzureConfig, AzureSdi, HEADER_REMAINING_REQUESTS, HEADER_REMAINING_TOKENS};
pub use ollama::{OllamaConfig, OllamaSdi, RefreshOutcome};

/// Provider-specific telemetry attached to a status or capacity snapshot
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderMetrics {
    /// Rate-limit counters from Azure OpenAI response headers
    Azure {
        /// Last `x-ratelimit-remaining-requests` value seen
        remaining_requests: Option<u64>,
        /// Last `x-ratelimit-remaining-tokens` value seen
        remaining_tokens: Option<u64>,
        /// When the counters were last updated
        last_updated: Option<DateTime<Utc>>,
    },
    /// VRAM accounting from Ollama's loaded-model listing
    Ollama {
        /// Configured VRAM budget
        total_vram_mb: u64,
        /// Budget minus VRAM held by loaded models
        available_vram_mb: u64,
        /// VRAM held by the model in question (0 when cold)
        model_vram_mb: u64,
        /// Names of currently loaded models
        loaded_models: Vec<String>,
        /// When Ollama will unload the model
        expires_at: Option<DateTime<FixedOffset>>,
    },
    /// No telemetry available
    Unknown,
}

/// Live view of one model
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelStatus {
    /// Whether the model is resident (always true for cloud deployments)
    pub is_loaded: bool,
    /// Queued work for the model, by tier
    pub queue_state: Option<QueueStatePerPriority>,
    /// Provider telemetry
    pub metrics: ProviderMetrics,
}

/// Whether a provider deployment can take more work
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CapacityInfo {
    /// Admission signal
    pub has_capacity: bool,
    /// Provider telemetry behind the signal
    pub metrics: ProviderMetrics,
}

/// Unified capacity view over one kind of provider
///
/// Implementations must answer from memory; they are called from inside the
/// scheduling loop while its lock is held.
pub trait SchedulingDataInterface: Send + Sync {
    /// Short name for logs (e.g. "azure")
    fn name(&self) -> &str;

    /// Status of a model served through this facade
    fn get_model_status(&self, model_id: &str) -> ModelStatus;

    /// Capacity of a deployment (Azure deployment name or Ollama model name)
    fn get_capacity_info(&self, provider_id: &str, deployment: &str) -> CapacityInfo;

    /// Deployment serving a model; the model id unless the facade maps it
    fn deployment_for(&self, model_id: &str) -> String {
        model_id.to_string()
    }
}

/// Provider id to facade lookup
#[derive(Default)]
pub struct SdiRegistry {
    facades: RwLock<HashMap<String, Arc<dyn SchedulingDataInterface>>>,
}

impl SdiRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a provider's telemetry through a facade
    pub fn register(&self, provider_id: impl Into<String>, facade: Arc<dyn SchedulingDataInterface>) {
        let provider_id = provider_id.into();
        tracing::debug!(provider_id = %provider_id, facade = facade.name(), "Registered SDI facade");
        self.facades.write().insert(provider_id, facade);
    }

    /// Drop a provider's facade
    pub fn unregister(&self, provider_id: &str) -> bool {
        self.facades.write().remove(provider_id).is_some()
    }

    /// Facade for a provider
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn SchedulingDataInterface>> {
        self.facades.read().get(provider_id).cloned()
    }

    /// Model status as reported by the provider's facade
    #[must_use]
    pub fn model_status(&self, model_id: &str, provider_id: &str) -> Option<ModelStatus> {
        self.get(provider_id).map(|f| f.get_model_status(model_id))
    }

    /// Capacity as reported by the provider's facade
    #[must_use]
    pub fn capacity(&self, provider_id: &str, deployment: &str) -> Option<CapacityInfo> {
        self.get(provider_id)
            .map(|f| f.get_capacity_info(provider_id, deployment))
    }

    /// Whether a provider can take another request for a model
    ///
    /// Providers without a facade are not gated.
    #[must_use]
    pub fn has_capacity(&self, model_id: &str, provider_id: &str) -> bool {
        let Some(facade) = self.get(provider_id) else {
            return true;
        };
        let deployment = facade.deployment_for(model_id);
        let info = facade.get_capacity_info(provider_id, &deployment);
        if !info.has_capacity {
            tracing::debug!(model_id, provider_id, deployment = %deployment, "Provider reports no capacity");
        }
        info.has_capacity
    }

    /// Registered provider ids
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        self.facades.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for SdiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdiRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
