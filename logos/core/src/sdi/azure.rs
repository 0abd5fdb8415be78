//! Azure OpenAI capacity facade
//!
//! Azure reports its remaining quota on every response. The proxy path hands
//! those headers to [`AzureSdi::update_from_headers`]; the scheduler only ever
//! reads the cached counters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use super::{CapacityInfo, ModelStatus, ProviderMetrics, SchedulingDataInterface};
use crate::scheduling::queue::PriorityQueueManager;

/// Remaining-requests header
pub const HEADER_REMAINING_REQUESTS: &str = "x-ratelimit-remaining-requests";
/// Remaining-tokens header
pub const HEADER_REMAINING_TOKENS: &str = "x-ratelimit-remaining-tokens";

/// Azure facade configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// At or below this many remaining requests/tokens the deployment is full
    pub capacity_threshold: u64,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            capacity_threshold: 10,
        }
    }
}

impl AzureConfig {
    /// Set the capacity threshold
    #[must_use]
    pub fn with_capacity_threshold(mut self, threshold: u64) -> Self {
        self.capacity_threshold = threshold;
        self
    }
}

#[derive(Clone, Debug)]
struct RateLimitState {
    remaining_requests: Option<u64>,
    remaining_tokens: Option<u64>,
    has_capacity: bool,
    updated_at: DateTime<Utc>,
}

/// Where a model is deployed
#[derive(Clone, Debug)]
struct Deployment {
    provider_id: String,
    deployment: String,
}

/// Capacity facade for Azure OpenAI deployments
pub struct AzureSdi {
    config: AzureConfig,
    queue: Option<Arc<PriorityQueueManager>>,
    /// model id -> deployment
    deployments: RwLock<HashMap<String, Deployment>>,
    /// (provider, deployment) -> counters
    limits: RwLock<HashMap<(String, String), RateLimitState>>,
}

impl AzureSdi {
    /// Create a facade
    #[must_use]
    pub fn new(config: AzureConfig) -> Self {
        Self {
            config,
            queue: None,
            deployments: RwLock::new(HashMap::new()),
            limits: RwLock::new(HashMap::new()),
        }
    }

    /// Surface queue depth from this queue manager in model status
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<PriorityQueueManager>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Record which deployment serves a model
    pub fn register_deployment(
        &self,
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        deployment: impl Into<String>,
    ) {
        self.deployments.write().insert(
            model_id.into(),
            Deployment {
                provider_id: provider_id.into(),
                deployment: deployment.into(),
            },
        );
    }

    /// Update counters from a provider response
    ///
    /// Missing or unparsable headers leave the previous value in place.
    pub fn update_from_headers(&self, provider_id: &str, deployment: &str, headers: &HeaderMap) {
        let read = |name: &str| -> Option<u64> {
            let raw = headers.get(name)?.to_str().ok()?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::debug!(header = name, value = raw, "Ignoring unparsable rate-limit header");
                    None
                }
            }
        };

        let requests = read(HEADER_REMAINING_REQUESTS);
        let tokens = read(HEADER_REMAINING_TOKENS);
        if requests.is_none() && tokens.is_none() {
            return;
        }
        self.update_rate_limits(provider_id, deployment, requests, tokens);
    }

    /// Update counters directly
    pub fn update_rate_limits(
        &self,
        provider_id: &str,
        deployment: &str,
        remaining_requests: Option<u64>,
        remaining_tokens: Option<u64>,
    ) {
        let threshold = self.config.capacity_threshold;
        let mut limits = self.limits.write();
        let key = (provider_id.to_string(), deployment.to_string());
        let previous = limits.get(&key).cloned();

        let remaining_requests =
            remaining_requests.or_else(|| previous.as_ref().and_then(|p| p.remaining_requests));
        let remaining_tokens =
            remaining_tokens.or_else(|| previous.as_ref().and_then(|p| p.remaining_tokens));

        let exhausted = remaining_requests.is_some_and(|r| r <= threshold)
            || remaining_tokens.is_some_and(|t| t <= threshold);
        let has_capacity = !exhausted;

        if let Some(prev) = &previous {
            if prev.has_capacity != has_capacity {
                tracing::info!(
                    provider_id,
                    deployment,
                    has_capacity,
                    ?remaining_requests,
                    ?remaining_tokens,
                    "Azure capacity changed"
                );
            }
        }

        limits.insert(
            key,
            RateLimitState {
                remaining_requests,
                remaining_tokens,
                has_capacity,
                updated_at: Utc::now(),
            },
        );
    }

    fn metrics_for(&self, provider_id: &str, deployment: &str) -> (bool, ProviderMetrics) {
        let limits = self.limits.read();
        match limits.get(&(provider_id.to_string(), deployment.to_string())) {
            Some(state) => (
                state.has_capacity,
                ProviderMetrics::Azure {
                    remaining_requests: state.remaining_requests,
                    remaining_tokens: state.remaining_tokens,
                    last_updated: Some(state.updated_at),
                },
            ),
            // Nothing observed yet: assume the deployment can take work
            None => (
                true,
                ProviderMetrics::Azure {
                    remaining_requests: None,
                    remaining_tokens: None,
                    last_updated: None,
                },
            ),
        }
    }
}

impl SchedulingDataInterface for AzureSdi {
    fn name(&self) -> &str {
        "azure"
    }

    fn get_model_status(&self, model_id: &str) -> ModelStatus {
        let deployment = self.deployments.read().get(model_id).cloned();

        let queue_state = self.queue.as_ref().map(|q| match &deployment {
            Some(d) => q.get_state(model_id, &d.provider_id),
            None => q.get_model_state(model_id),
        });
        let metrics = match &deployment {
            Some(d) => self.metrics_for(&d.provider_id, &d.deployment).1,
            None => ProviderMetrics::Unknown,
        };

        ModelStatus {
            is_loaded: true,
            queue_state,
            metrics,
        }
    }

    fn get_capacity_info(&self, provider_id: &str, deployment: &str) -> CapacityInfo {
        let (has_capacity, metrics) = self.metrics_for(provider_id, deployment);
        CapacityInfo {
            has_capacity,
            metrics,
        }
    }

    fn deployment_for(&self, model_id: &str) -> String {
        self.deployments
            .read()
            .get(model_id)
            .map_or_else(|| model_id.to_string(), |d| d.deployment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::priority::Priority;
    use crate::scheduling::task::{Task, Ticket};
    use reqwest::header::HeaderValue;

    fn headers(requests: &str, tokens: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(HEADER_REMAINING_REQUESTS, HeaderValue::from_str(requests).unwrap());
        map.insert(HEADER_REMAINING_TOKENS, HeaderValue::from_str(tokens).unwrap());
        map
    }

    #[test]
    fn test_optimistic_before_observation() {
        let sdi = AzureSdi::new(AzureConfig::default());
        let info = sdi.get_capacity_info("azure-eu", "gpt-4o");
        assert!(info.has_capacity);
        assert!(matches!(
            info.metrics,
            ProviderMetrics::Azure { remaining_requests: None, remaining_tokens: None, .. }
        ));
    }

    #[test]
    fn test_capacity_flips_at_threshold() {
        let sdi = AzureSdi::new(AzureConfig::default());

        sdi.update_from_headers("azure-eu", "gpt-4o", &headers("11", "5000"));
        assert!(sdi.get_capacity_info("azure-eu", "gpt-4o").has_capacity);

        sdi.update_from_headers("azure-eu", "gpt-4o", &headers("10", "5000"));
        assert!(!sdi.get_capacity_info("azure-eu", "gpt-4o").has_capacity);

        sdi.update_from_headers("azure-eu", "gpt-4o", &headers("300", "3"));
        assert!(!sdi.get_capacity_info("azure-eu", "gpt-4o").has_capacity);

        sdi.update_from_headers("azure-eu", "gpt-4o", &headers("300", "12000"));
        assert!(sdi.get_capacity_info("azure-eu", "gpt-4o").has_capacity);
    }

    #[test]
    fn test_deployments_tracked_separately() {
        let sdi = AzureSdi::new(AzureConfig::default().with_capacity_threshold(100));
        sdi.update_rate_limits("azure-eu", "gpt-4o", Some(50), None);
        sdi.update_rate_limits("azure-eu", "gpt-4o-mini", Some(500), None);
        sdi.update_rate_limits("azure-us", "gpt-4o", Some(500), None);

        assert!(!sdi.get_capacity_info("azure-eu", "gpt-4o").has_capacity);
        assert!(sdi.get_capacity_info("azure-eu", "gpt-4o-mini").has_capacity);
        assert!(sdi.get_capacity_info("azure-us", "gpt-4o").has_capacity);
    }

    #[test]
    fn test_partial_headers_keep_previous_value() {
        let sdi = AzureSdi::new(AzureConfig::default());
        sdi.update_from_headers("azure-eu", "gpt-4o", &headers("5", "9000"));

        let mut only_tokens = HeaderMap::new();
        only_tokens.insert(HEADER_REMAINING_TOKENS, HeaderValue::from_static("8000"));
        sdi.update_from_headers("azure-eu", "gpt-4o", &only_tokens);

        let info = sdi.get_capacity_info("azure-eu", "gpt-4o");
        assert!(!info.has_capacity);
        assert!(matches!(
            info.metrics,
            ProviderMetrics::Azure { remaining_requests: Some(5), remaining_tokens: Some(8000), .. }
        ));

        let mut garbage = HeaderMap::new();
        garbage.insert(HEADER_REMAINING_REQUESTS, HeaderValue::from_static("lots"));
        sdi.update_from_headers("azure-eu", "gpt-4o", &garbage);
        assert!(!sdi.get_capacity_info("azure-eu", "gpt-4o").has_capacity);
    }

    #[test]
    fn test_deployment_for_registered_model() {
        let sdi = AzureSdi::new(AzureConfig::default());
        sdi.register_deployment("gpt-4o", "azure-eu", "gpt-4o-prod");
        assert_eq!(sdi.deployment_for("gpt-4o"), "gpt-4o-prod");
        assert_eq!(sdi.deployment_for("gpt-4o-mini"), "gpt-4o-mini");
    }

    #[test]
    fn test_model_status_includes_queue_state() {
        let queue = Arc::new(PriorityQueueManager::new());
        let task = Arc::new(Task::new(Ticket(1), serde_json::Value::Null, Vec::new()));
        queue.enqueue(Arc::clone(&task), "gpt-4o", "azure-eu", Priority::High);
        queue.enqueue(task, "gpt-4o", "azure-eu", Priority::Low);

        let sdi = AzureSdi::new(AzureConfig::default()).with_queue(queue);
        sdi.register_deployment("gpt-4o", "azure-eu", "gpt-4o-prod");
        sdi.update_rate_limits("azure-eu", "gpt-4o-prod", Some(99), Some(10_000));

        let status = sdi.get_model_status("gpt-4o");
        assert!(status.is_loaded);
        let state = status.queue_state.unwrap();
        assert_eq!((state.high, state.low, state.total()), (1, 1, 2));
        assert!(matches!(
            status.metrics,
            ProviderMetrics::Azure { remaining_requests: Some(99), .. }
        ));
    }
}
