//! Temp Provider Registry
//!
//! Self-registered OpenAI-compatible endpoints. They come and go with the
//! processes that host them, so the registry is keyed by a generated id and
//! can drop everything an owner process registered at once.
//!
//! With a classifier attached, a provider's models join the catalog on
//! registration (as `LOCAL`) and leave it on deregistration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use super::discovery::ModelDiscovery;
use crate::classification::{ModelDescriptor, PolicyClassifier, PrivacyTier};
use crate::monitoring::{MonitoringRecorder, ProviderAction};

/// What a provider supplies when it registers
#[derive(Clone, Default)]
pub struct ProviderRegistration {
    /// Base URL
    pub url: String,
    /// Display name
    pub name: String,
    /// Bearer token for probes and requests
    pub auth_key: Option<String>,
    /// Process hosting the provider
    pub owner_process_id: Option<u32>,
    /// Models served; [`ProviderRegistry::register_discovered`] fills an
    /// empty list from the provider itself
    pub models: Vec<String>,
}

impl ProviderRegistration {
    /// Registration for a URL
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Attach a bearer token
    #[must_use]
    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    /// Record the owning process
    #[must_use]
    pub fn with_owner(mut self, pid: u32) -> Self {
        self.owner_process_id = Some(pid);
        self
    }

    /// Declare served models
    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }
}

/// A registered ephemeral provider
#[derive(Clone)]
pub struct TempProvider {
    /// Registry id
    pub id: String,
    /// Base URL
    pub url: String,
    /// Display name
    pub name: String,
    /// Bearer token
    pub auth_key: Option<String>,
    /// Process hosting the provider
    pub owner_process_id: Option<u32>,
    /// Models served
    pub models: Vec<String>,
    /// Result of the latest probe
    pub is_healthy: bool,
    /// Start of the current unhealthy streak
    pub unhealthy_since: Option<Instant>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Latest probe time
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for TempProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempProvider")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("name", &self.name)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("owner_process_id", &self.owner_process_id)
            .field("models", &self.models)
            .field("is_healthy", &self.is_healthy)
            .field("unhealthy_since", &self.unhealthy_since)
            .finish()
    }
}

/// Concurrent registry of temp providers
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, TempProvider>,
    monitor: MonitoringRecorder,
    classifier: Option<Arc<PolicyClassifier>>,
}

impl ProviderRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry reporting changes to `monitor`
    #[must_use]
    pub fn with_monitor(monitor: MonitoringRecorder) -> Self {
        Self {
            monitor,
            ..Self::default()
        }
    }

    /// Keep this classifier's catalog in step with registered models
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<PolicyClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    fn catalog_add(&self, provider_id: &str, models: &[String]) {
        let Some(classifier) = &self.classifier else {
            return;
        };
        for model_id in models {
            classifier.register_model(ModelDescriptor::new(model_id.as_str(), provider_id, PrivacyTier::Local));
        }
    }

    fn catalog_remove(&self, provider_id: &str) {
        if let Some(classifier) = &self.classifier {
            let removed = classifier.remove_provider(provider_id);
            tracing::debug!(provider_id, removed, "Dropped temp provider models from catalog");
        }
    }

    /// Add a provider; it starts out healthy
    pub fn register(&self, registration: ProviderRegistration) -> TempProvider {
        let provider = TempProvider {
            id: uuid::Uuid::new_v4().to_string(),
            url: registration.url,
            name: registration.name,
            auth_key: registration.auth_key,
            owner_process_id: registration.owner_process_id,
            models: registration.models,
            is_healthy: true,
            unhealthy_since: None,
            registered_at: Utc::now(),
            last_probe_at: None,
        };

        tracing::info!(
            provider_id = %provider.id,
            name = %provider.name,
            url = %provider.url,
            models = provider.models.len(),
            "Temp provider registered"
        );
        self.monitor.record_provider(&provider.id, ProviderAction::Registered);
        self.providers.insert(provider.id.clone(), provider.clone());
        self.catalog_add(&provider.id, &provider.models);
        provider
    }

    /// Register, asking the provider for its models when none were declared
    ///
    /// A failed discovery registers the provider with no models.
    pub async fn register_discovered(
        &self,
        mut registration: ProviderRegistration,
        discovery: &ModelDiscovery,
    ) -> TempProvider {
        if registration.models.is_empty() {
            match discovery
                .discover(&registration.url, registration.auth_key.as_deref())
                .await
            {
                Ok(models) => registration.models = models,
                Err(e) => tracing::warn!(
                    url = %registration.url,
                    error = %e,
                    "Model discovery failed; registering without models"
                ),
            }
        }
        self.register(registration)
    }

    /// Remove a provider
    pub fn deregister(&self, provider_id: &str) -> Option<TempProvider> {
        let (_, provider) = self.providers.remove(provider_id)?;
        self.catalog_remove(provider_id);
        tracing::info!(provider_id, name = %provider.name, "Temp provider deregistered");
        self.monitor.record_provider(provider_id, ProviderAction::Deregistered);
        Some(provider)
    }

    /// Remove every provider registered by a process
    pub fn deregister_owner(&self, owner_process_id: u32) -> Vec<TempProvider> {
        let ids: Vec<String> = self
            .providers
            .iter()
            .filter(|p| p.owner_process_id == Some(owner_process_id))
            .map(|p| p.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.deregister(id)).collect()
    }

    /// Look up a provider
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<TempProvider> {
        self.providers.get(provider_id).map(|p| p.clone())
    }

    /// All providers, oldest registration first
    #[must_use]
    pub fn list(&self) -> Vec<TempProvider> {
        let mut all: Vec<TempProvider> = self.providers.iter().map(|p| p.clone()).collect();
        all.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Providers whose latest probe succeeded
    #[must_use]
    pub fn healthy_providers(&self) -> Vec<TempProvider> {
        self.list().into_iter().filter(|p| p.is_healthy).collect()
    }

    /// Replace a provider's model list
    pub fn set_models(&self, provider_id: &str, models: Vec<String>) -> bool {
        let Some(models) = self.update(provider_id, |p| {
            p.models = models;
            p.models.clone()
        }) else {
            return false;
        };
        self.catalog_remove(provider_id);
        self.catalog_add(provider_id, &models);
        true
    }

    /// Mutate one provider in place
    pub(crate) fn update<R>(&self, provider_id: &str, f: impl FnOnce(&mut TempProvider) -> R) -> Option<R> {
        self.providers.get_mut(provider_id).map(|mut p| f(&mut p))
    }

    /// Number of providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::ClassifierConfig;
    use crate::monitoring::MonitoringEvent;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_register_and_lookup() {
        let registry = ProviderRegistry::new();
        let p = registry.register(
            ProviderRegistration::new("lmstudio", "http://127.0.0.1:1234/")
                .with_models(vec!["qwen2".into()]),
        );

        assert_eq!(p.url, "http://127.0.0.1:1234");
        assert!(p.is_healthy);
        assert_eq!(registry.get(&p.id).map(|p| p.models), Some(vec!["qwen2".to_string()]));
        assert_eq!(registry.healthy_providers().len(), 1);
    }

    #[test]
    fn test_deregister_owner() {
        let (monitor, mut rx) = MonitoringRecorder::channel();
        let registry = ProviderRegistry::with_monitor(monitor);
        registry.register(ProviderRegistration::new("a", "http://a").with_owner(42));
        registry.register(ProviderRegistration::new("b", "http://b").with_owner(42));
        let keep = registry.register(ProviderRegistration::new("c", "http://c").with_owner(7));

        let removed = registry.deregister_owner(42);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&keep.id).is_some());

        let deregistered = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, MonitoringEvent::Provider { action: ProviderAction::Deregistered, .. }))
            .count();
        assert_eq!(deregistered, 2);
    }

    #[test]
    fn test_debug_redacts_key() {
        let registry = ProviderRegistry::new();
        let p = registry.register(ProviderRegistration::new("a", "http://a").with_auth_key("sk-secret"));
        let rendered = format!("{p:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("redacted"));
    }

    fn classifier() -> Arc<PolicyClassifier> {
        let catalog = [ModelDescriptor::new("llama3", "ollama-local", PrivacyTier::Local)]
            .into_iter()
            .collect();
        Arc::new(PolicyClassifier::new(catalog, ClassifierConfig::default()))
    }

    #[test]
    fn test_models_follow_registration() {
        let classifier = classifier();
        let registry = ProviderRegistry::new().with_classifier(Arc::clone(&classifier));
        let p = registry.register(
            ProviderRegistration::new("lmstudio", "http://127.0.0.1:1234")
                .with_models(vec!["qwen2".into(), "llama3".into()]),
        );

        let catalog = classifier.catalog();
        assert_eq!(catalog.get("qwen2").map(|m| m.provider_id.as_str()), Some(p.id.as_str()));
        assert_eq!(catalog.get("llama3").map(|m| m.provider_id.as_str()), Some("ollama-local"));

        assert!(registry.set_models(&p.id, vec!["phi3".into()]));
        assert!(!classifier.catalog().contains("qwen2"));
        assert!(classifier.catalog().contains("phi3"));

        registry.deregister(&p.id);
        assert!(!classifier.catalog().contains("phi3"));
        assert!(classifier.catalog().contains("llama3"));
    }

    #[tokio::test]
    async fn test_register_discovers_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "qwen2-7b"}]
            })))
            .mount(&server)
            .await;

        let classifier = classifier();
        let registry = ProviderRegistry::new().with_classifier(Arc::clone(&classifier));
        let discovery = ModelDiscovery::default();

        let p = registry
            .register_discovered(ProviderRegistration::new("lmstudio", server.uri()), &discovery)
            .await;
        assert_eq!(p.models, vec!["qwen2-7b"]);
        assert!(classifier.catalog().contains("qwen2-7b"));

        let declared = registry
            .register_discovered(
                ProviderRegistration::new("declared", server.uri()).with_models(vec!["phi3".into()]),
                &discovery,
            )
            .await;
        assert_eq!(declared.models, vec!["phi3"]);

        let offline = registry
            .register_discovered(ProviderRegistration::new("offline", "http://127.0.0.1:9"), &discovery)
            .await;
        assert!(offline.models.is_empty());
        assert!(registry.get(&offline.id).is_some());
    }

    #[test]
    fn test_deregister_unknown() {
        let registry = ProviderRegistry::new();
        assert!(registry.deregister("missing").is_none());
        assert!(!registry.set_models("missing", Vec::new()));
    }
}
