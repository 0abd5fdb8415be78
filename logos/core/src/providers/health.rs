//! Temp Provider Health Monitor
//!
//! Probes every registered temp provider on a fixed cadence and removes the
//! ones that stay unreachable.
//!
//! # Probe
//!
//! ```text
//! GET {url}/v1/models ──<500──> reachable
//!        │ >=500 / error / timeout
//!        v
//! GET {url}/api/tags  ──<500──> reachable
//!        │ >=500 / error / timeout
//!        v
//!   unreachable: stamp unhealthy_since (first failure only)
//!                remove once unhealthy longer than auto_remove_after
//! ```
//!
//! Removal deregisters the provider (which also drops its catalog models)
//! and withdraws its queued work from the scheduling manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::registry::{ProviderRegistry, TempProvider};
use crate::monitoring::{MonitoringRecorder, ProviderAction};
use crate::scheduling::{SchedulingManager, Ticket};

/// Endpoints tried in order
pub const PROBE_PATHS: [&str; 2] = ["/v1/models", "/api/tags"];

/// Health monitor configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between probe rounds
    pub interval_secs: u64,
    /// Per-endpoint probe timeout
    pub probe_timeout_secs: u64,
    /// Unhealthy streak after which a provider is removed
    pub auto_remove_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_secs: 5,
            auto_remove_after_secs: 300,
        }
    }
}

impl HealthConfig {
    /// Set the probe cadence
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs().max(1);
        self
    }

    /// Set the removal threshold
    #[must_use]
    pub fn with_auto_remove_after(mut self, after: Duration) -> Self {
        self.auto_remove_after_secs = after.as_secs();
        self
    }

    /// Probe cadence
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Per-endpoint timeout
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Removal threshold
    #[must_use]
    pub fn auto_remove_after(&self) -> Duration {
        Duration::from_secs(self.auto_remove_after_secs)
    }
}

/// Result of probing one provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Some endpoint answered below 500
    Reachable {
        /// Endpoint that answered
        endpoint: &'static str,
        /// Its status
        status: u16,
    },
    /// Every endpoint failed
    Unreachable {
        /// Last failure seen
        reason: String,
    },
}

/// How a provider is checked
#[async_trait]
pub trait ProviderProbe: Send + Sync {
    /// Probe one provider
    async fn probe(&self, provider: &TempProvider) -> ProbeOutcome;
}

/// Probe over HTTP
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    /// Probe with a per-endpoint timeout
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ProviderProbe for HttpProbe {
    async fn probe(&self, provider: &TempProvider) -> ProbeOutcome {
        let mut reason = String::from("no endpoint tried");

        for endpoint in PROBE_PATHS {
            let url = format!("{}{endpoint}", provider.url);
            let mut request = self.client.get(&url).timeout(self.timeout);
            if let Some(key) = &provider.auth_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) if response.status().as_u16() < 500 => {
                    let status = response.status();
                    if status.is_client_error() {
                        tracing::warn!(
                            provider_id = %provider.id,
                            url = %url,
                            status = status.as_u16(),
                            "Provider reachable but rejected the probe; check its auth key"
                        );
                    }
                    return ProbeOutcome::Reachable {
                        endpoint,
                        status: status.as_u16(),
                    };
                }
                Ok(response) => reason = format!("{url} returned {}", response.status()),
                Err(e) => reason = format!("{url}: {e}"),
            }
        }

        ProbeOutcome::Unreachable { reason }
    }
}

/// What one probe round did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Providers probed
    pub probed: usize,
    /// Providers reachable this round
    pub healthy: usize,
    /// Providers unreachable this round
    pub unhealthy: usize,
    /// Providers removed this round
    pub removed: Vec<String>,
    /// Requests failed because every provider they could use was removed
    pub failed_tickets: Vec<Ticket>,
}

/// Periodic prober for the temp provider registry
pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    probe: Arc<dyn ProviderProbe>,
    config: HealthConfig,
    monitor: MonitoringRecorder,
    manager: Option<Arc<SchedulingManager>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Monitor probing over HTTP
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, config: HealthConfig) -> Self {
        let probe = Arc::new(HttpProbe::new(config.probe_timeout()));
        Self::with_probe(registry, config, probe)
    }

    /// Monitor with a custom probe
    #[must_use]
    pub fn with_probe(registry: Arc<ProviderRegistry>, config: HealthConfig, probe: Arc<dyn ProviderProbe>) -> Self {
        Self {
            registry,
            probe,
            config,
            monitor: MonitoringRecorder::disabled(),
            manager: None,
            task: Mutex::new(None),
        }
    }

    /// Report health transitions
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitoringRecorder) -> Self {
        self.monitor = monitor;
        self
    }

    /// Withdraw removed providers' queued work from this manager
    #[must_use]
    pub fn with_manager(mut self, manager: Arc<SchedulingManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Probe every provider once
    pub async fn run_once(&self) -> HealthReport {
        let providers = self.registry.list();
        let outcomes = join_all(providers.iter().map(|p| async move {
            (p.id.clone(), self.probe.probe(p).await)
        }))
        .await;

        let now = Instant::now();
        let mut report = HealthReport {
            probed: outcomes.len(),
            ..HealthReport::default()
        };

        for (provider_id, outcome) in outcomes {
            match outcome {
                ProbeOutcome::Reachable { .. } => {
                    report.healthy += 1;
                    let recovered = self.registry.update(&provider_id, |p| {
                        let recovered = !p.is_healthy;
                        p.is_healthy = true;
                        p.unhealthy_since = None;
                        p.last_probe_at = Some(Utc::now());
                        recovered
                    });
                    if recovered == Some(true) {
                        tracing::info!(provider_id = %provider_id, "Temp provider recovered");
                        self.monitor.record_provider(&provider_id, ProviderAction::Recovered);
                    }
                }
                ProbeOutcome::Unreachable { reason } => {
                    report.unhealthy += 1;
                    let Some((newly_unhealthy, since)) = self.registry.update(&provider_id, |p| {
                        let newly_unhealthy = p.is_healthy;
                        p.is_healthy = false;
                        p.last_probe_at = Some(Utc::now());
                        (newly_unhealthy, *p.unhealthy_since.get_or_insert(now))
                    }) else {
                        continue;
                    };

                    if newly_unhealthy {
                        tracing::warn!(provider_id = %provider_id, reason = %reason, "Temp provider unhealthy");
                        self.monitor.record_provider(&provider_id, ProviderAction::Unhealthy);
                    }

                    let down_for = now.saturating_duration_since(since);
                    if down_for > self.config.auto_remove_after() {
                        tracing::warn!(
                            provider_id = %provider_id,
                            down_secs = down_for.as_secs(),
                            "Removing temp provider after sustained failures"
                        );
                        if self.registry.deregister(&provider_id).is_some() {
                            if let Some(manager) = &self.manager {
                                report.failed_tickets.extend(manager.withdraw_provider(&provider_id));
                            }
                            report.removed.push(provider_id);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            probed = report.probed,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            removed = report.removed.len(),
            "Health round finished"
        );
        report
    }

    /// Start the probe loop; no-op while it is running
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.run_once().await;
            }
        }));
        tracing::info!(interval_secs = self.config.interval().as_secs(), "Health monitor started");
    }

    /// Whether the probe loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the probe loop and wait for it to end
    pub async fn stop(&self) {
        let Some(handle) = self.task.lock().take() else {
            return;
        };
        handle.abort();
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Health monitor task failed");
            }
        }
        tracing::info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::{ClassifierConfig, ModelCatalog, ModelDescriptor, PolicyClassifier, PrivacyTier};
    use crate::providers::registry::ProviderRegistration;
    use crate::scheduling::{Candidate, ManagerConfig, Priority, PriorityQueueManager, PriorityScheduler, TaskStatus};
    use std::collections::HashSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fails every provider whose URL is in the set
    #[derive(Default)]
    struct ScriptedProbe {
        down: Mutex<HashSet<String>>,
    }

    impl ScriptedProbe {
        fn set_down(&self, url: &str, down: bool) {
            let mut set = self.down.lock();
            if down {
                set.insert(url.to_string());
            } else {
                set.remove(url);
            }
        }
    }

    #[async_trait]
    impl ProviderProbe for ScriptedProbe {
        async fn probe(&self, provider: &TempProvider) -> ProbeOutcome {
            if self.down.lock().contains(&provider.url) {
                ProbeOutcome::Unreachable {
                    reason: "connection refused".into(),
                }
            } else {
                ProbeOutcome::Reachable {
                    endpoint: PROBE_PATHS[0],
                    status: 200,
                }
            }
        }
    }

    fn setup() -> (Arc<ProviderRegistry>, Arc<ScriptedProbe>, HealthMonitor) {
        let registry = Arc::new(ProviderRegistry::new());
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::with_probe(Arc::clone(&registry), HealthConfig::default(), probe.clone());
        (registry, probe, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_probe_flips_to_unhealthy() {
        let (registry, probe, monitor) = setup();
        let p = registry.register(ProviderRegistration::new("flaky", "http://flaky"));
        probe.set_down("http://flaky", true);

        let report = monitor.run_once().await;
        assert_eq!((report.probed, report.unhealthy), (1, 1));

        let state = registry.get(&p.id).unwrap();
        assert!(!state.is_healthy);
        let first_since = state.unhealthy_since.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        monitor.run_once().await;
        assert_eq!(registry.get(&p.id).unwrap().unhealthy_since, Some(first_since));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_after_sustained_failure() {
        let catalog: ModelCatalog = [ModelDescriptor::new("qwen2", "placeholder", PrivacyTier::Local)]
            .into_iter()
            .collect();
        let classifier = Arc::new(PolicyClassifier::new(catalog, ClassifierConfig::default()));
        let registry = Arc::new(ProviderRegistry::new().with_classifier(Arc::clone(&classifier)));
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::with_probe(Arc::clone(&registry), HealthConfig::default(), probe.clone());

        let p = registry.register(ProviderRegistration::new("gone", "http://gone").with_models(vec!["phi3".into()]));
        assert!(classifier.catalog().contains("phi3"));
        probe.set_down("http://gone", true);

        monitor.run_once().await;
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(monitor.run_once().await.removed.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = monitor.run_once().await;
        assert_eq!(report.removed, vec![p.id.clone()]);
        assert!(registry.get(&p.id).is_none());
        assert!(!classifier.catalog().contains("phi3"));
        assert!(classifier.catalog().contains("qwen2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_withdraws_queued_work() {
        let registry = Arc::new(ProviderRegistry::new());
        let probe = Arc::new(ScriptedProbe::default());
        let queue = Arc::new(PriorityQueueManager::new());
        let manager = Arc::new(SchedulingManager::new(
            Arc::new(PriorityScheduler::new(Arc::clone(&queue))),
            ManagerConfig::default(),
        ));
        let config = HealthConfig::default().with_auto_remove_after(Duration::from_secs(10));
        let monitor = HealthMonitor::with_probe(Arc::clone(&registry), config, probe.clone())
            .with_manager(Arc::clone(&manager));

        let p = registry.register(ProviderRegistration::new("gone", "http://gone"));
        let stranded = manager
            .add_request(serde_json::Value::Null, vec![Candidate::new("phi3", p.id.clone(), 1.0, Priority::High)])
            .unwrap();
        let rerouted = manager
            .add_request(
                serde_json::Value::Null,
                vec![
                    Candidate::new("phi3", p.id.clone(), 2.0, Priority::Normal),
                    Candidate::new("llama3", "ollama-local", 1.0, Priority::Normal),
                ],
            )
            .unwrap();
        probe.set_down("http://gone", true);

        monitor.run_once().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let report = monitor.run_once().await;

        assert_eq!(report.removed, vec![p.id.clone()]);
        assert_eq!(report.failed_tickets, vec![stranded]);
        assert_eq!(manager.status(stranded), Some(TaskStatus::Failed));
        assert_eq!(queue.get_total_depth(), 1);

        assert!(manager.tick());
        assert_eq!(manager.take_result(rerouted).map(|r| r.provider_id), Some("ollama-local".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_streak() {
        let (registry, probe, monitor) = setup();
        let p = registry.register(ProviderRegistration::new("blip", "http://blip"));

        probe.set_down("http://blip", true);
        monitor.run_once().await;
        tokio::time::advance(Duration::from_secs(200)).await;

        probe.set_down("http://blip", false);
        monitor.run_once().await;
        let state = registry.get(&p.id).unwrap();
        assert!(state.is_healthy);
        assert!(state.unhealthy_since.is_none());

        probe.set_down("http://blip", true);
        tokio::time::advance(Duration::from_secs(200)).await;
        monitor.run_once().await;
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(monitor.run_once().await.removed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let (_registry, _probe, monitor) = setup();
        let monitor = Arc::new(monitor);

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_http_probe_falls_through_to_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;

        let registry = ProviderRegistry::new();
        let p = registry.register(ProviderRegistration::new("ollama", server.uri()));
        let outcome = HttpProbe::new(Duration::from_secs(5)).probe(&p).await;
        assert_eq!(outcome, ProbeOutcome::Reachable { endpoint: "/api/tags", status: 200 });
    }

    #[tokio::test]
    async fn test_http_probe_counts_auth_failure_as_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let registry = ProviderRegistry::new();
        let p = registry.register(ProviderRegistration::new("locked", server.uri()).with_auth_key("wrong"));
        let outcome = HttpProbe::new(Duration::from_secs(5)).probe(&p).await;
        assert_eq!(outcome, ProbeOutcome::Reachable { endpoint: "/v1/models", status: 401 });
    }

    #[tokio::test]
    async fn test_http_probe_all_failing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let registry = ProviderRegistry::new();
        let p = registry.register(ProviderRegistration::new("down", server.uri()));
        let outcome = HttpProbe::new(Duration::from_secs(5)).probe(&p).await;
        assert!(matches!(outcome, ProbeOutcome::Unreachable { .. }));
    }
}
