//! Engine Wiring
//!
//! Builds every long-lived component from a [`LogosConfig`] and owns their
//! background tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use logos_core::config::ProviderKind;
use logos_core::monitoring::SchedulerMetrics;
use logos_core::{
    build_scheduler, AzureSdi, FanoutSink, HealthMonitor, LogosConfig, MetricsSink, ModelCatalog, MonitoringRecorder,
    OllamaSdi, PolicyClassifier, PriorityQueueManager, ProviderRegistry, SchedulingDataInterface, SchedulingManager,
    SdiRegistry, TracingSink,
};

const MONITOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Running scheduling engine
pub struct Engine {
    /// Queued work
    pub queue: Arc<PriorityQueueManager>,
    /// Provider telemetry facades
    pub sdi: Arc<SdiRegistry>,
    /// Shared Azure facade, fed from response headers
    pub azure: Arc<AzureSdi>,
    /// Catalog classifier
    pub classifier: Arc<PolicyClassifier>,
    /// Scheduling loop
    pub manager: Arc<SchedulingManager>,
    /// Temp providers
    pub providers: Arc<ProviderRegistry>,
    /// Temp provider liveness
    pub health: Arc<HealthMonitor>,
    /// In-process counters
    pub metrics: Arc<SchedulerMetrics>,
    ollama: Vec<Arc<OllamaSdi>>,
    background: Vec<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Build the engine; must run inside a tokio runtime
    pub fn build(config: &LogosConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let metrics = Arc::new(SchedulerMetrics::new());
        let sink = FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(MetricsSink::new(Arc::clone(&metrics))));
        let (recorder, monitor_task) = MonitoringRecorder::spawn(Arc::new(sink));

        let queue = Arc::new(PriorityQueueManager::new());
        let sdi = Arc::new(SdiRegistry::new());
        let azure = Arc::new(AzureSdi::new(config.azure.clone()).with_queue(Arc::clone(&queue)));
        let mut ollama = Vec::new();

        for provider in &config.providers {
            match provider.kind {
                ProviderKind::Azure => {
                    for (model_id, deployment) in &provider.deployments {
                        azure.register_deployment(model_id.as_str(), provider.id.as_str(), deployment.as_str());
                    }
                    let facade: Arc<dyn SchedulingDataInterface> = Arc::<AzureSdi>::clone(&azure);
                    sdi.register(provider.id.clone(), facade);
                }
                ProviderKind::Ollama => {
                    let url = provider
                        .url
                        .clone()
                        .with_context(|| format!("Ollama provider '{}' has no url", provider.id))?;
                    let facade = Arc::new(
                        OllamaSdi::new(provider.id.clone(), url, config.ollama.clone()).with_queue(Arc::clone(&queue)),
                    );
                    ollama.push(Arc::clone(&facade));
                    sdi.register(provider.id.clone(), facade);
                }
            }
        }

        let catalog: ModelCatalog = config.models.iter().cloned().collect();
        let classifier = Arc::new(PolicyClassifier::new(catalog, config.classifier.clone()));

        let scheduler = build_scheduler(
            config.scheduler.kind,
            Arc::clone(&queue),
            config.scoring.clone(),
            Some(Arc::clone(&sdi)),
        );
        let manager = Arc::new(SchedulingManager::with_monitor(
            scheduler,
            config.scheduler.manager_config(),
            recorder.clone(),
        ));
        for model in &config.models {
            manager.register_model(&model.model_id, model.slots);
        }

        let providers =
            Arc::new(ProviderRegistry::with_monitor(recorder.clone()).with_classifier(Arc::clone(&classifier)));
        let health = Arc::new(
            HealthMonitor::new(Arc::clone(&providers), config.health.clone())
                .with_monitor(recorder)
                .with_manager(Arc::clone(&manager)),
        );

        info!(
            scheduler = %config.scheduler.kind,
            providers = config.providers.len(),
            models = config.models.len(),
            "Engine built"
        );

        Ok(Self {
            queue,
            sdi,
            azure,
            classifier,
            manager,
            providers,
            health,
            metrics,
            ollama,
            background: Vec::new(),
            monitor_task: Some(monitor_task),
        })
    }

    /// Start the scheduling loop, telemetry refresh and health probes
    pub fn start(&mut self) -> Result<()> {
        self.manager.start().context("Failed to start scheduling loop")?;
        for facade in &self.ollama {
            self.background.push(Arc::clone(facade).run_refresh_loop());
        }
        self.health.start();
        info!(ollama_facades = self.ollama.len(), "Engine started");
        Ok(())
    }

    /// Log a metrics summary every `every`
    pub fn spawn_metrics_log(&mut self, every: Duration) {
        let metrics = Arc::clone(&self.metrics);
        let queue = Arc::clone(&self.queue);
        self.background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let s = metrics.summary();
                info!(
                    uptime_secs = s.uptime_secs,
                    enqueued = s.enqueued,
                    scheduled = s.scheduled,
                    completed = s.completed,
                    failed = s.failed,
                    expired = s.expired,
                    in_flight = s.in_flight,
                    queue_depth = queue.get_total_depth(),
                    wait_p50_ms = s.wait_p50_ms,
                    wait_p99_ms = s.wait_p99_ms,
                    providers_removed = s.providers_removed,
                    "Scheduler metrics"
                );
            }
        }));
    }

    /// Stop everything and wait for the tasks to end
    pub async fn shutdown(mut self) -> Result<()> {
        self.health.stop().await;

        for handle in self.background.drain(..) {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task failed");
                }
            }
        }

        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.stop())
            .await
            .context("Scheduling loop did not stop cleanly")?;

        let pending = self.manager.pending_results();
        if pending > 0 {
            warn!(pending, "Shutting down with unclaimed results");
        }

        // The drain task ends once every recorder clone is gone.
        let monitor_task = self.monitor_task.take();
        drop(self);
        if let Some(handle) = monitor_task {
            match tokio::time::timeout(MONITOR_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Monitoring drain task failed"),
                Err(_) => warn!(
                    timeout_secs = MONITOR_DRAIN_TIMEOUT.as_secs(),
                    "Monitoring drain did not finish; dropping pending events"
                ),
            }
        }
        info!("Engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_core::{admit, Priority, TaskOutcome, TaskStatus};

    const CONFIG: &str = r#"
[scheduler]
kind = "fcfs"
poll_interval_ms = 10

[[providers]]
id = "ollama-local"
kind = "ollama"
url = "http://127.0.0.1:9"

[[providers]]
id = "azure-eu"
kind = "azure"
deployments = { "gpt-4o" = "gpt-4o-eu" }

[[models]]
model_id = "llama3"
provider_id = "ollama-local"
privacy = "LOCAL"
slots = 2

[[models]]
model_id = "gpt-4o"
provider_id = "azure-eu"
privacy = "CLOUD_IN_EU_BY_US_PROVIDER"
"#;

    #[tokio::test]
    async fn test_build_from_config() {
        let config = LogosConfig::from_toml_str(CONFIG).unwrap();
        let engine = Engine::build(&config).unwrap();

        assert_eq!(engine.classifier.catalog().len(), 2);
        assert_eq!(engine.manager.work_table().available("llama3"), 2);
        assert_eq!(engine.manager.work_table().available("gpt-4o"), 1);
        let mut ids = engine.sdi.providers();
        ids.sort();
        assert_eq!(ids, vec!["azure-eu", "ollama-local"]);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_flows_through_engine() {
        let config = LogosConfig::from_toml_str(CONFIG).unwrap();
        let mut engine = Engine::build(&config).unwrap();
        engine.start().unwrap();

        let plan = admit(&engine.classifier, "logos-v1__policy_privacy=LOCAL", "hi", Priority::High).unwrap();
        let ticket = engine
            .manager
            .add_request(serde_json::json!({"prompt": "hi"}), plan.candidates())
            .unwrap();

        let manager = Arc::clone(&engine.manager);
        let result = tokio::task::spawn_blocking(move || manager.wait_for_result(ticket, Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("scheduled");
        assert_eq!(result.model_id, "llama3");
        assert_eq!(engine.manager.complete(ticket, TaskOutcome::Success).unwrap(), TaskStatus::Completed);

        engine.shutdown().await.unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = LogosConfig::default();
        config.scheduler.poll_interval_ms = 0;
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        assert!(Engine::build(&config).is_err());
    }
}
