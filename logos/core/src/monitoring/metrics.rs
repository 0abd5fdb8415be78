//! Scheduler Metrics
//!
//! In-process aggregation of monitoring events:
//! - Admission, scheduling and completion counts
//! - Queue wait distribution
//! - Per-model scheduling counts
//! - Requests currently holding a slot

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use super::{MonitoringEvent, MonitoringSink, ProviderAction, SinkError};
use crate::scheduling::task::TaskStatus;

// ============================================================================
// Histogram
// ============================================================================

/// Fixed-bucket histogram
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the given upper bounds
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets suited to queue waits in milliseconds
    #[must_use]
    pub fn wait_default() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0, 300000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.max.fetch_max(value as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            total,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Upper bucket bounds
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Number of samples
    pub total: u64,
    /// Largest sample
    pub max: u64,
    /// Mean sample
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let target = ((self.total as f64) * p).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }
        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Median
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 99th percentile
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that goes up and down, floored at zero
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtract one
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Scheduler Metrics
// ============================================================================

/// Aggregated scheduling metrics
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Requests admitted
    pub enqueued: Counter,
    /// Requests assigned to a model
    pub scheduled: Counter,
    /// Requests completed successfully
    pub completed: Counter,
    /// Requests whose provider call failed
    pub failed: Counter,
    /// Results nobody claimed in time
    pub expired: Counter,
    /// Requests holding a slot
    pub in_flight: Gauge,
    /// Queue wait in milliseconds
    pub queue_wait_ms: Histogram,
    /// Providers that went unhealthy
    pub provider_failures: Counter,
    /// Providers removed from the registry
    pub providers_removed: Counter,
    per_model: RwLock<HashMap<String, Arc<Counter>>>,
    started_at: Instant,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            enqueued: Counter::default(),
            scheduled: Counter::default(),
            completed: Counter::default(),
            failed: Counter::default(),
            expired: Counter::default(),
            in_flight: Gauge::default(),
            queue_wait_ms: Histogram::wait_default(),
            provider_failures: Counter::default(),
            providers_removed: Counter::default(),
            per_model: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }
}

impl SchedulerMetrics {
    /// Fresh metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn model_counter(&self, model_id: &str) -> Arc<Counter> {
        if let Some(counter) = self.per_model.read().get(model_id) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.per_model
                .write()
                .entry(model_id.to_string())
                .or_default(),
        )
    }

    /// Fold one event into the aggregates
    pub fn observe(&self, event: &MonitoringEvent) {
        match event {
            MonitoringEvent::Enqueue { .. } => self.enqueued.inc(),
            MonitoringEvent::Scheduled { model_id, waited_ms, .. } => {
                self.scheduled.inc();
                self.in_flight.inc();
                self.queue_wait_ms.record(*waited_ms as f64);
                self.model_counter(model_id).inc();
            }
            MonitoringEvent::Complete { status, .. } => {
                match status {
                    TaskStatus::Completed => self.completed.inc(),
                    TaskStatus::Failed => self.failed.inc(),
                    TaskStatus::Expired => self.expired.inc(),
                    TaskStatus::Queued | TaskStatus::Scheduled => return,
                }
                self.in_flight.dec();
            }
            MonitoringEvent::Provider { action, .. } => match action {
                ProviderAction::Unhealthy => self.provider_failures.inc(),
                ProviderAction::Deregistered => self.providers_removed.inc(),
                ProviderAction::Registered | ProviderAction::Recovered => {}
            },
        }
    }

    /// Point-in-time summary
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let wait = self.queue_wait_ms.snapshot();
        let mut per_model: Vec<(String, u64)> = self
            .per_model
            .read()
            .iter()
            .map(|(model, counter)| (model.clone(), counter.get()))
            .collect();
        per_model.sort();

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            enqueued: self.enqueued.get(),
            scheduled: self.scheduled.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            expired: self.expired.get(),
            in_flight: self.in_flight.get(),
            wait_p50_ms: wait.p50(),
            wait_p99_ms: wait.p99(),
            provider_failures: self.provider_failures.get(),
            providers_removed: self.providers_removed.get(),
            per_model,
        }
    }
}

/// Summary for the periodic log line
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    /// Seconds since the metrics were created
    pub uptime_secs: u64,
    /// Requests admitted
    pub enqueued: u64,
    /// Requests assigned
    pub scheduled: u64,
    /// Successful completions
    pub completed: u64,
    /// Failed completions
    pub failed: u64,
    /// Expired results
    pub expired: u64,
    /// Requests holding a slot
    pub in_flight: u64,
    /// Median queue wait
    pub wait_p50_ms: f64,
    /// Tail queue wait
    pub wait_p99_ms: f64,
    /// Unhealthy transitions
    pub provider_failures: u64,
    /// Providers removed
    pub providers_removed: u64,
    /// Scheduled count per model
    pub per_model: Vec<(String, u64)>,
}

/// Sink that feeds [`SchedulerMetrics`]
#[derive(Clone, Debug, Default)]
pub struct MetricsSink {
    metrics: Arc<SchedulerMetrics>,
}

impl MetricsSink {
    /// Sink over shared metrics
    #[must_use]
    pub fn new(metrics: Arc<SchedulerMetrics>) -> Self {
        Self { metrics }
    }

    /// The aggregated metrics
    #[must_use]
    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }
}

#[async_trait]
impl MonitoringSink for MetricsSink {
    async fn write(&self, event: &MonitoringEvent) -> Result<(), SinkError> {
        self.metrics.observe(event);
        Ok(())
    }
}
