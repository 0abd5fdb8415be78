//! Monitoring
//!
//! Best-effort write-through of scheduling transitions. Recording never
//! blocks and never fails: events go onto an unbounded channel, a background
//! task hands them to a [`MonitoringSink`], and sink errors are logged and
//! dropped.
//!
//! ```text
//! SchedulingManager ─┐
//! HealthMonitor ─────┼─> MonitoringRecorder ──channel──> drain task ──> MonitoringSink
//! ```

mod metrics;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scheduling::priority::Priority;
use crate::scheduling::task::{Task, TaskStatus, Ticket};

pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot, MetricsSink, MetricsSummary, SchedulerMetrics};

/// What happened to a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAction {
    /// Provider joined the registry
    Registered,
    /// Probe succeeded after a failure
    Recovered,
    /// Every probe endpoint failed
    Unhealthy,
    /// Removed from the registry
    Deregistered,
}

/// One recorded transition
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitoringEvent {
    /// Request admitted to the queue
    Enqueue {
        /// Submission ticket
        ticket: Ticket,
        /// Candidate model ids, best first
        candidates: Vec<String>,
        /// Event time
        at: DateTime<Utc>,
    },
    /// Request assigned to a model
    Scheduled {
        /// Submission ticket
        ticket: Ticket,
        /// Winning model
        model_id: String,
        /// Provider hosting the model
        provider_id: String,
        /// Tier of the winning entry
        priority: Priority,
        /// Queue wait
        waited_ms: u64,
        /// Event time
        at: DateTime<Utc>,
    },
    /// Request reached a terminal state
    Complete {
        /// Submission ticket
        ticket: Ticket,
        /// Model that served (or would have served) the request
        model_id: String,
        /// Final status
        status: TaskStatus,
        /// Failure reason, if any
        error: Option<String>,
        /// Event time
        at: DateTime<Utc>,
    },
    /// Provider registry change
    Provider {
        /// Provider id
        provider_id: String,
        /// What changed
        action: ProviderAction,
        /// Event time
        at: DateTime<Utc>,
    },
}

/// Sink errors are logged, never propagated to the caller
#[derive(Debug, Error)]
pub enum SinkError {
    /// Backend rejected or lost the write
    #[error("monitoring write failed: {0}")]
    Write(String),
    /// Event could not be encoded
    #[error("monitoring serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for monitoring events (a database table, a log, counters)
#[async_trait]
pub trait MonitoringSink: Send + Sync {
    /// Persist one event
    async fn write(&self, event: &MonitoringEvent) -> Result<(), SinkError>;
}

/// Writes every event as one JSON `tracing` line
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl MonitoringSink for TracingSink {
    async fn write(&self, event: &MonitoringEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(event)?;
        tracing::info!(target: "logos_core::monitoring", event = %line, "monitoring");
        Ok(())
    }
}

/// Fans each event out to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MonitoringSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl MonitoringSink for FanoutSink {
    async fn write(&self, event: &MonitoringEvent) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.write(event).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Non-blocking event recorder
///
/// Cheap to clone; every clone feeds the same channel.
#[derive(Clone, Debug)]
pub struct MonitoringRecorder {
    tx: Option<mpsc::UnboundedSender<MonitoringEvent>>,
}

impl MonitoringRecorder {
    /// Recorder that drops everything
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Recorder plus the raw receiving end
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MonitoringEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Recorder draining into `sink` on a background task
    ///
    /// Must be called inside a tokio runtime. The task ends once every
    /// recorder clone is dropped.
    pub fn spawn(sink: Arc<dyn MonitoringSink>) -> (Self, JoinHandle<()>) {
        let (recorder, mut rx) = Self::channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.write(&event).await {
                    tracing::debug!(error = %e, "Dropping monitoring event");
                }
            }
        });
        (recorder, handle)
    }

    /// Whether events go anywhere
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send(&self, event: MonitoringEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means monitoring was shut down
            let _ = tx.send(event);
        }
    }

    /// Request admitted
    pub fn record_enqueue(&self, task: &Task) {
        self.send(MonitoringEvent::Enqueue {
            ticket: task.ticket,
            candidates: task.candidates.iter().map(|c| c.model_id.clone()).collect(),
            at: Utc::now(),
        });
    }

    /// Request assigned to a model
    pub fn record_scheduled(
        &self,
        ticket: Ticket,
        model_id: &str,
        provider_id: &str,
        priority: Priority,
        waited: Duration,
    ) {
        self.send(MonitoringEvent::Scheduled {
            ticket,
            model_id: model_id.to_string(),
            provider_id: provider_id.to_string(),
            priority,
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            at: Utc::now(),
        });
    }

    /// Request finished
    pub fn record_complete(&self, ticket: Ticket, model_id: &str, status: TaskStatus, error: Option<&str>) {
        self.send(MonitoringEvent::Complete {
            ticket,
            model_id: model_id.to_string(),
            status,
            error: error.map(str::to_string),
            at: Utc::now(),
        });
    }

    /// Provider registry change
    pub fn record_provider(&self, provider_id: &str, action: ProviderAction) {
        self.send(MonitoringEvent::Provider {
            provider_id: provider_id.to_string(),
            action,
            at: Utc::now(),
        });
    }
}

impl Default for MonitoringRecorder {
    fn default() -> Self {
        Self::disabled()
    }
}
