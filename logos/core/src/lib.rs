//! Logos Core - Policy-Aware Scheduling for Multi-Provider LLM Inference
//!
//! This crate decides which model serves a request and when. Requests carry a
//! structured model string describing their privacy and quality needs; the
//! engine turns that into a ranked set of candidate models, queues the
//! request per candidate, and hands it out once a provider has capacity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Request Path                              │
//! │                                                                   │
//! │  model string ──> admission ──> PolicyClassifier ──> candidates   │
//! │                                                         │         │
//! │                                                         ▼         │
//! │  ┌─────────────────────── SchedulingManager ─────────────────────┐│
//! │  │  tickets ──> Scheduler (FCFS / Priority) ──> results by ticket ││
//! │  │                  │                                             ││
//! │  │                  ▼                                             ││
//! │  │        PriorityQueueManager (per model, per tier)              ││
//! │  └──────────────────┬─────────────────────────────────────────────┘│
//! │                     │ capacity / warm state                        │
//! │                     ▼                                              │
//! │              SdiRegistry ──> AzureSdi (headers) / OllamaSdi (/api/ps)│
//! └──────────────────────────────────────────────────────────────────┘
//!
//!   ProviderRegistry <── HealthMonitor (probes temp providers, evicts dead ones)
//!   MonitoringRecorder ──> MonitoringSink (tracing, metrics)
//! ```
//!
//! # Key Types
//!
//! - [`SchedulingManager`]: owns the scheduling loop and ticket results
//! - [`Scheduler`]: pluggable strategy ([`FcfsScheduler`], [`PriorityScheduler`])
//! - [`PriorityQueueManager`]: per-model three-tier queues
//! - [`PolicyClassifier`]: filters and scores the model catalog
//! - [`SchedulingDataInterface`]: provider telemetry facades
//! - [`HealthMonitor`]: liveness of self-registered providers
//! - [`MonitoringRecorder`]: fire-and-forget transition log
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use logos_core::{
//!     admission, build_scheduler, ManagerConfig, PriorityQueueManager, Priority,
//!     SchedulerKind, SchedulingManager, ScoringConfig, TaskOutcome,
//! };
//!
//! let queue = Arc::new(PriorityQueueManager::new());
//! let scheduler = build_scheduler(SchedulerKind::Priority, queue, ScoringConfig::default(), None);
//! let manager = SchedulingManager::new(scheduler, ManagerConfig::default());
//! manager.start()?;
//!
//! let plan = admission::admit(&classifier, "logos-v1__policy_privacy=LOCAL", prompt, Priority::High)?;
//! let ticket = manager.add_request(payload, plan.candidates())?;
//! if let Some(result) = manager.wait_for_result(ticket, timeout) {
//!     // call result.provider_id / result.model_id
//!     manager.complete(ticket, TaskOutcome::Success)?;
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`model_string`]: `logos-v..` model string parsing
//! - [`classification`]: privacy tiers, policies, catalog classification
//! - [`admission`]: model string to scheduling candidates
//! - [`scheduling`]: queues, strategies, the scheduling manager
//! - [`sdi`]: Azure and Ollama capacity facades
//! - [`providers`]: temp provider registry, discovery, health monitoring
//! - [`monitoring`]: transition events, sinks, in-process metrics
//! - [`config`]: TOML configuration with environment and CLI overrides

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod admission;
pub mod classification;
pub mod config;
pub mod model_string;
pub mod monitoring;
pub mod providers;
pub mod scheduling;
pub mod sdi;

// Re-exports for convenience
pub use admission::{admit, AdmissionPlan, Routing};
pub use classification::{
    ClassifiedModel, ClassifierConfig, ModelCatalog, ModelDescriptor, Policy, PolicyClassifier, PrivacyTier,
};
pub use config::{load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource, LogosConfig};
pub use model_string::{ModelStringError, ParsedModelString};
pub use monitoring::{
    FanoutSink, MetricsSink, MonitoringEvent, MonitoringRecorder, MonitoringSink, ProviderAction, TracingSink,
};
pub use providers::{
    HealthConfig, HealthMonitor, HealthReport, ModelDiscovery, ProviderRegistration, ProviderRegistry, TempProvider,
};
pub use scheduling::{
    build_scheduler, Candidate, FcfsScheduler, ManagerConfig, Priority, PriorityQueueManager, PriorityScheduler,
    ScheduledResult, Scheduler, SchedulerKind, SchedulingError, SchedulingManager, ScoringConfig, Task, TaskOutcome,
    TaskStatus, Ticket, WorkTable,
};
pub use sdi::{AzureConfig, AzureSdi, CapacityInfo, ModelStatus, OllamaConfig, OllamaSdi, SchedulingDataInterface, SdiRegistry};
