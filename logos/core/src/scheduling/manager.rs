//! Scheduling Manager
//!
//! Owns the scheduling loop, the ticket protocol and the per-model slot
//! table.
//!
//! # Ticket Lifecycle
//!
//! ```text
//! add_request ──> Queued ──tick──> Scheduled ──complete / set_free──> Completed | Failed
//!                    │                 │
//!                    │                 └──(unclaimed past result_ttl)──> Expired
//!                    └──(every candidate provider removed)──> Failed
//! ```
//!
//! A scheduled ticket owns the slot it was given and returns it exactly once,
//! whichever of `complete`, `set_free` or expiry gets there first.
//!
//! Results are kept per ticket until claimed with [`SchedulingManager::get_result`]
//! or [`SchedulingManager::take_result`]; concurrent submitters never lose
//! each other's results.
//!
//! # Locking
//!
//! One mutex guards tickets, results and slots. The loop holds it for a whole
//! tick, which includes the scheduler's queue and SDI reads, so the order is
//! always manager state first, queue second. Nothing under the lock does I/O.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::priority::Priority;
use super::scheduler::{ScheduledTask, Scheduler, WorkTable};
use super::task::{Candidate, Task, TaskId, TaskOutcome, TaskStatus, Ticket};
use crate::monitoring::MonitoringRecorder;

/// Scheduling manager errors
#[derive(Debug, Error)]
pub enum SchedulingError {
    /// A request must name at least one model
    #[error("request has no candidate models")]
    NoCandidates,

    /// Ticket was never issued or has been forgotten
    #[error("unknown ticket {0}")]
    UnknownTicket(Ticket),

    /// Operation does not apply to the ticket's current state
    #[error("ticket {ticket} is {status}")]
    InvalidState {
        /// Ticket in question
        ticket: Ticket,
        /// Its current status
        status: TaskStatus,
    },

    /// The loop thread could not be started
    #[error("failed to spawn scheduling thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Manager configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Idle wait between ticks when nothing wakes the loop
    pub poll_interval_ms: u64,
    /// Unclaimed results older than this are expired
    pub result_ttl_secs: u64,
    /// Slots given to a model seen for the first time
    pub default_slots_per_model: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            result_ttl_secs: 300,
            default_slots_per_model: 1,
        }
    }
}

impl ManagerConfig {
    /// Set the idle poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the result TTL
    #[must_use]
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the slots for newly seen models
    #[must_use]
    pub fn with_default_slots(mut self, slots: usize) -> Self {
        self.default_slots_per_model = slots;
        self
    }

    /// Idle poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Result TTL
    #[must_use]
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// A scheduled request waiting for its submitter
#[derive(Clone, Debug)]
pub struct ScheduledResult {
    /// Submission ticket
    pub ticket: Ticket,
    /// The task, payload included
    pub task: Arc<Task>,
    /// Model holding a slot for the task
    pub model_id: String,
    /// Provider to call
    pub provider_id: String,
    /// Tier the task won from
    pub priority: Priority,
    /// Time spent queued
    pub waited: Duration,
    ready_at: Instant,
}

#[derive(Debug)]
struct TicketState {
    task_id: TaskId,
    status: TaskStatus,
    model_id: Option<String>,
    holds_slot: bool,
    finished_at: Option<Instant>,
}

#[derive(Clone, Copy, Debug, Default)]
struct ModelSlots {
    total: usize,
    busy: usize,
}

/// Slots per model
#[derive(Debug, Default)]
struct CapacityTable {
    models: HashMap<String, ModelSlots>,
}

impl CapacityTable {
    fn register(&mut self, model_id: &str, total: usize) {
        self.models.entry(model_id.to_string()).or_default().total = total;
    }

    fn ensure(&mut self, model_id: &str, default_slots: usize) {
        self.models
            .entry(model_id.to_string())
            .or_insert(ModelSlots {
                total: default_slots,
                busy: 0,
            });
    }

    fn take(&mut self, model_id: &str) -> bool {
        match self.models.get_mut(model_id) {
            Some(slots) if slots.busy < slots.total => {
                slots.busy += 1;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, model_id: &str) -> bool {
        match self.models.get_mut(model_id) {
            Some(slots) if slots.busy > 0 => {
                slots.busy -= 1;
                true
            }
            _ => false,
        }
    }

    fn work_table(&self) -> WorkTable {
        self.models
            .iter()
            .map(|(model, slots)| (model.clone(), slots.total.saturating_sub(slots.busy)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    next_ticket: u64,
    tickets: HashMap<Ticket, TicketState>,
    results: BTreeMap<Ticket, ScheduledResult>,
    capacity: CapacityTable,
    shutdown: bool,
}

impl ManagerState {
    fn finish(&mut self, ticket: Ticket, status: TaskStatus) -> Option<String> {
        let entry = self.tickets.get_mut(&ticket)?;
        entry.status = status;
        entry.finished_at = Some(Instant::now());
        let model_id = entry.model_id.clone()?;
        if std::mem::take(&mut entry.holds_slot) {
            self.capacity.release(&model_id);
        }
        Some(model_id)
    }

    /// Scheduled ticket holding a slot of `model_id`; claimed results first
    fn slot_holder(&self, model_id: &str) -> Option<Ticket> {
        self.tickets
            .iter()
            .filter(|(_, t)| t.holds_slot && t.model_id.as_deref() == Some(model_id))
            .map(|(ticket, _)| *ticket)
            .min_by_key(|ticket| (self.results.contains_key(ticket), *ticket))
    }

    /// Expire stale results and forget old terminal tickets
    fn expire(&mut self, ttl: Duration, monitor: &MonitoringRecorder) {
        let stale: Vec<Ticket> = self
            .results
            .values()
            .filter(|r| r.ready_at.elapsed() > ttl)
            .map(|r| r.ticket)
            .collect();
        for ticket in stale {
            self.results.remove(&ticket);
            if let Some(model_id) = self.finish(ticket, TaskStatus::Expired) {
                tracing::warn!(%ticket, model_id = %model_id, "Result never claimed; slot reclaimed");
                monitor.record_complete(ticket, &model_id, TaskStatus::Expired, None);
            }
        }

        self.tickets
            .retain(|_, t| t.finished_at.map_or(true, |at| at.elapsed() <= ttl));
    }
}

struct Shared {
    state: Mutex<ManagerState>,
    wake: Condvar,
    scheduler: Arc<dyn Scheduler>,
    monitor: MonitoringRecorder,
    config: ManagerConfig,
}

impl Shared {
    fn tick(&self) -> bool {
        let mut state = self.state.lock();
        state.expire(self.config.result_ttl(), &self.monitor);

        if self.scheduler.is_empty() {
            return false;
        }
        let work = state.capacity.work_table();
        let Some(scheduled) = self.scheduler.schedule(&work) else {
            return false;
        };
        let ScheduledTask {
            task,
            model_id,
            provider_id,
            priority,
            waited,
            ..
        } = scheduled;
        let ticket = task.ticket;

        let holds_slot = state.capacity.take(&model_id);
        if !holds_slot {
            tracing::error!(%ticket, model_id = %model_id, "Scheduler picked a model with no free slot");
        }
        if let Some(entry) = state.tickets.get_mut(&ticket) {
            entry.status = TaskStatus::Scheduled;
            entry.model_id = Some(model_id.clone());
            entry.holds_slot = holds_slot;
        }

        self.monitor
            .record_scheduled(ticket, &model_id, &provider_id, priority, waited);
        tracing::debug!(
            %ticket,
            model_id = %model_id,
            provider_id = %provider_id,
            %priority,
            waited_ms = waited.as_millis() as u64,
            "Request scheduled"
        );

        state.results.insert(
            ticket,
            ScheduledResult {
                ticket,
                task,
                model_id,
                provider_id,
                priority,
                waited,
                ready_at: Instant::now(),
            },
        );
        self.wake.notify_all();
        true
    }

    fn run(&self) {
        tracing::info!(scheduler = self.scheduler.name(), "Scheduling loop started");
        loop {
            let progressed = match catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(progressed) => progressed,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(error = %message, "Scheduling tick panicked; continuing");
                    false
                }
            };

            let mut state = self.state.lock();
            if state.shutdown {
                break;
            }
            if !progressed {
                self.wake.wait_for(&mut state, self.config.poll_interval());
                if state.shutdown {
                    break;
                }
            }
        }
        tracing::info!("Scheduling loop stopped");
    }
}

/// Ticket-based front end to a scheduler
///
/// One background thread per instance, started with [`start`](Self::start)
/// and joined by [`stop`](Self::stop) or on drop.
pub struct SchedulingManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulingManager {
    /// Manager without monitoring
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>, config: ManagerConfig) -> Self {
        Self::with_monitor(scheduler, config, MonitoringRecorder::disabled())
    }

    /// Manager reporting transitions to `monitor`
    #[must_use]
    pub fn with_monitor(
        scheduler: Arc<dyn Scheduler>,
        config: ManagerConfig,
        monitor: MonitoringRecorder,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState::default()),
                wake: Condvar::new(),
                scheduler,
                monitor,
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    /// The scheduler in use
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.shared.scheduler
    }

    /// Set the concurrent-request slots of a model
    pub fn register_model(&self, model_id: &str, slots: usize) {
        self.shared.state.lock().capacity.register(model_id, slots);
        tracing::debug!(model_id, slots, "Registered model capacity");
        self.shared.wake.notify_all();
    }

    /// Free slots per model right now
    #[must_use]
    pub fn work_table(&self) -> WorkTable {
        self.shared.state.lock().capacity.work_table()
    }

    /// Submit a request; returns its ticket
    pub fn add_request(
        &self,
        payload: serde_json::Value,
        candidates: Vec<Candidate>,
    ) -> Result<Ticket, SchedulingError> {
        if candidates.is_empty() {
            return Err(SchedulingError::NoCandidates);
        }

        let mut state = self.shared.state.lock();
        state.next_ticket += 1;
        let ticket = Ticket(state.next_ticket);

        let default_slots = self.shared.config.default_slots_per_model;
        for candidate in &candidates {
            state.capacity.ensure(&candidate.model_id, default_slots);
        }

        let task = Arc::new(Task::new(ticket, payload, candidates));
        state.tickets.insert(
            ticket,
            TicketState {
                task_id: task.id,
                status: TaskStatus::Queued,
                model_id: None,
                holds_slot: false,
                finished_at: None,
            },
        );
        self.shared.monitor.record_enqueue(&task);
        let entries = self.shared.scheduler.enqueue(task);
        drop(state);

        tracing::debug!(%ticket, entries = entries.len(), "Request queued");
        self.shared.wake.notify_all();
        Ok(ticket)
    }

    /// Whether the ticket has left the queue
    #[must_use]
    pub fn is_finished(&self, ticket: Ticket) -> bool {
        self.status(ticket)
            .is_some_and(|status| status != TaskStatus::Queued)
    }

    /// Current status of a ticket
    #[must_use]
    pub fn status(&self, ticket: Ticket) -> Option<TaskStatus> {
        self.shared.state.lock().tickets.get(&ticket).map(|t| t.status)
    }

    /// Claim the oldest unclaimed result
    ///
    /// Each result is returned exactly once.
    pub fn get_result(&self) -> Option<ScheduledResult> {
        self.shared.state.lock().results.pop_first().map(|(_, r)| r)
    }

    /// Claim the result of one ticket
    pub fn take_result(&self, ticket: Ticket) -> Option<ScheduledResult> {
        self.shared.state.lock().results.remove(&ticket)
    }

    /// Number of results waiting to be claimed
    #[must_use]
    pub fn pending_results(&self) -> usize {
        self.shared.state.lock().results.len()
    }

    /// Block until the ticket's result is available or `timeout` elapses
    ///
    /// Returns `None` on timeout, for unknown tickets, and for tickets whose
    /// result was already claimed or expired.
    pub fn wait_for_result(&self, ticket: Ticket, timeout: Duration) -> Option<ScheduledResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.results.remove(&ticket) {
                return Some(result);
            }
            match state.tickets.get(&ticket) {
                Some(t) if t.status == TaskStatus::Queued => {}
                _ => return None,
            }
            if self.shared.wake.wait_until(&mut state, deadline).timed_out() {
                return state.results.remove(&ticket);
            }
        }
    }

    /// Return one slot of a model
    ///
    /// The slot is taken back from a scheduled ticket on that model, oldest
    /// claimed result first, and that ticket is completed. Returns `false` if
    /// no ticket holds a slot of the model.
    pub fn set_free(&self, model_id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let Some(ticket) = state.slot_holder(model_id) else {
            drop(state);
            tracing::warn!(model_id, "set_free on a model with no busy slot");
            return false;
        };
        if state.results.remove(&ticket).is_some() {
            tracing::warn!(%ticket, model_id, "Slot freed before its result was claimed");
        }
        state.finish(ticket, TaskStatus::Completed);
        drop(state);

        self.shared
            .monitor
            .record_complete(ticket, model_id, TaskStatus::Completed, None);
        tracing::debug!(%ticket, model_id, "Slot freed");
        self.shared.wake.notify_all();
        true
    }

    /// Record the outcome of the provider call and return the slot
    pub fn complete(&self, ticket: Ticket, outcome: TaskOutcome) -> Result<TaskStatus, SchedulingError> {
        let mut state = self.shared.state.lock();
        let current = state
            .tickets
            .get(&ticket)
            .map(|t| t.status)
            .ok_or(SchedulingError::UnknownTicket(ticket))?;
        if current != TaskStatus::Scheduled {
            return Err(SchedulingError::InvalidState {
                ticket,
                status: current,
            });
        }

        let (status, error) = match &outcome {
            TaskOutcome::Success => (TaskStatus::Completed, None),
            TaskOutcome::Failure(reason) => (TaskStatus::Failed, Some(reason.as_str())),
        };
        state.results.remove(&ticket);
        let model_id = state.finish(ticket, status).unwrap_or_default();
        drop(state);

        self.shared.monitor.record_complete(ticket, &model_id, status, error);
        tracing::debug!(%ticket, model_id = %model_id, %status, "Request finished");
        self.shared.wake.notify_all();
        Ok(status)
    }

    /// Drop queued work for a provider that went away
    ///
    /// Entries waiting for the provider are withdrawn. A request left with no
    /// other candidate fails; the rest stay queued for their other models.
    /// Returns the failed tickets.
    pub fn withdraw_provider(&self, provider_id: &str) -> Vec<Ticket> {
        let mut state = self.shared.state.lock();
        let orphaned = self.shared.scheduler.withdraw_provider(provider_id);
        let mut failed = Vec::with_capacity(orphaned.len());
        for task in orphaned {
            let model_id = task.candidates.first().map(|c| c.model_id.clone()).unwrap_or_default();
            let Some(entry) = state.tickets.get_mut(&task.ticket) else {
                continue;
            };
            entry.status = TaskStatus::Failed;
            entry.finished_at = Some(Instant::now());
            self.shared.monitor.record_complete(
                task.ticket,
                &model_id,
                TaskStatus::Failed,
                Some("provider removed"),
            );
            failed.push(task.ticket);
        }
        drop(state);

        if !failed.is_empty() {
            tracing::warn!(provider_id, failed = failed.len(), "Failed requests queued only for a removed provider");
            self.shared.wake.notify_all();
        }
        failed
    }

    /// Withdraw a queued request
    ///
    /// Returns `false` if the ticket is unknown or already scheduled.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut state = self.shared.state.lock();
        let task_id = match state.tickets.get(&ticket) {
            Some(t) if t.status == TaskStatus::Queued => t.task_id,
            _ => return false,
        };
        let removed = self.shared.scheduler.cancel(task_id);
        state.tickets.remove(&ticket);
        tracing::debug!(%ticket, removed, "Request cancelled");
        true
    }

    /// Run one scheduling pass on the calling thread
    ///
    /// Returns whether a request was scheduled.
    pub fn tick(&self) -> bool {
        self.shared.tick()
    }

    /// Start the scheduling thread; no-op if it is already running
    pub fn start(&self) -> Result<(), SchedulingError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.shared.state.lock().shutdown = false;

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("logos-scheduler".to_string())
            .spawn(move || shared.run())?;
        *worker = Some(handle);
        Ok(())
    }

    /// Whether the scheduling thread is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Signal the scheduling thread and join it
    pub fn stop(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            tracing::error!("Scheduling thread exited with a panic");
        }
    }
}

impl Drop for SchedulingManager {
    fn drop(&mut self) {
        self.stop();
    }
}
