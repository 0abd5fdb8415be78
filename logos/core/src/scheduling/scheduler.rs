//! Schedulers
//!
//! A scheduler decides which queued entry runs next given the free slots of
//! every model. Two implementations:
//!
//! - [`FcfsScheduler`]: walk keys in registration order, first one with work
//!   and a free slot wins
//! - [`PriorityScheduler`]: score the head of every eligible key and pick the
//!   best
//!
//! A key is eligible when its model has a free slot and, with an
//! [`SdiRegistry`] attached, its provider reports capacity.
//!
//! # Candidates
//!
//! A task that can run on several models is queued once per candidate. When
//! one of those entries wins, the others are withdrawn, so a task is
//! scheduled at most once.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::priority::Priority;
use super::queue::{EntryId, EntrySnapshot, PriorityQueueManager, QueueKey};
use super::task::{Task, TaskId};
use crate::sdi::SdiRegistry;

const EPS: f64 = 1e-9;

/// Free slots per model, as seen by one scheduling tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkTable {
    slots: HashMap<String, usize>,
}

impl WorkTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the free slots of a model
    pub fn set(&mut self, model_id: impl Into<String>, slots: usize) {
        self.slots.insert(model_id.into(), slots);
    }

    /// Free slots of a model; unknown models have none
    #[must_use]
    pub fn available(&self, model_id: &str) -> usize {
        self.slots.get(model_id).copied().unwrap_or(0)
    }

    /// Models that can take work
    pub fn models_with_capacity(&self) -> impl Iterator<Item = &str> {
        self.slots
            .iter()
            .filter(|(_, slots)| **slots > 0)
            .map(|(model, _)| model.as_str())
    }
}

impl FromIterator<(String, usize)> for WorkTable {
    fn from_iter<I: IntoIterator<Item = (String, usize)>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().collect(),
        }
    }
}

/// The entry a scheduler picked
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    /// The task to run
    pub task: Arc<Task>,
    /// Entry that won
    pub entry_id: EntryId,
    /// Model that will serve the task
    pub model_id: String,
    /// Provider hosting the model
    pub provider_id: String,
    /// Tier the entry was in when it won
    pub priority: Priority,
    /// Time spent queued
    pub waited: Duration,
}

/// Scheduling strategy
pub trait Scheduler: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Queue a task under each of its candidates
    fn enqueue(&self, task: Arc<Task>) -> Vec<EntryId>;

    /// Pick and dequeue the next entry, if any model with free slots has work
    fn schedule(&self, work: &WorkTable) -> Option<ScheduledTask>;

    /// Withdraw every queued entry of a task; returns how many were removed
    fn cancel(&self, task_id: TaskId) -> usize;

    /// Withdraw every entry waiting for a provider
    ///
    /// Returns the tasks left with no queued entry at all.
    fn withdraw_provider(&self, provider_id: &str) -> Vec<Arc<Task>>;

    /// Whether nothing is queued
    fn is_empty(&self) -> bool;

    /// Queue the scheduler draws from
    fn queue(&self) -> &Arc<PriorityQueueManager>;
}

/// Which strategy to run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// First come, first served
    Fcfs,
    /// Score-based
    #[default]
    Priority,
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fcfs" => Ok(Self::Fcfs),
            "priority" => Ok(Self::Priority),
            other => Err(format!("unknown scheduler '{other}' (expected fcfs or priority)")),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fcfs => write!(f, "fcfs"),
            Self::Priority => write!(f, "priority"),
        }
    }
}

/// Weights of the priority score
///
/// `score = priority_weight * priority - depth_weight * model_depth
///        + slot_weight * free_slots - cold_start_penalty (if cold)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Multiplier for the tier value (1/5/10)
    pub priority_weight: f64,
    /// Penalty per queued entry of the same model
    pub depth_weight: f64,
    /// Bonus per free slot
    pub slot_weight: f64,
    /// Subtracted when the model is not resident
    pub cold_start_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            priority_weight: 10.0,
            depth_weight: 0.1,
            slot_weight: 1.0,
            cold_start_penalty: 5.0,
        }
    }
}

/// Build the configured strategy
pub fn build_scheduler(
    kind: SchedulerKind,
    queue: Arc<PriorityQueueManager>,
    scoring: ScoringConfig,
    sdi: Option<Arc<SdiRegistry>>,
) -> Arc<dyn Scheduler> {
    match (kind, sdi) {
        (SchedulerKind::Fcfs, Some(sdi)) => Arc::new(FcfsScheduler::new(queue).with_sdi(sdi)),
        (SchedulerKind::Fcfs, None) => Arc::new(FcfsScheduler::new(queue)),
        (SchedulerKind::Priority, Some(sdi)) => {
            Arc::new(PriorityScheduler::new(queue).with_scoring(scoring).with_sdi(sdi))
        }
        (SchedulerKind::Priority, None) => Arc::new(PriorityScheduler::new(queue).with_scoring(scoring)),
    }
}

fn provider_admits(sdi: Option<&Arc<SdiRegistry>>, key: &QueueKey) -> bool {
    sdi.map_or(true, |sdi| sdi.has_capacity(&key.model_id, &key.provider_id))
}

/// Entries queued on behalf of each task
#[derive(Debug, Default)]
struct TaskEntries {
    by_task: Mutex<HashMap<TaskId, Vec<EntryId>>>,
}

impl TaskEntries {
    fn enqueue(&self, queue: &PriorityQueueManager, task: Arc<Task>) -> Vec<EntryId> {
        let ids: Vec<EntryId> = task
            .candidates
            .iter()
            .map(|c| queue.enqueue(Arc::clone(&task), &c.model_id, &c.provider_id, c.priority))
            .collect();
        if !ids.is_empty() {
            self.by_task.lock().insert(task.id, ids.clone());
        }
        ids
    }

    /// Dequeue the winner and withdraw its siblings
    fn claim(&self, queue: &PriorityQueueManager, winner: &EntrySnapshot) -> Option<ScheduledTask> {
        let entry = queue.dequeue_entry(winner.entry_id)?;

        let siblings = self.by_task.lock().remove(&entry.task.id).unwrap_or_default();
        for sibling in siblings.into_iter().filter(|id| *id != entry.entry_id) {
            queue.remove(sibling);
        }

        Some(ScheduledTask {
            waited: entry.waited(),
            task: entry.task,
            entry_id: entry.entry_id,
            model_id: entry.model_id,
            provider_id: entry.provider_id,
            priority: entry.current_priority,
        })
    }

    fn cancel(&self, queue: &PriorityQueueManager, task_id: TaskId) -> usize {
        let ids = self.by_task.lock().remove(&task_id).unwrap_or_default();
        ids.into_iter().filter(|id| queue.remove(*id)).count()
    }

    fn withdraw_provider(&self, queue: &PriorityQueueManager, provider_id: &str) -> Vec<Arc<Task>> {
        let removed = queue.remove_provider(provider_id);
        let mut by_task = self.by_task.lock();
        let mut orphaned = Vec::new();
        for entry in removed {
            let Some(ids) = by_task.get_mut(&entry.task.id) else {
                continue;
            };
            ids.retain(|id| *id != entry.entry_id);
            if ids.is_empty() {
                by_task.remove(&entry.task.id);
                orphaned.push(entry.task);
            }
        }
        orphaned
    }
}

/// First come, first served
#[derive(Debug)]
pub struct FcfsScheduler {
    queue: Arc<PriorityQueueManager>,
    entries: TaskEntries,
    sdi: Option<Arc<SdiRegistry>>,
}

impl FcfsScheduler {
    /// Schedule from the given queue
    #[must_use]
    pub fn new(queue: Arc<PriorityQueueManager>) -> Self {
        Self {
            queue,
            entries: TaskEntries::default(),
            sdi: None,
        }
    }

    /// Skip providers whose facade reports no capacity
    #[must_use]
    pub fn with_sdi(mut self, sdi: Arc<SdiRegistry>) -> Self {
        self.sdi = Some(sdi);
        self
    }
}

impl Scheduler for FcfsScheduler {
    fn name(&self) -> &'static str {
        "fcfs"
    }

    fn enqueue(&self, task: Arc<Task>) -> Vec<EntryId> {
        self.entries.enqueue(&self.queue, task)
    }

    fn schedule(&self, work: &WorkTable) -> Option<ScheduledTask> {
        let head = self
            .queue
            .get_all_models()
            .into_iter()
            .filter(|key| work.available(&key.model_id) > 0)
            .filter(|key| provider_admits(self.sdi.as_ref(), key))
            .find_map(|key| self.queue.peek_entry(&key.model_id, &key.provider_id))?;
        self.entries.claim(&self.queue, &head)
    }

    fn cancel(&self, task_id: TaskId) -> usize {
        self.entries.cancel(&self.queue, task_id)
    }

    fn withdraw_provider(&self, provider_id: &str) -> Vec<Arc<Task>> {
        self.entries.withdraw_provider(&self.queue, provider_id)
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn queue(&self) -> &Arc<PriorityQueueManager> {
        &self.queue
    }
}

/// Score-based scheduler
///
/// Peeks the head of every key whose model has a free slot, scores each and
/// dequeues only the winner. Equal scores go to the entry enqueued first.
pub struct PriorityScheduler {
    queue: Arc<PriorityQueueManager>,
    entries: TaskEntries,
    scoring: ScoringConfig,
    sdi: Option<Arc<SdiRegistry>>,
}

impl PriorityScheduler {
    /// Schedule from the given queue with default weights
    #[must_use]
    pub fn new(queue: Arc<PriorityQueueManager>) -> Self {
        Self {
            queue,
            entries: TaskEntries::default(),
            scoring: ScoringConfig::default(),
            sdi: None,
        }
    }

    /// Override the score weights
    #[must_use]
    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    /// Consult provider facades for warm/cold state and capacity
    #[must_use]
    pub fn with_sdi(mut self, sdi: Arc<SdiRegistry>) -> Self {
        self.sdi = Some(sdi);
        self
    }

    /// Score of one queue head
    #[must_use]
    pub fn score(&self, head: &EntrySnapshot, free_slots: usize) -> f64 {
        let s = &self.scoring;
        let depth = self.queue.model_depth(&head.model_id);
        let cold = self
            .sdi
            .as_ref()
            .and_then(|sdi| sdi.model_status(&head.model_id, &head.provider_id))
            .is_some_and(|status| !status.is_loaded);

        let mut score = s.priority_weight * f64::from(head.priority.value())
            - s.depth_weight * depth as f64
            + s.slot_weight * free_slots as f64;
        if cold {
            score -= s.cold_start_penalty;
        }
        score
    }
}

impl Scheduler for PriorityScheduler {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn enqueue(&self, task: Arc<Task>) -> Vec<EntryId> {
        self.entries.enqueue(&self.queue, task)
    }

    fn schedule(&self, work: &WorkTable) -> Option<ScheduledTask> {
        let mut best: Option<(f64, EntrySnapshot)> = None;

        for key in self.queue.get_all_models() {
            let free = work.available(&key.model_id);
            if free == 0 || !provider_admits(self.sdi.as_ref(), &key) {
                continue;
            }
            let Some(head) = self.queue.peek_entry(&key.model_id, &key.provider_id) else {
                continue;
            };
            let score = self.score(&head, free);
            tracing::trace!(key = %key, score, entry_id = %head.entry_id, "Scored queue head");

            let better = match &best {
                None => true,
                Some((best_score, current)) => {
                    score > best_score + EPS
                        || ((score - best_score).abs() <= EPS
                            && (head.enqueue_time, head.entry_id)
                                < (current.enqueue_time, current.entry_id))
                }
            };
            if better {
                best = Some((score, head));
            }
        }

        let (score, winner) = best?;
        tracing::debug!(
            model_id = %winner.model_id,
            provider_id = %winner.provider_id,
            entry_id = %winner.entry_id,
            score,
            "Selected entry"
        );
        self.entries.claim(&self.queue, &winner)
    }

    fn cancel(&self, task_id: TaskId) -> usize {
        self.entries.cancel(&self.queue, task_id)
    }

    fn withdraw_provider(&self, provider_id: &str) -> Vec<Arc<Task>> {
        self.entries.withdraw_provider(&self.queue, provider_id)
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn queue(&self) -> &Arc<PriorityQueueManager> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::task::{Candidate, Ticket};
    use crate::sdi::{AzureConfig, AzureSdi, CapacityInfo, ModelStatus, ProviderMetrics, SchedulingDataInterface};
    use pretty_assertions::assert_eq;

    fn task(ticket: u64, candidates: &[(&str, Priority)]) -> Arc<Task> {
        Arc::new(Task::new(
            Ticket(ticket),
            serde_json::Value::Null,
            candidates
                .iter()
                .map(|(m, p)| Candidate::new(*m, "p", 1.0, *p))
                .collect(),
        ))
    }

    fn work(slots: &[(&str, usize)]) -> WorkTable {
        slots.iter().map(|(m, s)| ((*m).to_string(), *s)).collect()
    }

    #[test]
    fn test_scheduler_kind_from_str() {
        assert_eq!("FCFS".parse::<SchedulerKind>(), Ok(SchedulerKind::Fcfs));
        assert_eq!("priority".parse::<SchedulerKind>(), Ok(SchedulerKind::Priority));
        assert!("lottery".parse::<SchedulerKind>().is_err());
    }

    #[test]
    fn test_fcfs_registration_order() {
        let scheduler = FcfsScheduler::new(Arc::new(PriorityQueueManager::new()));
        scheduler.enqueue(task(1, &[("a", Priority::Low)]));
        scheduler.enqueue(task(2, &[("b", Priority::High)]));

        let slots = work(&[("a", 1), ("b", 1)]);
        assert_eq!(scheduler.schedule(&slots).map(|s| s.task.ticket), Some(Ticket(1)));
        assert_eq!(scheduler.schedule(&slots).map(|s| s.task.ticket), Some(Ticket(2)));
        assert!(scheduler.schedule(&slots).is_none());
    }

    #[test]
    fn test_zero_slots_never_selected() {
        let queue = Arc::new(PriorityQueueManager::new());
        let fcfs = FcfsScheduler::new(Arc::clone(&queue));
        fcfs.enqueue(task(1, &[("busy", Priority::High)]));
        assert!(fcfs.schedule(&work(&[("busy", 0)])).is_none());
        assert!(fcfs.schedule(&WorkTable::new()).is_none());

        let priority = PriorityScheduler::new(Arc::new(PriorityQueueManager::new()));
        priority.enqueue(task(2, &[("busy", Priority::High)]));
        priority.enqueue(task(3, &[("idle", Priority::Low)]));
        let picked = priority.schedule(&work(&[("busy", 0), ("idle", 1)])).unwrap();
        assert_eq!(picked.model_id, "idle");
        assert!(priority.schedule(&work(&[("busy", 0), ("idle", 1)])).is_none());
    }

    #[test]
    fn test_priority_prefers_higher_tier() {
        let scheduler = PriorityScheduler::new(Arc::new(PriorityQueueManager::new()));
        scheduler.enqueue(task(1, &[("a", Priority::Normal)]));
        scheduler.enqueue(task(2, &[("b", Priority::High)]));

        let picked = scheduler.schedule(&work(&[("a", 1), ("b", 1)])).unwrap();
        assert_eq!(picked.task.ticket, Ticket(2));
        assert_eq!(picked.priority, Priority::High);
    }

    #[test]
    fn test_priority_tie_goes_to_earliest() {
        let scheduler = PriorityScheduler::new(Arc::new(PriorityQueueManager::new()));
        scheduler.enqueue(task(1, &[("a", Priority::Normal)]));
        scheduler.enqueue(task(2, &[("b", Priority::Normal)]));

        let picked = scheduler.schedule(&work(&[("a", 1), ("b", 1)])).unwrap();
        assert_eq!(picked.task.ticket, Ticket(1));
    }

    #[test]
    fn test_priority_score_formula() {
        let queue = Arc::new(PriorityQueueManager::new());
        let scheduler = PriorityScheduler::new(Arc::clone(&queue));
        scheduler.enqueue(task(1, &[("a", Priority::High)]));
        scheduler.enqueue(task(2, &[("a", Priority::Low)]));

        let head = queue.peek_entry("a", "p").unwrap();
        // 10*10 - 0.1*2 + 1*3
        assert!((scheduler.score(&head, 3) - 102.8).abs() < 1e-9);
    }

    #[test]
    fn test_deeper_queue_loses_tie_on_slots() {
        let scheduler = PriorityScheduler::new(Arc::new(PriorityQueueManager::new()));
        scheduler.enqueue(task(1, &[("deep", Priority::Normal)]));
        scheduler.enqueue(task(2, &[("deep", Priority::Normal)]));
        scheduler.enqueue(task(3, &[("deep", Priority::Normal)]));
        scheduler.enqueue(task(4, &[("shallow", Priority::Normal)]));

        let picked = scheduler.schedule(&work(&[("deep", 1), ("shallow", 1)])).unwrap();
        assert_eq!(picked.model_id, "shallow");
    }

    struct ColdSdi;

    impl SchedulingDataInterface for ColdSdi {
        fn name(&self) -> &str {
            "cold"
        }

        fn get_model_status(&self, model_id: &str) -> ModelStatus {
            ModelStatus {
                is_loaded: model_id != "cold",
                queue_state: None,
                metrics: ProviderMetrics::Unknown,
            }
        }

        fn get_capacity_info(&self, _provider_id: &str, _deployment: &str) -> CapacityInfo {
            CapacityInfo {
                has_capacity: true,
                metrics: ProviderMetrics::Unknown,
            }
        }
    }

    #[test]
    fn test_cold_model_penalised() {
        let sdi = Arc::new(SdiRegistry::new());
        sdi.register("p", Arc::new(ColdSdi));
        let scheduler = PriorityScheduler::new(Arc::new(PriorityQueueManager::new())).with_sdi(sdi);
        scheduler.enqueue(task(1, &[("cold", Priority::Normal)]));
        scheduler.enqueue(task(2, &[("warm", Priority::Normal)]));

        let picked = scheduler.schedule(&work(&[("cold", 1), ("warm", 1)])).unwrap();
        assert_eq!(picked.model_id, "warm");
    }

    #[test]
    fn test_exhausted_provider_is_skipped() {
        let azure = Arc::new(AzureSdi::new(AzureConfig::default()));
        azure.update_rate_limits("azure-eu", "gpt-4o", Some(0), Some(0));
        let sdi = Arc::new(SdiRegistry::new());
        let facade: Arc<dyn SchedulingDataInterface> = azure.clone();
        sdi.register("azure-eu", facade);

        let schedulers: Vec<Arc<dyn Scheduler>> = vec![
            build_scheduler(
                SchedulerKind::Fcfs,
                Arc::new(PriorityQueueManager::new()),
                ScoringConfig::default(),
                Some(Arc::clone(&sdi)),
            ),
            build_scheduler(
                SchedulerKind::Priority,
                Arc::new(PriorityQueueManager::new()),
                ScoringConfig::default(),
                Some(Arc::clone(&sdi)),
            ),
        ];
        let slots = work(&[("gpt-4o", 1), ("llama3", 1)]);

        for scheduler in &schedulers {
            scheduler.enqueue(Arc::new(Task::new(
                Ticket(1),
                serde_json::Value::Null,
                vec![Candidate::new("gpt-4o", "azure-eu", 1.0, Priority::High)],
            )));
            assert!(scheduler.schedule(&slots).is_none(), "{} scheduled onto a full deployment", scheduler.name());

            scheduler.enqueue(Arc::new(Task::new(
                Ticket(2),
                serde_json::Value::Null,
                vec![Candidate::new("llama3", "ollama-local", 1.0, Priority::Low)],
            )));
            assert_eq!(scheduler.schedule(&slots).map(|s| s.model_id), Some("llama3".to_string()));
        }

        azure.update_rate_limits("azure-eu", "gpt-4o", Some(500), Some(50_000));
        for scheduler in &schedulers {
            assert_eq!(scheduler.schedule(&slots).map(|s| s.task.ticket), Some(Ticket(1)));
        }
    }

    #[test]
    fn test_withdraw_provider_reports_orphans() {
        let queue = Arc::new(PriorityQueueManager::new());
        let scheduler = PriorityScheduler::new(Arc::clone(&queue));
        let both = Arc::new(Task::new(
            Ticket(1),
            serde_json::Value::Null,
            vec![
                Candidate::new("qwen2", "gone", 2.0, Priority::Normal),
                Candidate::new("llama3", "local", 1.0, Priority::Normal),
            ],
        ));
        let only_gone = Arc::new(Task::new(
            Ticket(2),
            serde_json::Value::Null,
            vec![Candidate::new("qwen2", "gone", 1.0, Priority::Normal)],
        ));
        scheduler.enqueue(Arc::clone(&both));
        scheduler.enqueue(Arc::clone(&only_gone));

        let orphaned = scheduler.withdraw_provider("gone");
        assert_eq!(orphaned.iter().map(|t| t.ticket).collect::<Vec<_>>(), vec![Ticket(2)]);
        assert_eq!(queue.get_total_depth(), 1);

        let picked = scheduler.schedule(&work(&[("qwen2", 1), ("llama3", 1)])).unwrap();
        assert_eq!((picked.task.ticket, picked.model_id.as_str()), (Ticket(1), "llama3"));
        assert_eq!(scheduler.cancel(only_gone.id), 0);
    }

    #[test]
    fn test_task_scheduled_once_across_candidates() {
        let queue = Arc::new(PriorityQueueManager::new());
        let scheduler = PriorityScheduler::new(Arc::clone(&queue));
        let ids = scheduler.enqueue(task(1, &[("a", Priority::High), ("b", Priority::Normal)]));
        assert_eq!(ids.len(), 2);
        assert_eq!(queue.get_total_depth(), 2);

        let slots = work(&[("a", 1), ("b", 1)]);
        let picked = scheduler.schedule(&slots).unwrap();
        assert_eq!(picked.model_id, "a");
        assert!(queue.is_empty());
        assert!(scheduler.schedule(&slots).is_none());
    }

    #[test]
    fn test_cancel_withdraws_all_entries() {
        let queue = Arc::new(PriorityQueueManager::new());
        let scheduler = FcfsScheduler::new(Arc::clone(&queue));
        let t = task(1, &[("a", Priority::High), ("b", Priority::Normal)]);
        scheduler.enqueue(Arc::clone(&t));

        assert_eq!(scheduler.cancel(t.id), 2);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.cancel(t.id), 0);
    }

    #[test]
    fn test_build_selects_kind() {
        let queue = Arc::new(PriorityQueueManager::new());
        let fcfs = build_scheduler(SchedulerKind::Fcfs, Arc::clone(&queue), ScoringConfig::default(), None);
        let prio = build_scheduler(SchedulerKind::Priority, queue, ScoringConfig::default(), None);
        assert_eq!(fcfs.name(), "fcfs");
        assert_eq!(prio.name(), "priority");
    }
}
