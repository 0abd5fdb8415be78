//! Priority Queue Manager
//!
//! Tiered FIFO queues keyed by `(model, provider)`.
//!
//! # Layout
//!
//! ```text
//! (model, provider) ──> [ HIGH   | e7 e9       ]
//!                       [ NORMAL | e1 e2 e5    ]
//!                       [ LOW    | e3          ]
//! ```
//!
//! Entries live in one table indexed by [`EntryId`]; the tier deques only hold
//! ids. Within a tier, ids are kept sorted by enqueue time so an escalated
//! entry keeps its place relative to the entries it was submitted alongside.
//!
//! # Thread Safety
//!
//! Every operation takes the single manager-wide lock for its full duration,
//! so peek/dequeue/move are atomic with respect to each other. Nothing here
//! waits for space: admission control is the caller's decision.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::priority::Priority;
use super::task::Task;

/// Identifier of one queued entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Queue key: one model as served by one provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    /// Model identifier
    pub model_id: String,
    /// Provider identifier
    pub provider_id: String,
}

impl QueueKey {
    /// Create a key
    pub fn new(model_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            provider_id: provider_id.into(),
        }
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.model_id, self.provider_id)
    }
}

/// A queued task
#[derive(Clone, Debug)]
pub struct QueueEntry {
    /// Entry identifier
    pub entry_id: EntryId,
    /// The queued task
    pub task: Arc<Task>,
    /// Model this entry waits for
    pub model_id: String,
    /// Provider this entry waits for
    pub provider_id: String,
    /// Tier the entry was submitted with
    pub original_priority: Priority,
    /// Tier the entry currently sits in
    pub current_priority: Priority,
    /// When the entry was enqueued
    pub enqueue_time: Instant,
    /// How many times the entry was moved between tiers
    pub escalation_count: u32,
    /// When the entry was last moved
    pub last_escalation_time: Option<Instant>,
}

impl QueueEntry {
    fn key(&self) -> QueueKey {
        QueueKey::new(self.model_id.clone(), self.provider_id.clone())
    }

    /// Time spent waiting so far
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.enqueue_time.elapsed()
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            entry_id: self.entry_id,
            model_id: self.model_id.clone(),
            provider_id: self.provider_id.clone(),
            original_priority: self.original_priority,
            priority: self.current_priority,
            enqueue_time: self.enqueue_time,
            escalation_count: self.escalation_count,
        }
    }
}

/// Read-only view of an entry, safe to hand out without the lock
#[derive(Clone, Debug)]
pub struct EntrySnapshot {
    /// Entry identifier
    pub entry_id: EntryId,
    /// Model identifier
    pub model_id: String,
    /// Provider identifier
    pub provider_id: String,
    /// Tier at submission
    pub original_priority: Priority,
    /// Current tier
    pub priority: Priority,
    /// When the entry was enqueued
    pub enqueue_time: Instant,
    /// Number of tier moves
    pub escalation_count: u32,
}

/// Per-tier entry counts for one key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatePerPriority {
    /// Entries in the low tier
    pub low: usize,
    /// Entries in the normal tier
    pub normal: usize,
    /// Entries in the high tier
    pub high: usize,
}

impl QueueStatePerPriority {
    /// Total entries across tiers
    #[must_use]
    pub fn total(&self) -> usize {
        self.low + self.normal + self.high
    }

    /// Entries in one tier
    #[must_use]
    pub fn count(&self, priority: Priority) -> usize {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.low += other.low;
        self.normal += other.normal;
        self.high += other.high;
    }
}

/// The three tiers of one key (index 0 = low, 2 = high)
#[derive(Debug, Default)]
struct KeyQueues {
    tiers: [VecDeque<EntryId>; 3],
}

impl KeyQueues {
    fn state(&self) -> QueueStatePerPriority {
        QueueStatePerPriority {
            low: self.tiers[Priority::Low.tier_index()].len(),
            normal: self.tiers[Priority::Normal.tier_index()].len(),
            high: self.tiers[Priority::High.tier_index()].len(),
        }
    }

    fn front(&self, only: Option<Priority>) -> Option<EntryId> {
        match only {
            Some(priority) => self.tiers[priority.tier_index()].front().copied(),
            None => Priority::DESCENDING
                .iter()
                .find_map(|p| self.tiers[p.tier_index()].front().copied()),
        }
    }

    fn detach(&mut self, priority: Priority, entry_id: EntryId) -> bool {
        let tier = &mut self.tiers[priority.tier_index()];
        match tier.iter().position(|id| *id == entry_id) {
            Some(pos) => {
                tier.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    next_entry: u64,
    /// Keys in first-seen order
    order: Vec<QueueKey>,
    queues: HashMap<QueueKey, KeyQueues>,
    entries: HashMap<EntryId, QueueEntry>,
}

impl QueueInner {
    fn queues_for(&mut self, key: &QueueKey) -> &mut KeyQueues {
        if !self.queues.contains_key(key) {
            self.order.push(key.clone());
        }
        self.queues.entry(key.clone()).or_default()
    }

    fn take(&mut self, entry_id: EntryId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&entry_id)?;
        if let Some(queues) = self.queues.get_mut(&entry.key()) {
            queues.detach(entry.current_priority, entry_id);
        }
        Some(entry)
    }

    fn front(&self, key: &QueueKey, only: Option<Priority>) -> Option<&QueueEntry> {
        let id = self.queues.get(key)?.front(only)?;
        self.entries.get(&id)
    }
}

/// Tiered FIFO queues for every `(model, provider)` pair
#[derive(Debug, Default)]
pub struct PriorityQueueManager {
    inner: Mutex<QueueInner>,
}

impl PriorityQueueManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the given tier of a key
    pub fn enqueue(
        &self,
        task: Arc<Task>,
        model_id: &str,
        provider_id: &str,
        priority: Priority,
    ) -> EntryId {
        let mut inner = self.inner.lock();
        inner.next_entry += 1;
        let entry_id = EntryId(inner.next_entry);
        let key = QueueKey::new(model_id, provider_id);

        inner.queues_for(&key).tiers[priority.tier_index()].push_back(entry_id);
        inner.entries.insert(
            entry_id,
            QueueEntry {
                entry_id,
                task,
                model_id: key.model_id,
                provider_id: key.provider_id,
                original_priority: priority,
                current_priority: priority,
                enqueue_time: Instant::now(),
                escalation_count: 0,
                last_escalation_time: None,
            },
        );

        tracing::trace!(%entry_id, model_id, provider_id, %priority, "Enqueued");
        entry_id
    }

    /// Best entry of a key without removing it
    #[must_use]
    pub fn peek(&self, model_id: &str, provider_id: &str) -> Option<(Arc<Task>, Priority)> {
        let inner = self.inner.lock();
        inner
            .front(&QueueKey::new(model_id, provider_id), None)
            .map(|e| (Arc::clone(&e.task), e.current_priority))
    }

    /// Like [`peek`](Self::peek) but returns the entry metadata
    #[must_use]
    pub fn peek_entry(&self, model_id: &str, provider_id: &str) -> Option<EntrySnapshot> {
        let inner = self.inner.lock();
        inner
            .front(&QueueKey::new(model_id, provider_id), None)
            .map(QueueEntry::snapshot)
    }

    /// Remove and return the best task of a key
    ///
    /// With `priority` set, only that tier is considered; an empty tier
    /// yields `None` even when other tiers hold work.
    pub fn dequeue(
        &self,
        model_id: &str,
        provider_id: &str,
        priority: Option<Priority>,
    ) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock();
        let entry_id = inner
            .front(&QueueKey::new(model_id, provider_id), priority)?
            .entry_id;
        inner.take(entry_id).map(|e| e.task)
    }

    /// Remove one specific entry and return it
    pub fn dequeue_entry(&self, entry_id: EntryId) -> Option<QueueEntry> {
        self.inner.lock().take(entry_id)
    }

    /// Move an entry to another tier
    ///
    /// Returns `false` if the entry is no longer queued.
    pub fn move_priority(&self, entry_id: EntryId, new_priority: Priority) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(&entry_id) else {
            return false;
        };
        let key = entry.key();
        let old_priority = entry.current_priority;
        let sort_key = (entry.enqueue_time, entry.entry_id);

        let Some(queues) = inner.queues.get(&key) else {
            return false;
        };
        let target = &queues.tiers[new_priority.tier_index()];
        let position = target
            .iter()
            .position(|other| {
                inner
                    .entries
                    .get(other)
                    .is_some_and(|o| (o.enqueue_time, o.entry_id) > sort_key)
            })
            .unwrap_or(target.len());

        if let Some(queues) = inner.queues.get_mut(&key) {
            queues.detach(old_priority, entry_id);
            queues.tiers[new_priority.tier_index()].insert(position, entry_id);
        }
        if let Some(entry) = inner.entries.get_mut(&entry_id) {
            entry.current_priority = new_priority;
            entry.escalation_count += 1;
            entry.last_escalation_time = Some(Instant::now());
        }

        tracing::debug!(%entry_id, from = %old_priority, to = %new_priority, "Moved entry");
        true
    }

    /// Delete an entry wherever it resides
    pub fn remove(&self, entry_id: EntryId) -> bool {
        self.inner.lock().take(entry_id).is_some()
    }

    /// Delete every entry waiting for a provider and drop its keys
    pub fn remove_provider(&self, provider_id: &str) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        let ids: Vec<EntryId> = inner
            .entries
            .values()
            .filter(|e| e.provider_id == provider_id)
            .map(|e| e.entry_id)
            .collect();
        let mut removed: Vec<QueueEntry> = ids.into_iter().filter_map(|id| inner.take(id)).collect();
        removed.sort_by_key(|e| (e.enqueue_time, e.entry_id));

        inner.order.retain(|key| key.provider_id != provider_id);
        inner.queues.retain(|key, _| key.provider_id != provider_id);
        removed
    }

    /// Per-tier counts for one key
    #[must_use]
    pub fn get_state(&self, model_id: &str, provider_id: &str) -> QueueStatePerPriority {
        let inner = self.inner.lock();
        inner
            .queues
            .get(&QueueKey::new(model_id, provider_id))
            .map(KeyQueues::state)
            .unwrap_or_default()
    }

    /// Per-tier counts for a model summed over every provider
    #[must_use]
    pub fn get_model_state(&self, model_id: &str) -> QueueStatePerPriority {
        let inner = self.inner.lock();
        let mut state = QueueStatePerPriority::default();
        for (key, queues) in &inner.queues {
            if key.model_id == model_id {
                state.merge(&queues.state());
            }
        }
        state
    }

    /// Queue depth of a model across every provider
    #[must_use]
    pub fn model_depth(&self, model_id: &str) -> usize {
        self.get_model_state(model_id).total()
    }

    /// Every key seen so far, in first-enqueue order
    #[must_use]
    pub fn get_all_models(&self) -> Vec<QueueKey> {
        self.inner.lock().order.clone()
    }

    /// Whether no entry is queued anywhere
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Number of entries across all keys
    #[must_use]
    pub fn get_total_depth(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Look up an entry
    #[must_use]
    pub fn entry(&self, entry_id: EntryId) -> Option<EntrySnapshot> {
        self.inner.lock().entries.get(&entry_id).map(QueueEntry::snapshot)
    }

    /// Entries that have waited longer than `max_wait`, oldest first
    ///
    /// Escalation policy is up to the caller; this is the query it needs.
    #[must_use]
    pub fn entries_waiting_longer_than(&self, max_wait: Duration) -> Vec<EntrySnapshot> {
        let inner = self.inner.lock();
        let mut aged: Vec<EntrySnapshot> = inner
            .entries
            .values()
            .filter(|e| e.waited() > max_wait)
            .map(QueueEntry::snapshot)
            .collect();
        aged.sort_by_key(|e| (e.enqueue_time, e.entry_id));
        aged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::task::Ticket;
    use pretty_assertions::assert_eq;

    fn task(n: u64) -> Arc<Task> {
        Arc::new(Task::new(Ticket(n), serde_json::json!(n), Vec::new()))
    }

    fn drain(queue: &PriorityQueueManager) -> Vec<u64> {
        std::iter::from_fn(|| queue.dequeue("m", "p", None))
            .map(|t| t.ticket.0)
            .collect()
    }

    #[test]
    fn test_dequeue_tier_then_fifo() {
        let queue = PriorityQueueManager::new();
        queue.enqueue(task(1), "m", "p", Priority::Low);
        queue.enqueue(task(2), "m", "p", Priority::Normal);
        queue.enqueue(task(3), "m", "p", Priority::High);
        queue.enqueue(task(4), "m", "p", Priority::Normal);
        queue.enqueue(task(5), "m", "p", Priority::High);
        queue.enqueue(task(6), "m", "p", Priority::Low);

        assert_eq!(drain(&queue), vec![3, 5, 2, 4, 1, 6]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = PriorityQueueManager::new();
        queue.enqueue(task(1), "m", "p", Priority::Normal);

        let (peeked, priority) = queue.peek("m", "p").unwrap();
        assert_eq!(peeked.ticket, Ticket(1));
        assert_eq!(priority, Priority::Normal);
        assert_eq!(queue.get_total_depth(), 1);
        assert!(queue.peek("other", "p").is_none());
    }

    #[test]
    fn test_dequeue_restricted_tier() {
        let queue = PriorityQueueManager::new();
        queue.enqueue(task(1), "m", "p", Priority::Normal);

        assert!(queue.dequeue("m", "p", Some(Priority::High)).is_none());
        assert_eq!(queue.get_total_depth(), 1);
        assert_eq!(
            queue.dequeue("m", "p", Some(Priority::Normal)).map(|t| t.ticket),
            Some(Ticket(1))
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let queue = PriorityQueueManager::new();
        queue.enqueue(task(1), "m", "azure", Priority::High);
        queue.enqueue(task(2), "m", "ollama", Priority::Low);

        assert_eq!(queue.get_state("m", "azure").high, 1);
        assert_eq!(queue.get_state("m", "ollama").low, 1);
        assert_eq!(queue.model_depth("m"), 2);
        assert_eq!(
            queue.get_all_models(),
            vec![QueueKey::new("m", "azure"), QueueKey::new("m", "ollama")]
        );
    }

    #[test]
    fn test_move_priority_escalates() {
        let queue = PriorityQueueManager::new();
        queue.enqueue(task(1), "m", "p", Priority::Normal);
        let low = queue.enqueue(task(2), "m", "p", Priority::Low);

        assert!(queue.move_priority(low, Priority::High));

        let entry = queue.entry(low).unwrap();
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(entry.original_priority, Priority::Low);
        assert_eq!(entry.escalation_count, 1);
        assert_eq!(queue.get_state("m", "p"), QueueStatePerPriority { low: 0, normal: 1, high: 1 });
        assert_eq!(drain(&queue), vec![2, 1]);
    }

    #[test]
    fn test_moved_entry_keeps_enqueue_order() {
        let queue = PriorityQueueManager::new();
        let first = queue.enqueue(task(1), "m", "p", Priority::Low);
        queue.enqueue(task(2), "m", "p", Priority::Normal);

        assert!(queue.move_priority(first, Priority::Normal));
        assert_eq!(drain(&queue), vec![1, 2]);
    }

    #[test]
    fn test_move_unknown_entry_is_noop() {
        let queue = PriorityQueueManager::new();
        let id = queue.enqueue(task(1), "m", "p", Priority::Normal);
        let before = queue.get_state("m", "p");

        assert!(!queue.move_priority(EntryId(9999), Priority::High));
        assert_eq!(queue.get_state("m", "p"), before);

        queue.remove(id);
        assert!(!queue.move_priority(id, Priority::High));
    }

    #[test]
    fn test_remove() {
        let queue = PriorityQueueManager::new();
        let a = queue.enqueue(task(1), "m", "p", Priority::High);
        queue.enqueue(task(2), "m", "p", Priority::High);

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(queue.get_state("m", "p").total(), 1);
        assert_eq!(drain(&queue), vec![2]);
    }

    #[test]
    fn test_remove_provider_drops_its_keys() {
        let queue = PriorityQueueManager::new();
        queue.enqueue(task(1), "qwen2", "gone", Priority::Normal);
        queue.enqueue(task(2), "llama3", "local", Priority::Normal);
        queue.enqueue(task(3), "phi3", "gone", Priority::High);

        let removed: Vec<u64> = queue.remove_provider("gone").iter().map(|e| e.task.ticket.0).collect();
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(queue.get_total_depth(), 1);
        assert_eq!(queue.get_all_models(), vec![QueueKey::new("llama3", "local")]);
        assert!(queue.remove_provider("gone").is_empty());
    }

    #[test]
    fn test_state_total_tracks_live_entries() {
        let queue = PriorityQueueManager::new();
        let mut ids = Vec::new();
        for n in 0..30u64 {
            let priority = Priority::DESCENDING[(n % 3) as usize];
            ids.push(queue.enqueue(task(n), "m", "p", priority));
        }
        assert_eq!(queue.get_state("m", "p").total(), 30);

        for id in ids.iter().step_by(4) {
            queue.remove(*id);
        }
        for id in ids.iter().skip(1).step_by(5) {
            queue.move_priority(*id, Priority::Low);
        }
        queue.dequeue("m", "p", None);
        queue.dequeue("m", "p", Some(Priority::Low));

        assert_eq!(queue.get_state("m", "p").total(), queue.get_total_depth());
    }

    #[test]
    fn test_aged_entries() {
        let queue = PriorityQueueManager::new();
        queue.enqueue(task(1), "m", "p", Priority::Low);
        std::thread::sleep(Duration::from_millis(20));
        queue.enqueue(task(2), "m", "p", Priority::Low);

        let aged = queue.entries_waiting_longer_than(Duration::from_millis(10));
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].model_id, "m");
    }

    #[test]
    fn test_concurrent_enqueue_dequeue() {
        let queue = Arc::new(PriorityQueueManager::new());
        let mut handles = Vec::new();

        for worker in 0..8u64 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for n in 0..100 {
                    queue.enqueue(task(worker * 1000 + n), "m", "p", Priority::Normal);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.get_total_depth(), 800);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let mut taken = 0;
                while queue.dequeue("m", "p", None).is_some() {
                    taken += 1;
                }
                taken
            }));
        }
        let taken: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(taken, 800);
        assert!(queue.is_empty());
    }
}
