//! Task Types
//!
//! A task is one admitted inference request: an opaque payload plus the
//! ranked list of models that may serve it. The scheduler owns the queueing;
//! the caller owns the payload and the eventual provider call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::priority::Priority;

/// Task identifier, unique within the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate a new unique task ID
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Submission ticket, strictly increasing per scheduling manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A model that may serve a task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Model identifier
    pub model_id: String,
    /// Provider hosting the model
    pub provider_id: String,
    /// Classification weight (higher = better fit)
    pub weight: f64,
    /// Queue tier for this candidate
    pub priority: Priority,
}

impl Candidate {
    /// Create a candidate
    pub fn new(
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        weight: f64,
        priority: Priority,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            weight,
            priority,
        }
    }
}

/// An admitted request
#[derive(Debug)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Ticket handed to the submitter
    pub ticket: Ticket,
    /// Opaque request body, forwarded untouched
    pub payload: serde_json::Value,
    /// Candidate models, best first
    pub candidates: Vec<Candidate>,
    /// When the task was submitted
    pub submitted_at: Instant,
}

impl Task {
    /// Create a task for the given ticket
    #[must_use]
    pub fn new(ticket: Ticket, payload: serde_json::Value, candidates: Vec<Candidate>) -> Self {
        Self {
            id: TaskId::generate(),
            ticket,
            payload,
            candidates,
            submitted_at: Instant::now(),
        }
    }

    /// Look up the candidate entry for a model
    #[must_use]
    pub fn candidate_for(&self, model_id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.model_id == model_id)
    }
}

/// Lifecycle of a submitted task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in one or more queues
    Queued,
    /// A model was reserved; result waiting for (or handed to) the caller
    Scheduled,
    /// Provider call finished successfully
    Completed,
    /// Provider call failed
    Failed,
    /// Result was never claimed and its slot was reclaimed
    Expired,
}

impl TaskStatus {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// How the caller's provider call ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Provider answered
    Success,
    /// Provider call failed
    Failure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_candidate_lookup() {
        let task = Task::new(
            Ticket(1),
            serde_json::json!({"prompt": "hi"}),
            vec![
                Candidate::new("gpt-4o", "azure", 2.1, Priority::High),
                Candidate::new("llama3", "ollama", 1.4, Priority::Normal),
            ],
        );
        assert_eq!(task.candidate_for("llama3").map(|c| c.priority), Some(Priority::Normal));
        assert!(task.candidate_for("mistral").is_none());
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Expired.is_terminal());
    }
}
