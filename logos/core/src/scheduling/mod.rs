//! Request Scheduling
//!
//! Tiered queues, the scheduling strategies that drain them, and the
//! ticket-based manager that runs the loop.
//!
//! # Flow
//!
//! ```text
//! add_request ──> Scheduler::enqueue ──> PriorityQueueManager (one entry per candidate)
//!                                               │
//!   scheduling loop: WorkTable ──> Scheduler::schedule ──> ScheduledResult by ticket
//!                                                               │
//!                          caller runs the provider call, then complete / set_free
//! ```

pub mod manager;
pub mod priority;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use manager::{ManagerConfig, ScheduledResult, SchedulingError, SchedulingManager};
pub use priority::Priority;
pub use queue::{EntryId, EntrySnapshot, PriorityQueueManager, QueueEntry, QueueKey, QueueStatePerPriority};
pub use scheduler::{
    build_scheduler, FcfsScheduler, PriorityScheduler, ScheduledTask, Scheduler, SchedulerKind, ScoringConfig,
    WorkTable,
};
pub use task::{Candidate, Task, TaskId, TaskOutcome, TaskStatus, Ticket};
