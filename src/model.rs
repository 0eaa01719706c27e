//! Core data model.
//!
//! A task is a unit of work owned by a named queue. It has identity, an
//! opaque handler reference plus arguments, retry bookkeeping, and a
//! lifecycle state. Admission state (concurrency slots, system locks) lives
//! beside it in the shared store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fallback retry budget when the producer does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,

    /// Owning queue. Queues are flat namespaces; admission control is scoped
    /// to exactly one queue name.
    pub queue: String,

    /// Registry key of the handler that executes this task. Opaque to the
    /// engine; resolved by the worker's handler registry.
    pub handler: String,

    /// Arbitrary arguments for the handler. The engine doesn't interpret these.
    pub args: serde_json::Value,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Dedup key. While an unresolved task (queued, scheduled or active)
    /// with the same (queue, unique_key) exists, enqueuing another is a no-op.
    pub unique_key: Option<String>,

    /// Hold a per-task execution lock while running, keyed by `unique_key`
    /// (or the task id when unset). Contended executions are deferred.
    pub lock_on_execute: bool,

    /// Number of retries consumed so far.
    pub retry_count: u32,

    /// Retries allowed before the task lands in `Error`.
    pub max_retries: u32,

    /// Monotonic insertion sequence, assigned by the store. Tie-breaker for
    /// claim ordering when two tasks entered the queue at the same instant.
    pub position: i64,

    /// When a scheduled task becomes due. Meaningful only while `Scheduled`.
    pub execute_at: Option<DateTime<Utc>>,

    pub enqueued_at: DateTime<Utc>,
    /// When the task last entered the queued state. Claim ordering key.
    pub queued_at: Option<DateTime<Utc>>,
    /// When the task was last claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// Last failure message, retained for operator inspection.
    pub error_message: Option<String>,
}

impl Task {
    /// Key under which the execution lock is taken when `lock_on_execute`
    /// is set.
    pub fn execution_lock_key(&self) -> String {
        self.unique_key
            .clone()
            .unwrap_or_else(|| self.id.0.to_string())
    }
}

#[cfg(test)]
impl Task {
    /// Materialize a queued task directly, bypassing a store.
    pub(crate) fn for_test(new: NewTask, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id: TaskId::new(),
            queue: new.queue,
            handler: new.handler,
            args: new.args,
            state: TaskState::Queued,
            unique_key: new.unique_key,
            lock_on_execute: new.lock_on_execute,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            position: 0,
            execute_at: None,
            enqueued_at: now,
            queued_at: Some(now),
            started_at: None,
            error_message: None,
        }
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// A task is in exactly one state at any time; the store enforces this by
/// making every transition a single conditional mutation. Successful
/// completion removes the task instead of parking it in a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready for execution, waiting to be claimed.
    Queued,
    /// Waiting for `execute_at`; promoted to `Queued` when due.
    Scheduled,
    /// Claimed by a worker, executing.
    Active,
    /// Retryable failures exhausted the retry budget. Resting state.
    Error,
    /// Non-retryable failure or unroutable task. Resting state.
    Dead,
}

impl TaskState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Scheduled, Queued)     // promote
                | (Queued, Active)  // claim
                | (Active, Scheduled) // retry backoff, or defer on lock contention
                | (Active, Error)   // retries exhausted
                | (Active, Dead)    // permanent failure
                | (Error, Queued)   // operator requeue
                | (Dead, Queued) // operator requeue
        )
    }

    /// Still counts toward dedup: the task has not resolved yet.
    pub fn is_unresolved(self) -> bool {
        matches!(
            self,
            TaskState::Queued | TaskState::Scheduled | TaskState::Active
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Scheduled => "scheduled",
            TaskState::Active => "active",
            TaskState::Error => "error",
            TaskState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "scheduled" => Ok(TaskState::Scheduled),
            "active" => Ok(TaskState::Active),
            "error" => Ok(TaskState::Error),
            "dead" => Ok(TaskState::Dead),
            other => Err(crate::error::Error::Other(format!(
                "unknown task state: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue counts
// ---------------------------------------------------------------------------

/// Per-queue task counts by state. The primary inspection surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub scheduled: u64,
    pub active: u64,
    pub error: u64,
    pub dead: u64,
}

impl QueueCounts {
    pub fn is_empty(&self) -> bool {
        *self == QueueCounts::default()
    }
}

// ---------------------------------------------------------------------------
// Concurrency slot
// ---------------------------------------------------------------------------

/// One worker's occupancy of a queue's concurrency budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    pub queue: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    /// TTL deadline. Past this instant the slot no longer counts against the
    /// budget, whether or not the row has been collected.
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueuing tasks. The producer-facing API.
pub struct NewTask {
    pub(crate) queue: String,
    pub(crate) handler: String,
    pub(crate) args: serde_json::Value,
    pub(crate) delay_secs: Option<u64>,
    pub(crate) unique_key: Option<String>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) lock_on_execute: bool,
}

impl NewTask {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
            args: serde_json::Value::Null,
            delay_secs: None,
            unique_key: None,
            max_retries: None,
            lock_on_execute: false,
        }
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Schedule for `now + secs` instead of immediate execution.
    pub fn delay_secs(mut self, secs: u64) -> Self {
        self.delay_secs = Some(secs);
        self
    }

    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn lock_on_execute(mut self) -> Self {
        self.lock_on_execute = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_accepts_lifecycle_paths() {
        use TaskState::*;
        assert!(Scheduled.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Active));
        assert!(Active.can_transition_to(Scheduled));
        assert!(Active.can_transition_to(Error));
        assert!(Active.can_transition_to(Dead));
        assert!(Error.can_transition_to(Queued));
        assert!(Dead.can_transition_to(Queued));
    }

    #[test]
    fn transition_table_rejects_shortcuts() {
        use TaskState::*;
        assert!(!Queued.can_transition_to(Scheduled));
        assert!(!Queued.can_transition_to(Error));
        assert!(!Scheduled.can_transition_to(Active));
        assert!(!Error.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Error));
    }

    #[test]
    fn state_display_round_trips() {
        for state in [
            TaskState::Queued,
            TaskState::Scheduled,
            TaskState::Active,
            TaskState::Error,
            TaskState::Dead,
        ] {
            let parsed: TaskState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn task_id_short_display() {
        let id = TaskId::new();
        assert_eq!(id.to_string().len(), 8);
    }

    #[test]
    fn execution_lock_key_prefers_unique_key() {
        let mut task = Task {
            id: TaskId::new(),
            queue: "q".into(),
            handler: "h".into(),
            args: serde_json::Value::Null,
            state: TaskState::Queued,
            unique_key: Some("customer-7".into()),
            lock_on_execute: true,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            position: 1,
            execute_at: None,
            enqueued_at: Utc::now(),
            queued_at: None,
            started_at: None,
            error_message: None,
        };
        assert_eq!(task.execution_lock_key(), "customer-7");

        task.unique_key = None;
        assert_eq!(task.execution_lock_key(), task.id.0.to_string());
    }
}
