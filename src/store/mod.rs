//! Shared task store: persistence primitives for tasks, concurrency slots
//! and system locks.
//!
//! Concurrency correctness across independent worker processes lives
//! entirely in this trait's contract: every check-and-mutate operation
//! (`enqueue` dedup, `claim_next`, `promote_due`, `acquire_slot`, the
//! execution locks) is a single atomic operation against the backend. The
//! caller supplies `now` wherever time matters, so the store itself never
//! reads a clock.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::model::{NewTask, QueueCounts, SlotInfo, Task, TaskId, TaskState};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// What happened when a task was enqueued.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// New task inserted (queued, or scheduled when delayed).
    Created(Task),
    /// An unresolved task with the same (queue, unique_key) already exists;
    /// nothing was inserted.
    Deduplicated(Task),
}

impl EnqueueOutcome {
    pub fn task(&self) -> &Task {
        match self {
            EnqueueOutcome::Created(t) | EnqueueOutcome::Deduplicated(t) => t,
        }
    }
}

/// Where a failed task went after `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Retry budget remains: rescheduled for the given instant.
    Scheduled(DateTime<Utc>),
    /// Budget exhausted: the task is now in `Error`.
    Exhausted,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    // -- task lifecycle ----------------------------------------------------

    /// Insert a task as `Queued` (or `Scheduled` when delayed), deduplicating
    /// against `unique_key` among unresolved tasks of the same queue.
    async fn enqueue(&self, new: NewTask, now: DateTime<Utc>) -> Result<EnqueueOutcome>;

    /// Atomically claim the oldest queued task of `queue`: `Queued -> Active`.
    /// FIFO by time of entry into the queued state, ties by insertion order.
    /// `None` when the queue has no claimable task.
    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Task>>;

    /// Terminal success: remove the task entirely. Idempotent.
    async fn complete(&self, id: TaskId) -> Result<()>;

    /// Consume one retry: `Active -> Scheduled` at `now + delay` while budget
    /// remains, `Active -> Error` once exhausted. Records the failure message.
    async fn retry(
        &self,
        id: TaskId,
        error: &str,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome>;

    /// Non-retryable failure: `Active -> Dead`.
    async fn fail(&self, id: TaskId, error: &str) -> Result<()>;

    /// Push an active task back to `Scheduled` without consuming a retry.
    /// Used when its execution lock is contended.
    async fn defer(&self, id: TaskId, execute_at: DateTime<Utc>) -> Result<()>;

    /// Move every scheduled task of `queue` with `execute_at <= now` into
    /// `Queued`, returning the promoted tasks. Concurrent callers promote
    /// each task exactly once.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Operator action: `Error|Dead -> Queued` with a fresh retry budget.
    /// `false` when the task is not in a resting state.
    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool>;

    /// Operator action: drop a task that has not started. `false` unless the
    /// task was `Queued` or `Scheduled`.
    async fn cancel(&self, id: TaskId) -> Result<bool>;

    // -- inspection --------------------------------------------------------

    async fn get(&self, id: TaskId) -> Result<Option<Task>>;

    async fn list(
        &self,
        queue: Option<&str>,
        state: Option<TaskState>,
        limit: i64,
    ) -> Result<Vec<Task>>;

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Distinct queue names currently holding tasks in any state.
    async fn list_queues(&self) -> Result<Vec<String>>;

    // -- concurrency slots -------------------------------------------------

    /// Atomically: deny when the queue's system lock is held, deny when
    /// live slots (other workers') have reached `max_workers`, otherwise
    /// register or refresh this worker's slot with `expires_at = now + ttl`.
    /// Two racing callers never both take the last slot.
    async fn acquire_slot(
        &self,
        queue: &str,
        worker_id: &str,
        max_workers: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Heartbeat: extend a live slot to `now + ttl`. `false` when the slot
    /// has already expired. An expired slot must not be resurrected, its
    /// budget may have been handed to another worker.
    async fn renew_slot(
        &self,
        queue: &str,
        worker_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Free the slot immediately. Idempotent.
    async fn release_slot(&self, queue: &str, worker_id: &str) -> Result<()>;

    /// Live (unexpired) slots for a queue.
    async fn list_slots(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<SlotInfo>>;

    // -- system lock -------------------------------------------------------

    /// Set the queue's suspension deadline, overwriting any prior value.
    async fn set_system_lock(&self, queue: &str, until: DateTime<Utc>) -> Result<()>;

    /// Raw stored deadline, if any. Callers compare against their own `now`;
    /// an expired value may linger until overwritten.
    async fn system_lock(&self, queue: &str) -> Result<Option<DateTime<Utc>>>;

    // -- execution locks ---------------------------------------------------

    /// Take the per-task execution lock `(queue, key)` for `holder` with
    /// `expires_at = now + ttl`. Succeeds when free, expired, or already
    /// held by the same holder (refresh). One atomic operation.
    async fn acquire_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Heartbeat for an execution lock held by `holder`.
    async fn renew_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Release the execution lock if `holder` owns it. Idempotent.
    async fn release_execution_lock(&self, queue: &str, key: &str, holder: &str) -> Result<()>;

    // -- health ------------------------------------------------------------

    async fn health_check(&self) -> Result<()>;
}
