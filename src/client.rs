//! Producer and operator API.
//!
//! [`Client`] is the process-local entry point for everything that is not
//! task execution: enqueueing, inspection, system locks, and the operator
//! actions (cancel, requeue). Workers share the same store; a client never
//! talks to workers directly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;

use crate::clock::Clock;
use crate::error::Result;
use crate::lock::LockManager;
use crate::model::{NewTask, QueueCounts, SlotInfo, Task, TaskId, TaskState};
use crate::store::{EnqueueOutcome, TaskStore};
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    lock: LockManager,
}

impl Client {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        let lock = LockManager::new(store.clone(), clock.clone());
        Self { store, clock, lock }
    }

    /// Queue a task. With a `unique_key`, an unresolved duplicate wins and
    /// the existing task comes back instead.
    pub async fn enqueue(&self, new: NewTask) -> Result<EnqueueOutcome> {
        let outcome = self.store.enqueue(new, self.clock.now()).await?;
        let task = outcome.task();
        let result = match &outcome {
            EnqueueOutcome::Created(_) => "created",
            EnqueueOutcome::Deduplicated(_) => "deduplicated",
        };
        tracing::debug!(queue = task.queue, task = %task.id, result, "task enqueued");
        metrics::tasks_enqueued().add(
            1,
            &[
                KeyValue::new("queue", task.queue.clone()),
                KeyValue::new("result", result),
            ],
        );
        Ok(outcome)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        queue: Option<&str>,
        state: Option<TaskState>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        self.store.list(queue, state, limit).await
    }

    /// Drop a task that has not started yet. `false` once it is active or
    /// resting.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            tracing::info!(task = %id, "task cancelled");
        }
        Ok(cancelled)
    }

    /// Put a resting (`Error` or `Dead`) task back in the queue with a fresh
    /// retry budget.
    pub async fn requeue(&self, id: TaskId) -> Result<bool> {
        let requeued = self.store.requeue(id, self.clock.now()).await?;
        if requeued {
            tracing::info!(task = %id, "task requeued");
            metrics::task_transitions().add(1, &[KeyValue::new("to", "queued")]);
        }
        Ok(requeued)
    }

    pub async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        self.store.queue_counts(queue).await
    }

    pub async fn list_queues(&self) -> Result<Vec<String>> {
        self.store.list_queues().await
    }

    /// Suspend a queue for `duration` from now. Returns the deadline.
    pub async fn set_system_lock(&self, queue: &str, duration: Duration) -> Result<DateTime<Utc>> {
        self.lock.set_system_lock(queue, duration).await
    }

    pub async fn get_system_lock(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        self.lock.get_system_lock(queue).await
    }

    pub async fn live_slots(&self, queue: &str) -> Result<Vec<SlotInfo>> {
        self.lock.live_slots(queue).await
    }

    pub fn locks(&self) -> &LockManager {
        &self.lock
    }
}
