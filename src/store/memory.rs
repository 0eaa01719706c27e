//! In-memory [`TaskStore`] backed by a single mutex.
//!
//! Every operation takes the state lock for its whole duration, which makes
//! each one trivially atomic. Used for tests and for single-process embedded
//! setups that do not need durability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    DEFAULT_MAX_RETRIES, NewTask, QueueCounts, SlotInfo, Task, TaskId, TaskState,
};
use crate::store::{EnqueueOutcome, RetryOutcome, TaskStore};

#[derive(Debug, Clone)]
struct SlotEntry {
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    /// Keyed by (queue, worker_id).
    slots: HashMap<(String, String), SlotEntry>,
    /// Keyed by (queue, lock_key).
    execution_locks: HashMap<(String, String), LockEntry>,
    system_locks: HashMap<String, DateTime<Utc>>,
    next_position: i64,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    fn transition(&mut self, id: TaskId, to: TaskState) -> Result<&mut Task> {
        let task = self.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if !task.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: task.state,
                to,
            });
        }
        task.state = to;
        Ok(task)
    }

    fn purge_expired_slots(&mut self, queue: &str, now: DateTime<Utc>) {
        self.slots
            .retain(|(q, _), entry| q != queue || entry.expires_at > now);
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, new: NewTask, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;

        if let Some(key) = &new.unique_key {
            let existing = state.tasks.values().find(|t| {
                t.queue == new.queue
                    && t.unique_key.as_deref() == Some(key.as_str())
                    && t.state.is_unresolved()
            });
            if let Some(task) = existing {
                return Ok(EnqueueOutcome::Deduplicated(task.clone()));
            }
        }

        let position = state.next_position;
        state.next_position += 1;

        let (task_state, execute_at, queued_at) = match new.delay_secs {
            Some(secs) => (
                TaskState::Scheduled,
                Some(now + Duration::seconds(secs as i64)),
                None,
            ),
            None => (TaskState::Queued, None, Some(now)),
        };

        let task = Task {
            id: TaskId(Uuid::new_v4()),
            queue: new.queue,
            handler: new.handler,
            args: new.args,
            state: task_state,
            unique_key: new.unique_key,
            lock_on_execute: new.lock_on_execute,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            position,
            execute_at,
            enqueued_at: now,
            queued_at,
            started_at: None,
            error_message: None,
        };
        state.tasks.insert(task.id, task.clone());
        Ok(EnqueueOutcome::Created(task))
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut state = self.state.lock().await;

        let next = state
            .tasks
            .values()
            .filter(|t| t.queue == queue && t.state == TaskState::Queued)
            .min_by_key(|t| (t.queued_at, t.position))
            .map(|t| t.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let task = state.transition(id, TaskState::Active)?;
        task.started_at = Some(now);
        Ok(Some(task.clone()))
    }

    async fn complete(&self, id: TaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tasks.remove(&id);
        Ok(())
    }

    async fn retry(
        &self,
        id: TaskId,
        error: &str,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;

        let exhausted = task.retry_count + 1 > task.max_retries;
        let to = if exhausted {
            TaskState::Error
        } else {
            TaskState::Scheduled
        };
        if !task.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: task.state,
                to,
            });
        }

        task.state = to;
        task.retry_count += 1;
        task.error_message = Some(error.to_string());
        task.started_at = None;
        task.queued_at = None;
        if exhausted {
            task.execute_at = None;
            Ok(RetryOutcome::Exhausted)
        } else {
            let at = now + delay;
            task.execute_at = Some(at);
            Ok(RetryOutcome::Scheduled(at))
        }
    }

    async fn fail(&self, id: TaskId, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.transition(id, TaskState::Dead)?;
        task.error_message = Some(error.to_string());
        task.started_at = None;
        task.queued_at = None;
        task.execute_at = None;
        Ok(())
    }

    async fn defer(&self, id: TaskId, execute_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.transition(id, TaskState::Scheduled)?;
        task.execute_at = Some(execute_at);
        task.started_at = None;
        task.queued_at = None;
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut state = self.state.lock().await;

        let mut due: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| {
                t.queue == queue
                    && t.state == TaskState::Scheduled
                    && t.execute_at.is_some_and(|at| at <= now)
            })
            .map(|t| t.id)
            .collect();
        due.sort_by_key(|id| {
            let t = &state.tasks[id];
            (t.execute_at, t.position)
        });

        let mut promoted = Vec::with_capacity(due.len());
        for id in due {
            let task = state.transition(id, TaskState::Queued)?;
            task.queued_at = Some(now);
            task.execute_at = None;
            promoted.push(task.clone());
        }
        Ok(promoted)
    }

    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(task.state, TaskState::Error | TaskState::Dead) {
            return Ok(false);
        }
        task.state = TaskState::Queued;
        task.retry_count = 0;
        task.error_message = None;
        task.queued_at = Some(now);
        task.execute_at = None;
        task.started_at = None;
        Ok(true)
    }

    async fn cancel(&self, id: TaskId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let cancellable = state
            .tasks
            .get(&id)
            .is_some_and(|t| matches!(t.state, TaskState::Queued | TaskState::Scheduled));
        if cancellable {
            state.tasks.remove(&id);
        }
        Ok(cancellable)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn list(
        &self,
        queue: Option<&str>,
        state_filter: Option<TaskState>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| queue.is_none_or(|q| t.queue == q))
            .filter(|t| state_filter.is_none_or(|s| t.state == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.enqueued_at, t.position));
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for task in state.tasks.values().filter(|t| t.queue == queue) {
            match task.state {
                TaskState::Queued => counts.queued += 1,
                TaskState::Scheduled => counts.scheduled += 1,
                TaskState::Active => counts.active += 1,
                TaskState::Error => counts.error += 1,
                TaskState::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut queues: Vec<String> = state.tasks.values().map(|t| t.queue.clone()).collect();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    async fn acquire_slot(
        &self,
        queue: &str,
        worker_id: &str,
        max_workers: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;

        if let Some(&until) = state.system_locks.get(queue) {
            if now < until {
                return Ok(false);
            }
        }

        state.purge_expired_slots(queue, now);

        let held_by_others = state
            .slots
            .keys()
            .filter(|(q, w)| q == queue && w != worker_id)
            .count();
        if held_by_others >= max_workers as usize {
            return Ok(false);
        }

        let key = (queue.to_string(), worker_id.to_string());
        let expires_at = now + ttl;
        state
            .slots
            .entry(key)
            .and_modify(|e| e.expires_at = expires_at)
            .or_insert(SlotEntry {
                acquired_at: now,
                expires_at,
            });
        Ok(true)
    }

    async fn renew_slot(
        &self,
        queue: &str,
        worker_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (queue.to_string(), worker_id.to_string());
        match state.slots.get_mut(&key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            // Expired or missing: the budget may already belong to someone
            // else, so the caller has to re-acquire.
            _ => Ok(false),
        }
    }

    async fn release_slot(&self, queue: &str, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .slots
            .remove(&(queue.to_string(), worker_id.to_string()));
        Ok(())
    }

    async fn list_slots(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<SlotInfo>> {
        let state = self.state.lock().await;
        let mut slots: Vec<SlotInfo> = state
            .slots
            .iter()
            .filter(|((q, _), entry)| q == queue && entry.expires_at > now)
            .map(|((q, w), entry)| SlotInfo {
                queue: q.clone(),
                worker_id: w.clone(),
                acquired_at: entry.acquired_at,
                expires_at: entry.expires_at,
            })
            .collect();
        slots.sort_by(|a, b| {
            (a.acquired_at, &a.worker_id).cmp(&(b.acquired_at, &b.worker_id))
        });
        Ok(slots)
    }

    async fn set_system_lock(&self, queue: &str, until: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.system_locks.insert(queue.to_string(), until);
        Ok(())
    }

    async fn system_lock(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state.system_locks.get(queue).copied())
    }

    async fn acquire_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let map_key = (queue.to_string(), key.to_string());
        match state.execution_locks.get_mut(&map_key) {
            Some(entry) if entry.holder == holder || entry.expires_at <= now => {
                entry.holder = holder.to_string();
                entry.expires_at = now + ttl;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                state.execution_locks.insert(
                    map_key,
                    LockEntry {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let map_key = (queue.to_string(), key.to_string());
        match state.execution_locks.get_mut(&map_key) {
            Some(entry) if entry.holder == holder && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_execution_lock(&self, queue: &str, key: &str, holder: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let map_key = (queue.to_string(), key.to_string());
        if state
            .execution_locks
            .get(&map_key)
            .is_some_and(|e| e.holder == holder)
        {
            state.execution_locks.remove(&map_key);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn claim_is_fifo_under_a_frozen_clock() {
        let store = MemoryStore::new();
        let now = at(0);

        let first = store
            .enqueue(NewTask::new("default", "send_email"), now)
            .await
            .unwrap();
        let second = store
            .enqueue(NewTask::new("default", "send_email"), now)
            .await
            .unwrap();

        let claimed = store.claim_next("default", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.task().id);
        let claimed = store.claim_next("default", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.task().id);
        assert!(store.claim_next("default", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unique_key_deduplicates_unresolved_tasks_only() {
        let store = MemoryStore::new();
        let now = at(0);
        let new = || NewTask::new("default", "sync").unique_key("acct-1");

        let first = store.enqueue(new(), now).await.unwrap();
        let second = store.enqueue(new(), now).await.unwrap();
        assert!(matches!(second, EnqueueOutcome::Deduplicated(_)));
        assert_eq!(second.task().id, first.task().id);

        // Resolved tasks no longer block the key.
        let claimed = store.claim_next("default", now).await.unwrap().unwrap();
        store.fail(claimed.id, "boom").await.unwrap();
        let third = store.enqueue(new(), now).await.unwrap();
        assert!(matches!(third, EnqueueOutcome::Created(_)));
    }

    #[tokio::test]
    async fn slot_budget_counts_only_live_foreign_slots() {
        let store = MemoryStore::new();
        let ttl = Duration::seconds(60);

        assert!(store.acquire_slot("q", "w1", 2, ttl, at(0)).await.unwrap());
        assert!(store.acquire_slot("q", "w2", 2, ttl, at(0)).await.unwrap());
        assert!(!store.acquire_slot("q", "w3", 2, ttl, at(0)).await.unwrap());
        // Re-acquire by a holder refreshes instead of consuming a new slot.
        assert!(store.acquire_slot("q", "w1", 2, ttl, at(1)).await.unwrap());

        // Once w1's slot expires, w3 fits.
        assert!(store.acquire_slot("q", "w3", 2, ttl, at(62)).await.unwrap());
        let live = store.list_slots("q", at(62)).await.unwrap();
        let holders: Vec<&str> = live.iter().map(|s| s.worker_id.as_str()).collect();
        assert!(holders.contains(&"w3"));
        assert!(!holders.contains(&"w1"));
    }

    #[tokio::test]
    async fn expired_slot_cannot_be_renewed() {
        let store = MemoryStore::new();
        let ttl = Duration::seconds(10);
        assert!(store.acquire_slot("q", "w1", 1, ttl, at(0)).await.unwrap());
        assert!(store.renew_slot("q", "w1", ttl, at(5)).await.unwrap());
        assert!(!store.renew_slot("q", "w1", ttl, at(30)).await.unwrap());
    }

    #[tokio::test]
    async fn execution_lock_respects_holder_and_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::seconds(60);

        assert!(store
            .acquire_execution_lock("q", "k", "w1", ttl, at(0))
            .await
            .unwrap());
        assert!(!store
            .acquire_execution_lock("q", "k", "w2", ttl, at(1))
            .await
            .unwrap());
        // Same holder refreshes.
        assert!(store
            .acquire_execution_lock("q", "k", "w1", ttl, at(1))
            .await
            .unwrap());
        // Foreign holder takes over after expiry.
        assert!(store
            .acquire_execution_lock("q", "k", "w2", ttl, at(120))
            .await
            .unwrap());
        // w1 releasing now is a no-op.
        store.release_execution_lock("q", "k", "w1").await.unwrap();
        assert!(!store
            .acquire_execution_lock("q", "k", "w3", ttl, at(121))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn retry_consumes_budget_then_parks_in_error() {
        let store = MemoryStore::new();
        let created = store
            .enqueue(NewTask::new("q", "flaky").max_retries(1), at(0))
            .await
            .unwrap();
        let id = created.task().id;

        store.claim_next("q", at(0)).await.unwrap().unwrap();
        let outcome = store
            .retry(id, "timeout", Duration::seconds(5), at(0))
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Scheduled(at(5)));

        let promoted = store.promote_due("q", at(5)).await.unwrap();
        assert_eq!(promoted.len(), 1);
        store.claim_next("q", at(5)).await.unwrap().unwrap();
        let outcome = store
            .retry(id, "timeout", Duration::seconds(5), at(5))
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Exhausted);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().state,
            TaskState::Error
        );
    }
}
