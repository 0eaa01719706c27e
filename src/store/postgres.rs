//! Postgres [`TaskStore`]: the durable backend shared by every worker
//! process.
//!
//! Atomicity strategy, per operation:
//! - `claim_next` selects with `FOR UPDATE SKIP LOCKED`, so concurrent
//!   claimers pick distinct rows without blocking each other.
//! - `enqueue` dedup rides the partial unique index via
//!   `ON CONFLICT ... DO NOTHING`.
//! - state transitions are conditional `UPDATE ... WHERE state = ...`
//!   statements checked through `rows_affected`.
//! - `acquire_slot` delegates to a plpgsql function serialized by a
//!   per-queue advisory lock (see `migrations/0001_init.sql`).
//!
//! All timestamps are bound as parameters; the SQL never calls `now()`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    DEFAULT_MAX_RETRIES, NewTask, QueueCounts, SlotInfo, Task, TaskId, TaskState,
};
use crate::store::{EnqueueOutcome, RetryOutcome, TaskStore};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Fetch a task or explain why a conditional transition matched no row.
    async fn transition_miss(&self, id: TaskId, to: TaskState) -> Error {
        match self.get(id).await {
            Ok(Some(task)) => Error::InvalidTransition {
                from: task.state,
                to,
            },
            Ok(None) => Error::TaskNotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn enqueue(&self, new: NewTask, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let max_retries = new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES) as i32;
        let (state, execute_at, queued_at) = match new.delay_secs {
            Some(secs) => (
                TaskState::Scheduled,
                Some(now + Duration::seconds(secs as i64)),
                None,
            ),
            None => (TaskState::Queued, None, Some(now)),
        };

        let Some(key) = &new.unique_key else {
            // No dedup key, conflict impossible.
            let row: TaskRow = sqlx::query_as(
                "INSERT INTO taskgate_tasks (id, queue, handler, args, state, unique_key, lock_on_execute, max_retries, execute_at, enqueued_at, queued_at)
                 VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, $8, $9, $10)
                 RETURNING id, queue, handler, args, state, unique_key, lock_on_execute, retry_count, max_retries, position, execute_at, enqueued_at, queued_at, started_at, error_message",
            )
            .bind(Uuid::new_v4())
            .bind(&new.queue)
            .bind(&new.handler)
            .bind(&new.args)
            .bind(state.to_string())
            .bind(new.lock_on_execute)
            .bind(max_retries)
            .bind(execute_at)
            .bind(now)
            .bind(queued_at)
            .fetch_one(&self.pool)
            .await?;
            return Ok(EnqueueOutcome::Created(row.try_into_task()?));
        };

        // Insert and duplicate lookup are separate statements, so a duplicate
        // that resolves in between leaves neither; retry the pair.
        for _ in 0..3 {
            let inserted: Option<TaskRow> = sqlx::query_as(
                "INSERT INTO taskgate_tasks (id, queue, handler, args, state, unique_key, lock_on_execute, max_retries, execute_at, enqueued_at, queued_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (queue, unique_key) WHERE unique_key IS NOT NULL AND state IN ('queued', 'scheduled', 'active')
                 DO NOTHING
                 RETURNING id, queue, handler, args, state, unique_key, lock_on_execute, retry_count, max_retries, position, execute_at, enqueued_at, queued_at, started_at, error_message",
            )
            .bind(Uuid::new_v4())
            .bind(&new.queue)
            .bind(&new.handler)
            .bind(&new.args)
            .bind(state.to_string())
            .bind(key)
            .bind(new.lock_on_execute)
            .bind(max_retries)
            .bind(execute_at)
            .bind(now)
            .bind(queued_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = inserted {
                return Ok(EnqueueOutcome::Created(row.try_into_task()?));
            }

            let existing: Option<TaskRow> = sqlx::query_as(
                "SELECT id, queue, handler, args, state, unique_key, lock_on_execute, retry_count, max_retries, position, execute_at, enqueued_at, queued_at, started_at, error_message
                 FROM taskgate_tasks
                 WHERE queue = $1 AND unique_key = $2 AND state IN ('queued', 'scheduled', 'active')
                 LIMIT 1",
            )
            .bind(&new.queue)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = existing {
                return Ok(EnqueueOutcome::Deduplicated(row.try_into_task()?));
            }
        }

        Err(Error::Other(format!(
            "enqueue kept racing a resolving duplicate for key {key:?} on queue {}",
            new.queue
        )))
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE taskgate_tasks
             SET state = 'active', started_at = $2
             WHERE id = (
                 SELECT id FROM taskgate_tasks
                 WHERE queue = $1 AND state = 'queued'
                 ORDER BY queued_at, position
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, queue, handler, args, state, unique_key, lock_on_execute, retry_count, max_retries, position, execute_at, enqueued_at, queued_at, started_at, error_message",
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    async fn complete(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM taskgate_tasks WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(
        &self,
        id: TaskId,
        error: &str,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome> {
        let at = now + delay;
        // CASE arms read the pre-update retry_count, consistent with the
        // increment on the same row.
        let state: Option<(String,)> = sqlx::query_as(
            "UPDATE taskgate_tasks
             SET retry_count = retry_count + 1,
                 state = CASE WHEN retry_count + 1 <= max_retries THEN 'scheduled' ELSE 'error' END,
                 execute_at = CASE WHEN retry_count + 1 <= max_retries THEN $3 ELSE NULL END,
                 error_message = $2,
                 started_at = NULL,
                 queued_at = NULL
             WHERE id = $1 AND state = 'active'
             RETURNING state",
        )
        .bind(id.0)
        .bind(error)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match state {
            Some((s,)) if s == "scheduled" => Ok(RetryOutcome::Scheduled(at)),
            Some(_) => Ok(RetryOutcome::Exhausted),
            None => Err(self.transition_miss(id, TaskState::Scheduled).await),
        }
    }

    async fn fail(&self, id: TaskId, error: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE taskgate_tasks
             SET state = 'dead', error_message = $2, started_at = NULL, queued_at = NULL, execute_at = NULL
             WHERE id = $1 AND state = 'active'",
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.transition_miss(id, TaskState::Dead).await);
        }
        Ok(())
    }

    async fn defer(&self, id: TaskId, execute_at: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE taskgate_tasks
             SET state = 'scheduled', execute_at = $2, started_at = NULL, queued_at = NULL
             WHERE id = $1 AND state = 'active'",
        )
        .bind(id.0)
        .bind(execute_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.transition_miss(id, TaskState::Scheduled).await);
        }
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Task>> {
        // Row locks make concurrent promoters move disjoint sets: a row
        // already flipped by the other side fails the state re-check.
        let rows: Vec<TaskRow> = sqlx::query_as(
            "UPDATE taskgate_tasks
             SET state = 'queued', queued_at = $2, execute_at = NULL
             WHERE queue = $1 AND state = 'scheduled' AND execute_at <= $2
             RETURNING id, queue, handler, args, state, unique_key, lock_on_execute, retry_count, max_retries, position, execute_at, enqueued_at, queued_at, started_at, error_message",
        )
        .bind(queue)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut promoted = rows
            .into_iter()
            .map(TaskRow::try_into_task)
            .collect::<Result<Vec<_>>>()?;
        promoted.sort_by_key(|t| t.position);
        Ok(promoted)
    }

    async fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE taskgate_tasks
             SET state = 'queued', retry_count = 0, error_message = NULL, queued_at = $2, execute_at = NULL, started_at = NULL
             WHERE id = $1 AND state IN ('error', 'dead')",
        )
        .bind(id.0)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn cancel(&self, id: TaskId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "DELETE FROM taskgate_tasks WHERE id = $1 AND state IN ('queued', 'scheduled')",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, queue, handler, args, state, unique_key, lock_on_execute, retry_count, max_retries, position, execute_at, enqueued_at, queued_at, started_at, error_message
             FROM taskgate_tasks WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    async fn list(
        &self,
        queue: Option<&str>,
        state: Option<TaskState>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, queue, handler, args, state, unique_key, lock_on_execute, retry_count, max_retries, position, execute_at, enqueued_at, queued_at, started_at, error_message
             FROM taskgate_tasks
             WHERE ($1::text IS NULL OR queue = $1)
               AND ($2::text IS NULL OR state = $2)
             ORDER BY enqueued_at, position
             LIMIT $3",
        )
        .bind(queue)
        .bind(state.map(|s| s.to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, count(*) FROM taskgate_tasks WHERE queue = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            match state.parse::<TaskState>()? {
                TaskState::Queued => counts.queued = n as u64,
                TaskState::Scheduled => counts.scheduled = n as u64,
                TaskState::Active => counts.active = n as u64,
                TaskState::Error => counts.error = n as u64,
                TaskState::Dead => counts.dead = n as u64,
            }
        }
        Ok(counts)
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT queue FROM taskgate_tasks ORDER BY queue")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(q,)| q).collect())
    }

    async fn acquire_slot(
        &self,
        queue: &str,
        worker_id: &str,
        max_workers: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let granted: (bool,) = sqlx::query_as("SELECT taskgate_acquire_slot($1, $2, $3, $4, $5)")
            .bind(queue)
            .bind(worker_id)
            .bind(max_workers as i32)
            .bind(ttl.num_seconds())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(granted.0)
    }

    async fn renew_slot(
        &self,
        queue: &str,
        worker_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // The expiry guard keeps a late heartbeat from resurrecting a slot
        // whose budget another worker may already hold.
        let rows_affected = sqlx::query(
            "UPDATE taskgate_slots SET expires_at = $4
             WHERE queue = $1 AND worker_id = $2 AND expires_at > $3",
        )
        .bind(queue)
        .bind(worker_id)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn release_slot(&self, queue: &str, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM taskgate_slots WHERE queue = $1 AND worker_id = $2")
            .bind(queue)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_slots(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<SlotInfo>> {
        let rows: Vec<(String, String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT queue, worker_id, acquired_at, expires_at FROM taskgate_slots
             WHERE queue = $1 AND expires_at > $2
             ORDER BY acquired_at, worker_id",
        )
        .bind(queue)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(queue, worker_id, acquired_at, expires_at)| SlotInfo {
                queue,
                worker_id,
                acquired_at,
                expires_at,
            })
            .collect())
    }

    async fn set_system_lock(&self, queue: &str, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO taskgate_queue_locks (queue, locked_until) VALUES ($1, $2)
             ON CONFLICT (queue) DO UPDATE SET locked_until = EXCLUDED.locked_until",
        )
        .bind(queue)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn system_lock(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT locked_until FROM taskgate_queue_locks WHERE queue = $1")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(until,)| until))
    }

    async fn acquire_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // Conditional upsert: the WHERE clause lets the same holder refresh
        // and anyone take over an expired lock, in one atomic statement.
        let rows_affected = sqlx::query(
            "INSERT INTO taskgate_execution_locks (queue, lock_key, holder, expires_at)
             VALUES ($1, $2, $3, $5)
             ON CONFLICT (queue, lock_key) DO UPDATE
             SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
             WHERE taskgate_execution_locks.holder = EXCLUDED.holder
                OR taskgate_execution_locks.expires_at <= $4",
        )
        .bind(queue)
        .bind(key)
        .bind(holder)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn renew_execution_lock(
        &self,
        queue: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE taskgate_execution_locks SET expires_at = $5
             WHERE queue = $1 AND lock_key = $2 AND holder = $3 AND expires_at > $4",
        )
        .bind(queue)
        .bind(key)
        .bind(holder)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn release_execution_lock(&self, queue: &str, key: &str, holder: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM taskgate_execution_locks
             WHERE queue = $1 AND lock_key = $2 AND holder = $3",
        )
        .bind(queue)
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    queue: String,
    handler: String,
    args: serde_json::Value,
    state: String,
    unique_key: Option<String>,
    lock_on_execute: bool,
    retry_count: i32,
    max_retries: i32,
    position: i64,
    execute_at: Option<DateTime<Utc>>,
    enqueued_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            queue: self.queue,
            handler: self.handler,
            args: self.args,
            state: self.state.parse()?,
            unique_key: self.unique_key,
            lock_on_execute: self.lock_on_execute,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            position: self.position,
            execute_at: self.execute_at,
            enqueued_at: self.enqueued_at,
            queued_at: self.queued_at,
            started_at: self.started_at,
            error_message: self.error_message,
        })
    }
}
