//! Worker: claims tasks and drives them through execution.
//!
//! One `Worker` polls a set of queues. Per poll it promotes due tasks,
//! checks the queue's system lock, takes a concurrency slot, claims the
//! oldest queued task and runs its handler. The slot is held for the whole
//! execution and heartbeated alongside any execution lock, so a stalled
//! worker's leases expire on their own.
//!
//! Handlers run inside `tokio::spawn`, which contains panics: a panicked
//! handler is treated as a retryable failure, not a worker crash.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueueLimits;
use crate::error::Result;
use crate::lock::LockManager;
use crate::model::{Task, TaskState};
use crate::registry::{HandlerRegistry, TaskFailure};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::store::{RetryOutcome, TaskStore};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_transition, start_task_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Poll until shutdown.
    Continuous,
    /// Drain each queue's claimable work, then return.
    Once,
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues to poll, in order.
    pub queues: Vec<String>,
    /// Slot budget override for all polled queues. When unset, the
    /// per-queue limits configuration decides.
    pub max_workers_per_queue: Option<u32>,
    pub mode: RunMode,
    /// In `Once` mode, give each queue a single non-blocking attempt: at
    /// most one task runs, and a denial ends the round instead of waiting
    /// out the poll interval. Only this makes `run` return in bounded time
    /// while a queue stays locked.
    pub force_once: bool,
    pub poll_interval: StdDuration,
    /// Lease TTL for slots and execution locks.
    pub slot_ttl: Duration,
    /// How often running executions renew their leases.
    pub heartbeat_interval: StdDuration,
    /// Pause after a store error before polling again.
    pub error_backoff: StdDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            max_workers_per_queue: None,
            mode: RunMode::Continuous,
            force_once: false,
            poll_interval: StdDuration::from_millis(500),
            slot_ttl: Duration::seconds(60),
            heartbeat_interval: StdDuration::from_secs(20),
            error_backoff: StdDuration::from_secs(5),
        }
    }
}

/// Outcome of one queue poll.
enum QueuePoll {
    Executed,
    Empty,
    DeniedLock,
    DeniedSlots,
}

#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    retry_policy: Arc<dyn RetryPolicy>,
    limits: QueueLimits,
    config: WorkerConfig,
    worker_id: String,
    lock: LockManager,
    scheduler: Scheduler,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let lock = LockManager::new(Arc::clone(&store), Arc::clone(&clock))
            .with_slot_ttl(config.slot_ttl);
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&clock));
        let worker_id = format!(
            "worker-{}-{}",
            std::process::id(),
            &Uuid::new_v4().to_string()[..8]
        );
        Self {
            store,
            clock,
            registry,
            retry_policy: Arc::new(ExponentialBackoff::default()),
            limits: QueueLimits::default(),
            config,
            worker_id,
            lock,
            scheduler,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_limits(mut self, limits: QueueLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Override the generated worker id. Ids name slot and lock holders, so
    /// they must be unique per worker.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Signal the worker to stop after the current poll round.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run in the configured mode until done (`Once`) or shut down
    /// (`Continuous`).
    pub async fn run(&self) -> Result<()> {
        info!(worker = self.worker_id, queues = ?self.config.queues, "worker started");
        match self.config.mode {
            RunMode::Once => self.run_once().await,
            RunMode::Continuous => self.run_continuous().await,
        }
    }

    /// Drain every configured queue: claim and execute tasks until the
    /// queue reports empty, then move on. A denied queue is retried after
    /// the poll interval. With `force_once` each queue gets a single
    /// non-blocking attempt and the pass moves on whatever the outcome.
    pub async fn run_once(&self) -> Result<()> {
        for queue in &self.config.queues {
            loop {
                match self.poll_queue(queue).await? {
                    QueuePoll::Executed => {
                        if self.config.force_once {
                            break;
                        }
                    }
                    QueuePoll::Empty => break,
                    QueuePoll::DeniedLock | QueuePoll::DeniedSlots => {
                        if self.config.force_once {
                            break;
                        }
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_continuous(&self) -> Result<()> {
        loop {
            let mut did_work = false;
            for queue in &self.config.queues {
                match self.poll_queue(queue).await {
                    Ok(QueuePoll::Executed) => did_work = true,
                    Ok(_) => {}
                    Err(e) => {
                        error!(queue, "poll error: {e}");
                        tokio::time::sleep(self.config.error_backoff).await;
                    }
                }
            }

            // Drain without sleeping while at least one queue had work.
            let idle = if did_work {
                StdDuration::ZERO
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(worker = self.worker_id, "worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }
    }

    fn effective_limit(&self, queue: &str) -> u32 {
        self.config
            .max_workers_per_queue
            .unwrap_or_else(|| self.limits.max_workers(queue))
    }

    /// One admission round: promote, check the system lock, take a slot,
    /// claim and execute. The slot is released on every exit path; an
    /// unclean exit falls back to TTL expiry.
    async fn poll_queue(&self, queue: &str) -> Result<QueuePoll> {
        self.scheduler.promote_due(queue).await?;

        if self.lock.is_locked(queue).await? {
            debug!(queue, "queue is system-locked");
            record_claim(queue, "denied_lock");
            return Ok(QueuePoll::DeniedLock);
        }

        let max_workers = self.effective_limit(queue);
        if !self
            .lock
            .acquire_slot(queue, &self.worker_id, max_workers)
            .await?
        {
            debug!(queue, max_workers, "no slot available");
            record_claim(queue, "denied_slots");
            return Ok(QueuePoll::DeniedSlots);
        }

        let result = self.claim_and_execute(queue).await;
        if let Err(e) = self.lock.release_slot(queue, &self.worker_id).await {
            warn!(queue, "slot release failed: {e}");
        }
        result
    }

    async fn claim_and_execute(&self, queue: &str) -> Result<QueuePoll> {
        let Some(task) = self.store.claim_next(queue, self.clock.now()).await? else {
            record_claim(queue, "empty");
            return Ok(QueuePoll::Empty);
        };
        record_claim(queue, "executed");
        self.execute(task).await?;
        Ok(QueuePoll::Executed)
    }

    async fn execute(&self, task: Task) -> Result<()> {
        let span = start_task_span(&task.queue, &task.handler, task.id);
        record_transition(&span, TaskState::Active);

        async {
            let Some(handler) = self.registry.get(&task.handler) else {
                warn!(handler = task.handler, "no handler registered, task is dead");
                metrics::tasks_unroutable().add(
                    1,
                    &[
                        KeyValue::new("queue", task.queue.clone()),
                        KeyValue::new("handler", task.handler.clone()),
                    ],
                );
                record_transition(&span, TaskState::Dead);
                self.store
                    .fail(task.id, &format!("no handler registered for {:?}", task.handler))
                    .await?;
                return Ok(());
            };

            // Mutual exclusion across workers for tasks that ask for it.
            // A contended claim goes back to scheduled without spending a
            // retry.
            let lock_key = task.lock_on_execute.then(|| task.execution_lock_key());
            if let Some(key) = &lock_key {
                if !self
                    .lock
                    .acquire_execution_lock(&task.queue, key, &self.worker_id)
                    .await?
                {
                    let at = self.clock.now() + defer_delay(self.config.poll_interval);
                    info!(task = %task.id, key, "execution lock contended, deferring");
                    record_transition(&span, TaskState::Scheduled);
                    self.store.defer(task.id, at).await?;
                    return Ok(());
                }
            }

            let started = std::time::Instant::now();
            let run_task = task.clone();
            let mut join = tokio::spawn(async move { handler.run(run_task).await });

            let outcome: std::result::Result<(), TaskFailure> = loop {
                tokio::select! {
                    res = &mut join => {
                        break match res {
                            Ok(r) => r,
                            Err(e) if e.is_panic() => {
                                Err(TaskFailure::retryable(format!("handler panicked: {e}")))
                            }
                            Err(e) => {
                                Err(TaskFailure::retryable(format!("handler aborted: {e}")))
                            }
                        };
                    }
                    _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                        self.heartbeat(&task, lock_key.as_deref()).await;
                    }
                }
            };

            let duration_ms = started.elapsed().as_millis() as f64;
            self.settle(&task, &span, outcome, duration_ms).await?;

            if let Some(key) = &lock_key {
                if let Err(e) = self
                    .lock
                    .release_execution_lock(&task.queue, key, &self.worker_id)
                    .await
                {
                    warn!(task = %task.id, key, "execution lock release failed: {e}");
                }
            }
            Ok(())
        }
        .instrument(span.clone())
        .await
    }

    /// Extend the slot and execution-lock leases while a handler runs.
    /// Renewal failures are logged, not fatal; the handler keeps running
    /// and the settle step decides the task's fate.
    async fn heartbeat(&self, task: &Task, lock_key: Option<&str>) {
        match self.lock.renew_slot(&task.queue, &self.worker_id).await {
            Ok(true) => {}
            Ok(false) => warn!(queue = task.queue, "slot lease expired mid-execution"),
            Err(e) => warn!(queue = task.queue, "slot renewal failed: {e}"),
        }
        if let Some(key) = lock_key {
            match self
                .lock
                .renew_execution_lock(&task.queue, key, &self.worker_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(task = %task.id, key, "execution lock expired mid-execution"),
                Err(e) => warn!(task = %task.id, key, "execution lock renewal failed: {e}"),
            }
        }
    }

    /// Route the handler outcome: success removes the task, a retryable
    /// failure consumes a retry, a permanent one goes straight to dead.
    async fn settle(
        &self,
        task: &Task,
        span: &tracing::Span,
        outcome: std::result::Result<(), TaskFailure>,
        duration_ms: f64,
    ) -> Result<()> {
        let result = match outcome {
            Ok(()) => {
                info!(task = %task.id, duration_ms, "task completed");
                self.store.complete(task.id).await?;
                "completed"
            }
            Err(failure) if failure.retryable => {
                let delay = self.retry_policy.delay(task.retry_count + 1);
                match self
                    .store
                    .retry(task.id, &failure.message, delay, self.clock.now())
                    .await?
                {
                    RetryOutcome::Scheduled(at) => {
                        warn!(task = %task.id, error = %failure, retry_at = %at, "task failed, retry scheduled");
                        record_transition(span, TaskState::Scheduled);
                    }
                    RetryOutcome::Exhausted => {
                        error!(task = %task.id, error = %failure, "retries exhausted");
                        record_transition(span, TaskState::Error);
                    }
                }
                "failed"
            }
            Err(failure) => {
                error!(task = %task.id, error = %failure, "permanent failure, task is dead");
                record_transition(span, TaskState::Dead);
                self.store.fail(task.id, &failure.message).await?;
                "dead"
            }
        };

        metrics::task_duration_ms().record(
            duration_ms,
            &[
                KeyValue::new("queue", task.queue.clone()),
                KeyValue::new("handler", task.handler.clone()),
                KeyValue::new("outcome", result),
            ],
        );
        Ok(())
    }
}

fn record_claim(queue: &str, outcome: &'static str) {
    metrics::claims().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

fn defer_delay(poll_interval: StdDuration) -> Duration {
    Duration::from_std(poll_interval).unwrap_or_else(|_| Duration::seconds(1))
}
