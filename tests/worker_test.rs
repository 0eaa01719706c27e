//! Worker execution tests: handler outcome routing, retries, execution locks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use taskgate::client::Client;
use taskgate::clock::{Clock, ManualClock};
use taskgate::lock::LockManager;
use taskgate::model::{NewTask, Task, TaskState};
use taskgate::registry::{HandlerRegistry, TaskFailure};
use taskgate::retry::FixedDelay;
use taskgate::store::{EnqueueOutcome, MemoryStore};
use taskgate::worker::{RunMode, Worker, WorkerConfig};

fn frozen() -> (Arc<MemoryStore>, Arc<ManualClock>, Client) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap(),
    ));
    let client = Client::new(store.clone(), clock.clone());
    (store, clock, client)
}

fn once_config(queue: &str) -> WorkerConfig {
    WorkerConfig {
        queues: vec![queue.to_string()],
        mode: RunMode::Once,
        force_once: true,
        ..WorkerConfig::default()
    }
}

/// A worker with a deterministic id and a fixed 5s retry delay.
fn test_worker(
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    registry: HandlerRegistry,
    config: WorkerConfig,
) -> Worker {
    Worker::new(store, clock, Arc::new(registry), config)
        .with_worker_id("w-test")
        .with_retry_policy(Arc::new(FixedDelay(Duration::seconds(5))))
}

fn created(outcome: EnqueueOutcome) -> Task {
    match outcome {
        EnqueueOutcome::Created(task) => task,
        EnqueueOutcome::Deduplicated(task) => panic!("unexpected duplicate {}", task.id),
    }
}

// ---------------------------------------------------------------------------
// Outcome routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_removes_the_task() {
    let (store, clock, client) = frozen();
    let task = created(client.enqueue(NewTask::new("q", "ok")).await.unwrap());

    let mut registry = HandlerRegistry::new();
    registry.register_fn("ok", |_task| async { Ok(()) });
    let worker = test_worker(store, clock, registry, once_config("q"));

    worker.run().await.unwrap();
    assert!(client.get(task.id).await.unwrap().is_none());
    assert!(client.queue_counts("q").await.unwrap().is_empty());
}

#[tokio::test]
async fn handler_receives_the_task_payload() {
    let (store, clock, client) = frozen();
    client
        .enqueue(NewTask::new("q", "inspect").args(json!({"n": 5})))
        .await
        .unwrap();

    let seen: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("inspect", move |task| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = Some(task.args.clone());
            Ok(())
        }
    });
    let worker = test_worker(store, clock, registry, once_config("q"));

    worker.run().await.unwrap();
    assert_eq!(seen.lock().unwrap().take(), Some(json!({"n": 5})));
}

#[tokio::test]
async fn retryable_failure_schedules_a_retry() {
    let (store, clock, client) = frozen();
    let start = clock.now();
    let task = created(client.enqueue(NewTask::new("q", "flaky")).await.unwrap());

    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", |_task| async {
        Err(TaskFailure::retryable("connection reset"))
    });
    let worker = test_worker(store, clock, registry, once_config("q"));

    worker.run().await.unwrap();
    let after = client.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.state, TaskState::Scheduled);
    assert_eq!(after.retry_count, 1);
    assert_eq!(after.execute_at, Some(start + Duration::seconds(5)));
    assert_eq!(after.error_message.as_deref(), Some("connection reset"));
}

#[tokio::test]
async fn retry_executes_again_after_the_delay() {
    let (store, clock, client) = frozen();
    let task = created(client.enqueue(NewTask::new("q", "flaky")).await.unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", move |_task| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TaskFailure::retryable("first attempt"))
            } else {
                Ok(())
            }
        }
    });
    let worker = test_worker(store.clone(), clock.clone(), registry, once_config("q"));

    worker.run().await.unwrap();
    assert_eq!(
        client.get(task.id).await.unwrap().unwrap().state,
        TaskState::Scheduled
    );

    clock.advance(Duration::seconds(5));
    worker.run().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(client.get(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_retry_budget_parks_in_error() {
    let (store, clock, client) = frozen();
    let task = created(
        client
            .enqueue(NewTask::new("q", "flaky").max_retries(1))
            .await
            .unwrap(),
    );

    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", |_task| async {
        Err(TaskFailure::retryable("still down"))
    });
    let worker = test_worker(store.clone(), clock.clone(), registry, once_config("q"));

    worker.run().await.unwrap();
    assert_eq!(
        client.get(task.id).await.unwrap().unwrap().state,
        TaskState::Scheduled
    );

    clock.advance(Duration::seconds(5));
    worker.run().await.unwrap();
    let after = client.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.state, TaskState::Error);
    assert_eq!(after.retry_count, 2);
    assert_eq!(after.error_message.as_deref(), Some("still down"));
}

#[tokio::test]
async fn permanent_failure_goes_straight_to_dead() {
    let (store, clock, client) = frozen();
    let task = created(client.enqueue(NewTask::new("q", "broken")).await.unwrap());

    let mut registry = HandlerRegistry::new();
    registry.register_fn("broken", |_task| async {
        Err(TaskFailure::permanent("bad arguments"))
    });
    let worker = test_worker(store, clock, registry, once_config("q"));

    worker.run().await.unwrap();
    let after = client.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.state, TaskState::Dead);
    assert_eq!(after.retry_count, 0);
    assert_eq!(after.error_message.as_deref(), Some("bad arguments"));
}

#[tokio::test]
async fn unknown_handler_is_dead_lettered() {
    let (store, clock, client) = frozen();
    let task = created(client.enqueue(NewTask::new("q", "ghost")).await.unwrap());

    let worker = test_worker(store, clock, HandlerRegistry::new(), once_config("q"));

    worker.run().await.unwrap();
    let after = client.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.state, TaskState::Dead);
    assert!(
        after
            .error_message
            .as_deref()
            .unwrap()
            .contains("no handler registered")
    );
}

#[tokio::test]
async fn panicking_handler_is_contained_and_retried() {
    let (store, clock, client) = frozen();
    let task = created(client.enqueue(NewTask::new("q", "explodes")).await.unwrap());

    let mut registry = HandlerRegistry::new();
    registry.register_fn("explodes", |_task| async move { panic!("kaboom") });
    let worker = test_worker(store, clock, registry, once_config("q"));

    worker.run().await.unwrap();
    let after = client.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.state, TaskState::Scheduled);
    assert_eq!(after.retry_count, 1);
    assert!(after.error_message.as_deref().unwrap().contains("panicked"));
}

// ---------------------------------------------------------------------------
// Execution locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn contended_execution_lock_defers_without_spending_retry() {
    let (store, clock, client) = frozen();
    let start = clock.now();
    let task = created(
        client
            .enqueue(
                NewTask::new("q", "locked")
                    .unique_key("acct-1")
                    .lock_on_execute(),
            )
            .await
            .unwrap(),
    );

    // Another worker holds the lock for this key.
    let lock = LockManager::new(store.clone(), clock.clone());
    assert!(lock.acquire_execution_lock("q", "acct-1", "other").await.unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("locked", move |_task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let mut config = once_config("q");
    config.poll_interval = StdDuration::from_secs(30);
    let worker = test_worker(store.clone(), clock.clone(), registry, config);

    worker.run().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let after = client.get(task.id).await.unwrap().unwrap();
    assert_eq!(after.state, TaskState::Scheduled);
    assert_eq!(after.retry_count, 0);
    assert_eq!(after.execute_at, Some(start + Duration::seconds(30)));
    assert_eq!(after.started_at, None);

    // Once the holder releases and the deferral elapses, the task runs.
    lock.release_execution_lock("q", "acct-1", "other").await.unwrap();
    clock.advance(Duration::seconds(30));
    worker.run().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(client.get(task.id).await.unwrap().is_none());

    // The worker released its lock after settling.
    assert!(lock.acquire_execution_lock("q", "acct-1", "third").await.unwrap());
}
