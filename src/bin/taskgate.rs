//! taskgate CLI: worker daemon and operator interface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

use taskgate::client::Client;
use taskgate::clock::SystemClock;
use taskgate::command::load_handlers;
use taskgate::config::{Config, QueueLimits};
use taskgate::model::{NewTask, TaskId, TaskState};
use taskgate::registry::HandlerRegistry;
use taskgate::store::{EnqueueOutcome, MemoryStore, PgStore, TaskStore};
use taskgate::telemetry::{TelemetryConfig, init_telemetry};
use taskgate::worker::{RunMode, Worker, WorkerConfig};

#[derive(Parser)]
#[command(
    name = "taskgate",
    about = "Distributed task queue with per-queue admission control"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker
    Serve {
        /// Queues to poll (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "default")]
        queues: Vec<String>,
        /// Slot budget override for the polled queues
        #[arg(long)]
        max_workers_per_queue: Option<u32>,
        /// Give each queue one processing round, then exit
        #[arg(long)]
        once: bool,
        /// With --once, end a queue's round on denial instead of waiting
        #[arg(long)]
        force_once: bool,
        /// Queue limits TOML file
        #[arg(long)]
        queue_limits: Option<PathBuf>,
        /// Subprocess handlers TOML file
        #[arg(long)]
        handlers: Option<PathBuf>,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        poll_interval_ms: u64,
        /// Use the in-memory store: no database, tasks do not survive restart
        #[arg(long)]
        memory: bool,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Queue system lock operations
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Show task counts per state for a queue
    Counts {
        queue: String,
    },
    /// List known queues with their counts
    Queues,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Enqueue a task
    Enqueue {
        queue: String,
        handler: String,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
        /// Delay execution by this many seconds
        #[arg(long)]
        delay: Option<u64>,
        /// Dedup key: at most one unresolved task per (queue, key)
        #[arg(long)]
        unique_key: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Hold a per-task execution lock while running
        #[arg(long)]
        lock_on_execute: bool,
    },
    /// List tasks
    List {
        #[arg(long)]
        queue: Option<String>,
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a task
    Show {
        /// Task ID (full UUID or prefix)
        id: String,
    },
    /// Cancel a task that has not started
    Cancel {
        id: String,
    },
    /// Requeue a task resting in error or dead
    Requeue {
        id: String,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Suspend a queue for a number of seconds (0 clears)
    Set { queue: String, seconds: i64 },
    /// Show a queue's lock and live slots
    Show { queue: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            queues,
            max_workers_per_queue,
            once,
            force_once,
            queue_limits,
            handlers,
            poll_interval_ms,
            memory,
        } => {
            cmd_serve(
                queues,
                max_workers_per_queue,
                once,
                force_once,
                queue_limits,
                handlers,
                poll_interval_ms,
                memory,
            )
            .await
        }
        Command::Task { action } => {
            let client = connect_client().await?;
            match action {
                TaskAction::Enqueue {
                    queue,
                    handler,
                    args,
                    delay,
                    unique_key,
                    max_retries,
                    lock_on_execute,
                } => {
                    cmd_task_enqueue(
                        &client,
                        queue,
                        handler,
                        args,
                        delay,
                        unique_key,
                        max_retries,
                        lock_on_execute,
                    )
                    .await
                }
                TaskAction::List {
                    queue,
                    state,
                    limit,
                } => cmd_task_list(&client, queue, state, limit).await,
                TaskAction::Show { id } => cmd_task_show(&client, id).await,
                TaskAction::Cancel { id } => cmd_task_cancel(&client, id).await,
                TaskAction::Requeue { id } => cmd_task_requeue(&client, id).await,
            }
        }
        Command::Lock { action } => {
            let client = connect_client().await?;
            match action {
                LockAction::Set { queue, seconds } => cmd_lock_set(&client, queue, seconds).await,
                LockAction::Show { queue } => cmd_lock_show(&client, queue).await,
            }
        }
        Command::Counts { queue } => {
            let client = connect_client().await?;
            cmd_counts(&client, queue).await
        }
        Command::Queues => {
            let client = connect_client().await?;
            cmd_queues(&client).await
        }
    }
}

async fn connect_client() -> anyhow::Result<Client> {
    let config = Config::from_env()?;
    let store = PgStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    Ok(Client::new(Arc::new(store), Arc::new(SystemClock)))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_serve(
    queues: Vec<String>,
    max_workers_per_queue: Option<u32>,
    once: bool,
    force_once: bool,
    queue_limits: Option<PathBuf>,
    handlers: Option<PathBuf>,
    poll_interval_ms: u64,
    memory: bool,
) -> anyhow::Result<()> {
    // Memory mode needs no environment; Postgres mode loads config first so
    // a missing DATABASE_URL fails before telemetry spins up.
    let config = if memory { None } else { Some(Config::from_env()?) };

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.as_ref().and_then(|c| c.otel_endpoint.clone()),
        service_name: "taskgate".to_string(),
        log_level: config
            .as_ref()
            .map(|c| c.log_level.clone())
            .unwrap_or_else(|| "info".to_string()),
    })?;

    let store: Arc<dyn TaskStore> = match config {
        Some(config) => {
            let store = PgStore::connect(config.database_url.expose_secret()).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::info!("using the in-memory store, tasks do not survive restart");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = match handlers {
        Some(path) => load_handlers(&path)?,
        None => HandlerRegistry::new(),
    };
    if registry.names().is_empty() {
        tracing::warn!("no handlers registered; claimed tasks will be dead-lettered");
    }

    let limits = match queue_limits {
        Some(path) => QueueLimits::load(&path)?,
        None => QueueLimits::default(),
    };

    let worker_config = WorkerConfig {
        queues,
        max_workers_per_queue,
        mode: if once || force_once {
            RunMode::Once
        } else {
            RunMode::Continuous
        },
        force_once,
        poll_interval: std::time::Duration::from_millis(poll_interval_ms),
        ..WorkerConfig::default()
    };

    let worker = Worker::new(
        store,
        Arc::new(SystemClock),
        Arc::new(registry),
        worker_config,
    )
    .with_limits(limits);

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_task_enqueue(
    client: &Client,
    queue: String,
    handler: String,
    args: Option<String>,
    delay: Option<u64>,
    unique_key: Option<String>,
    max_retries: Option<u32>,
    lock_on_execute: bool,
) -> anyhow::Result<()> {
    let args: serde_json::Value = match args {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewTask::new(&queue, &handler).args(args);
    if let Some(secs) = delay {
        new = new.delay_secs(secs);
    }
    if let Some(ref key) = unique_key {
        new = new.unique_key(key);
    }
    if let Some(n) = max_retries {
        new = new.max_retries(n);
    }
    if lock_on_execute {
        new = new.lock_on_execute();
    }

    match client.enqueue(new).await? {
        EnqueueOutcome::Created(task) => {
            println!("Created: {} (state: {})", task.id, task.state);
        }
        EnqueueOutcome::Deduplicated(task) => {
            println!("Duplicate: existing task {} (state: {})", task.id, task.state);
        }
    }
    Ok(())
}

async fn cmd_task_list(
    client: &Client,
    queue: Option<String>,
    state: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let state_filter: Option<TaskState> = match state {
        Some(s) => Some(s.parse()?),
        None => None,
    };

    let tasks = client.list(queue.as_deref(), state_filter, limit).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<14}  {:<18}  {:<9}  {:<7}  ENQUEUED",
        "ID", "QUEUE", "HANDLER", "STATE", "RETRIES"
    );
    println!("{}", "-".repeat(84));

    for task in &tasks {
        println!(
            "{:<8}  {:<14}  {:<18}  {:<9}  {:>3}/{:<3}  {}",
            task.id,
            truncate(&task.queue, 14),
            truncate(&task.handler, 18),
            task.state,
            task.retry_count,
            task.max_retries,
            task.enqueued_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_task_show(client: &Client, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(client, &id_str).await?;
    let task = client
        .get(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {id} not found"))?;

    println!("ID:           {}", task.id.0);
    println!("Queue:        {}", task.queue);
    println!("Handler:      {}", task.handler);
    println!("State:        {}", task.state);
    println!("Unique Key:   {}", task.unique_key.as_deref().unwrap_or("-"));
    println!("Exec Lock:    {}", if task.lock_on_execute { "yes" } else { "no" });
    println!("Retries:      {}/{}", task.retry_count, task.max_retries);
    println!("Args:         {}", serde_json::to_string_pretty(&task.args)?);
    println!("Enqueued:     {}", task.enqueued_at);
    if let Some(at) = task.queued_at {
        println!("Queued:       {at}");
    }
    if let Some(at) = task.execute_at {
        println!("Execute At:   {at}");
    }
    if let Some(at) = task.started_at {
        println!("Started:      {at}");
    }
    if let Some(ref err) = task.error_message {
        println!("Error:        {err}");
    }
    Ok(())
}

async fn cmd_task_cancel(client: &Client, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(client, &id_str).await?;
    if client.cancel(id).await? {
        println!("Cancelled: {id}");
    } else {
        println!("Not cancellable: {id} (already started or resting)");
    }
    Ok(())
}

async fn cmd_task_requeue(client: &Client, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(client, &id_str).await?;
    if client.requeue(id).await? {
        println!("Requeued: {id}");
    } else {
        println!("Not requeued: {id} (only error or dead tasks can be requeued)");
    }
    Ok(())
}

async fn cmd_lock_set(client: &Client, queue: String, seconds: i64) -> anyhow::Result<()> {
    let until = client
        .set_system_lock(&queue, chrono::Duration::seconds(seconds))
        .await?;
    if seconds > 0 {
        println!("Locked {queue} until {until}");
    } else {
        println!("Cleared lock on {queue}");
    }
    Ok(())
}

async fn cmd_lock_show(client: &Client, queue: String) -> anyhow::Result<()> {
    match client.get_system_lock(&queue).await? {
        Some(until) => println!("Locked until: {until}"),
        None => println!("Unlocked"),
    }

    let slots = client.live_slots(&queue).await?;
    if slots.is_empty() {
        println!("No live slots.");
    } else {
        println!("\n{:<24}  {:<20}  EXPIRES", "WORKER", "ACQUIRED");
        for slot in &slots {
            println!(
                "{:<24}  {:<20}  {}",
                truncate(&slot.worker_id, 24),
                slot.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                slot.expires_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn cmd_counts(client: &Client, queue: String) -> anyhow::Result<()> {
    let counts = client.queue_counts(&queue).await?;
    println!("queued:     {}", counts.queued);
    println!("scheduled:  {}", counts.scheduled);
    println!("active:     {}", counts.active);
    println!("error:      {}", counts.error);
    println!("dead:       {}", counts.dead);
    Ok(())
}

async fn cmd_queues(client: &Client) -> anyhow::Result<()> {
    let queues = client.list_queues().await?;
    if queues.is_empty() {
        println!("No queues.");
        return Ok(());
    }

    println!(
        "{:<20}  {:>7}  {:>9}  {:>7}  {:>6}  {:>5}",
        "QUEUE", "QUEUED", "SCHEDULED", "ACTIVE", "ERROR", "DEAD"
    );
    for queue in &queues {
        let counts = client.queue_counts(queue).await?;
        println!(
            "{:<20}  {:>7}  {:>9}  {:>7}  {:>6}  {:>5}",
            truncate(queue, 20),
            counts.queued,
            counts.scheduled,
            counts.active,
            counts.error,
            counts.dead
        );
    }
    Ok(())
}

/// Resolve a full UUID or a unique prefix to a task id.
async fn resolve_id(client: &Client, id_str: &str) -> anyhow::Result<TaskId> {
    if let Ok(uuid) = uuid::Uuid::parse_str(id_str) {
        return Ok(TaskId(uuid));
    }

    let tasks = client.list(None, None, 500).await?;
    let matches: Vec<_> = tasks
        .iter()
        .filter(|t| t.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no task matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("ambiguous prefix '{id_str}': {n} tasks match"),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
