//! # taskgate
//!
//! Postgres-backed background task queue with per-queue admission control.
//!
//! Producers enqueue tasks through [`client::Client`]; workers claim and
//! execute them under per-queue concurrency slots and queue system locks.
//! All coordination goes through the shared store, so any number of worker
//! processes can run against the same database.

pub mod client;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod worker;
