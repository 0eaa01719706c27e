//! Delayed-task promotion.

use std::sync::Arc;

use opentelemetry::KeyValue;

use crate::clock::Clock;
use crate::error::Result;
use crate::model::Task;
use crate::store::TaskStore;
use crate::telemetry::metrics;

/// Moves scheduled tasks whose `execute_at` has passed back into the
/// queued state. Safe to run from many workers at once; the store
/// guarantees each task is promoted exactly once.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn promote_due(&self, queue: &str) -> Result<Vec<Task>> {
        let promoted = self.store.promote_due(queue, self.clock.now()).await?;
        if !promoted.is_empty() {
            tracing::debug!(queue, count = promoted.len(), "promoted due tasks");
            metrics::task_transitions().add(
                promoted.len() as u64,
                &[
                    KeyValue::new("queue", queue.to_string()),
                    KeyValue::new("to", "queued"),
                ],
            );
        }
        Ok(promoted)
    }
}
