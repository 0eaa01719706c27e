//! Task execution span helpers.

use tracing::Span;

use crate::model::{TaskId, TaskState};

/// Start a span covering one handler execution.
///
/// The `task.state` field starts empty and is filled in by
/// [`record_transition`] as the task moves on.
pub fn start_task_span(queue: &str, handler: &str, id: TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.queue" = queue,
        "task.handler" = handler,
        "task.id" = %id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition event scoped to the given span.
pub fn record_transition(span: &Span, to: TaskState) {
    span.record("task.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(to = %to, "state_transition");
    });
}
