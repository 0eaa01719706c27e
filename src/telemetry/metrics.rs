//! Metric instrument factories for taskgate.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Instruments are created lazily from the `"taskgate"` meter, so they are
//! cheap no-ops until a provider is installed.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskgate")
}

/// Counter: tasks accepted by `enqueue`.
/// Labels: `queue`, `result` ("created" | "deduplicated").
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("taskgate.tasks.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: task state transitions.
/// Labels: `queue`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskgate.tasks.transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: claim attempts by workers.
/// Labels: `queue`, `outcome` ("executed" | "empty" | "denied_lock" | "denied_slots").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("taskgate.claims")
        .with_description("Number of worker claim attempts")
        .build()
}

/// Counter: slot admissions and releases.
/// Labels: `queue`, `operation` ("acquire" | "renew" | "release"), `granted`.
pub fn slot_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskgate.slots.operations")
        .with_description("Number of concurrency slot operations")
        .build()
}

/// Histogram: handler execution duration in milliseconds.
/// Labels: `queue`, `handler`, `outcome`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskgate.task.duration_ms")
        .with_description("Handler execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: tasks whose handler name has no registration.
/// Labels: `queue`, `handler`.
pub fn tasks_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("taskgate.tasks.unroutable")
        .with_description("Tasks with no registered handler")
        .build()
}
