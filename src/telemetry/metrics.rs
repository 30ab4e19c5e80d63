//! Metric instrument factories for compensator-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"compensator-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for compensator-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("compensator-rs")
}

/// Counter: tasks persisted by a submission.
/// Labels: `name`, `mode` ("sync" | "async").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("compensator.task.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: tasks leased by sweeps.
/// Labels: `group`.
pub fn tasks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("compensator.task.claimed")
        .with_description("Number of tasks claimed by sweeps")
        .build()
}

/// Counter: execution attempts.
/// Labels: `name`, `outcome` ("ok" | "error" | "panic" | "timeout" | "cancelled" | "not_found").
pub fn task_attempts() -> Counter<u64> {
    meter()
        .u64_counter("compensator.task.attempts")
        .with_description("Number of task execution attempts")
        .build()
}

/// Counter: finalize writes.
/// Labels: `operation` ("delete" | "record_error"), `applied` (bool).
pub fn tasks_finalized() -> Counter<u64> {
    meter()
        .u64_counter("compensator.task.finalized")
        .with_description("Number of finalize writes")
        .build()
}

/// Histogram: attempt duration in milliseconds.
/// Labels: `name`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("compensator.task.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
