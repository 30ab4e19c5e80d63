//! Task execution span helpers.
//!
//! Provides span creation and outcome recording for compensation tasks
//! flowing through the engine.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for one execution attempt of a task.
///
/// The `task.outcome` field is declared empty and filled by
/// [`record_outcome`].
pub fn start_task_span(name: &str, id: &TaskId, group: i32, retries: i64) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = name,
        "task.id" = %id,
        "task.group" = group,
        "task.retries" = retries,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record the outcome of an attempt on its span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_outcome(span: &Span, outcome: &str, rows_affected: u64) {
    span.record("task.outcome", outcome);
    span.in_scope(|| {
        tracing::info!(outcome, rows_affected, "task_finalized");
    });
}

/// Start a span for one sweep over a group.
pub fn start_sweep_span(group: i32, limit: i64) -> Span {
    tracing::info_span!(
        "task.sweep",
        "task.group" = group,
        "sweep.limit" = limit,
        "sweep.claimed" = tracing::field::Empty,
    )
}
