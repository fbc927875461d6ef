//! Span helpers for work items, result messages, and triggers.
//!
//! Lifecycle changes (idle to running, running to acked, ...) are emitted
//! as events inside the span via [`record_state_transition`].

use tracing::Span;

/// Start a span for one fetch operation on a work item.
pub fn start_work_span(operation: &str, work_id: &str, priority: &str) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.operation" = operation,
        "work.id" = work_id,
        "work.priority" = priority,
    )
}

/// Start a span for one delivery handled by a persistence worker.
pub fn start_message_span(topic: &str, message_id: i64, read_count: i32) -> Span {
    tracing::info_span!(
        "message.handle",
        "message.topic" = topic,
        "message.id" = message_id,
        "message.read_count" = read_count,
    )
}

/// Start a span for one trigger evaluation.
pub fn start_trigger_span(trigger: &str) -> Span {
    tracing::info_span!(
        "trigger.run",
        "trigger.name" = trigger,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
