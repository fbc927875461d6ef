//! Metric instrument factories for harvest-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"harvest-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("harvest-rs")
}

/// Histogram: latency of a single upstream API attempt.
/// Labels: `server.address`.
pub fn api_call_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("harvest.api.call.duration_ms")
        .with_description("Upstream API attempt latency in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: upstream responses with status >= 300, plus connection failures (status 0).
/// Labels: `http.response.status_code`.
pub fn api_errors() -> Counter<u64> {
    meter()
        .u64_counter("harvest.api.errors")
        .with_description("Upstream API error responses")
        .build()
}

/// Counter: transport retries.
/// Labels: `reason` ("rate_limited" | "server_error" | "connection").
pub fn api_retries() -> Counter<u64> {
    meter()
        .u64_counter("harvest.api.retries")
        .with_description("Upstream API request retries")
        .build()
}

/// Counter: work queue operations.
/// Labels: `operation` ("enqueue" | "dequeue" | "dequeue_empty" | "mark_completed" | "schedule" | "take_due").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("harvest.queue.operations")
        .with_description("Number of work queue operations")
        .build()
}

/// Counter: work items processed by the fetch pool.
/// Labels: `operation`, `outcome` ("ok" | "error" | "cooldown" | "skipped").
pub fn work_processed() -> Counter<u64> {
    meter()
        .u64_counter("harvest.work.processed")
        .with_description("Work items processed by fetch workers")
        .build()
}

/// Counter: bus operations.
/// Labels: `topic`, `operation` ("publish" | "receive" | "receive_empty" | "ack" | "requeue").
pub fn bus_operations() -> Counter<u64> {
    meter()
        .u64_counter("harvest.bus.operations")
        .with_description("Number of bus operations")
        .build()
}

/// Counter: messages handled by persistence workers.
/// Labels: `topic`, `outcome` ("ack" | "requeue" | "dropped").
pub fn messages_handled() -> Counter<u64> {
    meter()
        .u64_counter("harvest.messages.handled")
        .with_description("Result messages handled by persistence workers")
        .build()
}

/// Counter: storage writes retried after a deadlock or serialization failure.
/// Labels: `operation`.
pub fn storage_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("harvest.storage.conflicts")
        .with_description("Storage writes retried after a transient conflict")
        .build()
}

/// Counter: trigger executions.
/// Labels: `trigger`, `outcome` ("ok" | "error").
pub fn trigger_runs() -> Counter<u64> {
    meter()
        .u64_counter("harvest.trigger.runs")
        .with_description("Trigger handler executions")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("harvest.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
