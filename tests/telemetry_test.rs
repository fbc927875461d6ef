//! Integration tests for telemetry initialization and span helpers.

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    let config = harvest::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "harvest-test".to_string(),
        log_level: "debug".to_string(),
        json: false,
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = harvest::telemetry::init_telemetry(config);
}

#[test]
fn work_span_creates_and_records_transition() {
    let span = harvest::telemetry::work::start_work_span("character", "1f3a9c2e", "normal");
    harvest::telemetry::work::record_state_transition(&span, "queued", "running");
}

#[test]
fn message_and_trigger_spans_record_transitions() {
    let span = harvest::telemetry::work::start_message_span("marketOrders", 42, 1);
    harvest::telemetry::work::record_state_transition(&span, "received", "ack");

    let span = harvest::telemetry::work::start_trigger_span("marketRegions");
    harvest::telemetry::work::record_state_transition(&span, "idle", "due");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;

    harvest::telemetry::metrics::api_retries().add(1, &[KeyValue::new("reason", "connection")]);
    harvest::telemetry::metrics::work_processed().add(
        1,
        &[
            KeyValue::new("operation", "character"),
            KeyValue::new("outcome", "ok"),
        ],
    );
    harvest::telemetry::metrics::operation_duration_ms()
        .record(12.5, &[KeyValue::new("operation", "character")]);
}
