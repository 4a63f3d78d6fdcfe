//! Integration tests for telemetry initialization and span helpers.

use conveyor::model::WorkId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = conveyor::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "conveyor-test".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = conveyor::telemetry::init_telemetry(config);
}

#[test]
fn work_span_creates_and_records_transition() {
    let id = WorkId::new();
    let span = conveyor::telemetry::work::start_work_span("org.example.test.a", &id);
    span.in_scope(|| {
        conveyor::telemetry::work::record_state_transition("pending", "processing");
    });
}
