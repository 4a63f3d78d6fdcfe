//! Metric instrument factories for conveyor.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"conveyor"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for conveyor instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("conveyor")
}

/// Counter: number of work items created.
/// Labels: `work_type`.
pub fn work_created() -> Counter<u64> {
    meter()
        .u64_counter("conveyor.work.created")
        .with_description("Number of work items created")
        .build()
}

/// Counter: number of work items claimed by a poll.
/// Labels: `work_type`.
pub fn work_claimed() -> Counter<u64> {
    meter()
        .u64_counter("conveyor.work.claimed")
        .with_description("Number of work items claimed for processing")
        .build()
}

/// Counter: processed work items by outcome.
/// Labels: `work_type`, `result` ("success" | "delete" | "failed" | "failing" | "pending").
pub fn work_processed() -> Counter<u64> {
    meter()
        .u64_counter("conveyor.work.processed")
        .with_description("Number of work items processed, by outcome")
        .build()
}

/// Counter: work items whose lease expired before the processor returned.
/// Labels: `work_type`.
pub fn work_timeouts() -> Counter<u64> {
    meter()
        .u64_counter("conveyor.work.timeouts")
        .with_description("Number of work items that exceeded their processing timeout")
        .build()
}

/// Histogram: processing duration in milliseconds.
/// Labels: `work_type`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("conveyor.work.processing_duration_ms")
        .with_description("Processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
