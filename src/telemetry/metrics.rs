//! Metric instrument factories for surge-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"surge-rs"` meter; without an OTLP
//! endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("surge-rs")
}

/// Counter: items accepted into a queue.
/// Labels: `kind`.
pub fn items_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("surge.queue.enqueued")
        .with_description("Items accepted into a queue")
        .build()
}

/// Counter: items refused because their queue was full or shut down.
/// Labels: `kind`, `reason` ("full" | "closed").
pub fn items_rejected() -> Counter<u64> {
    meter()
        .u64_counter("surge.queue.rejected")
        .with_description("Items refused at enqueue")
        .build()
}

/// Counter: items a handler finished successfully.
/// Labels: `kind`.
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("surge.queue.processed")
        .with_description("Items processed successfully")
        .build()
}

/// Counter: handler errors and panics.
/// Labels: `kind`, `fault` ("error" | "panic" | "unrouted").
pub fn handler_failures() -> Counter<u64> {
    meter()
        .u64_counter("surge.queue.handler_failures")
        .with_description("Handler faults")
        .build()
}

/// Counter: document store operations.
/// Labels: `operation`, `result`.
pub fn store_operations() -> Counter<u64> {
    meter()
        .u64_counter("surge.store.operations")
        .with_description("Document store operations")
        .build()
}

/// Counter: cache lookups.
/// Labels: `cache`, `result` ("hit" | "miss").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("surge.cache.lookups")
        .with_description("Cache lookups")
        .build()
}

/// Counter: reclamation runs.
/// Labels: `trigger`.
pub fn reclaim_runs() -> Counter<u64> {
    meter()
        .u64_counter("surge.reclaim.runs")
        .with_description("Memory reclamation runs")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("surge.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
