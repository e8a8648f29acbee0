//! Span helpers for queue items flowing through the dispatcher.

use tracing::Span;

use crate::model::QueueItem;

/// Start a span covering one item's handler run.
///
/// The `item.outcome` field is declared empty and filled by
/// [`record_outcome`].
pub fn start_item_span(item: &QueueItem) -> Span {
    tracing::info_span!(
        "queue.handle",
        "item.kind" = %item.kind,
        "item.id" = %item.id,
        "item.wait_ms" = (chrono::Utc::now() - item.enqueued_at).num_milliseconds(),
        "item.outcome" = tracing::field::Empty,
    )
}

/// Record how the handler run ended ("ok", "error", "panic", "unrouted").
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("item.outcome", outcome);
}
