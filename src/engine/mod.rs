//! Queue engine: per-kind bounded queues, their workers, line ingestion,
//! and the periodic stats loop.

pub mod dispatcher;
pub mod handler;
pub mod ingest;
pub mod stats;

pub use dispatcher::{DispatchStats, Dispatcher, ShutdownReport, Workers};
pub use handler::{Handler, HandlerRegistry};
pub use ingest::{IngestExit, IngestSummary, ingest_lines, ingest_until};
pub use stats::StatsCollector;
