//! Parallel batch transforms on a bounded worker pool.
//!
//! A batch is split into contiguous chunks, one per pool worker, and each
//! chunk is transformed on the pool. Results come back in input order. A
//! chunk that fails (error or panic) contributes nothing and is reported in
//! [`BatchOutput::failed`]; the rest of the batch still succeeds.

use std::any::Any;
use std::convert::Infallible;
use std::fmt::Display;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use rayon::prelude::*;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// A chunk that produced no results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    /// Chunk position within the batch.
    pub index: usize,
    /// Input positions the chunk covered.
    pub range: Range<usize>,
    pub error: String,
}

/// Results of a batch run, in input order, minus any failed chunks.
#[derive(Debug)]
pub struct BatchOutput<R> {
    pub results: Vec<R>,
    pub failed: Vec<ChunkFailure>,
}

impl<R> Default for BatchOutput<R> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<R> BatchOutput<R> {
    /// True when every chunk succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_results(self) -> Vec<R> {
        self.results
    }
}

struct ChunkResult<R> {
    index: usize,
    range: Range<usize>,
    outcome: std::result::Result<Vec<R>, String>,
}

/// Fixed-size pool for CPU-bound fan-out.
pub struct BatchProcessor {
    pool: Arc<rayon::ThreadPool>,
    workers: usize,
}

impl BatchProcessor {
    /// Pool sized to `min(max_workers, available parallelism)`.
    pub fn new(config: &BatchConfig) -> Result<Self> {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(config.max_workers.min(available))
    }

    /// Pool with exactly `workers` threads.
    pub fn with_workers(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("surge-batch-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("failed to build batch pool: {e}")))?;
        debug!(workers, "batch pool started");
        Ok(Self {
            pool: Arc::new(pool),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Apply `f` to every item on the pool. Blocks the calling thread.
    ///
    /// A panic inside `f` fails only the chunk it happened in.
    pub fn run<T, R, F>(&self, items: &[T], f: F) -> BatchOutput<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        self.try_run(items, |item| Ok::<R, Infallible>(f(item)))
    }

    /// Like [`run`](Self::run) for a fallible transform: the first error in
    /// a chunk fails that chunk.
    pub fn try_run<T, R, E, F>(&self, items: &[T], f: F) -> BatchOutput<R>
    where
        T: Sync,
        R: Send,
        E: Display,
        F: Fn(&T) -> std::result::Result<R, E> + Sync,
    {
        run_chunks(&self.pool, self.workers, items, f)
    }

    /// Run one CPU-bound job on the pool and await its result.
    ///
    /// A panic inside `f` is reported as an error.
    pub async fn spawn<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(Error::Other(panic_message(payload.as_ref()))));
            let _ = tx.send(outcome);
        });
        rx.await
            .map_err(|_| Error::Other("batch worker vanished before reporting".to_string()))?
    }

    /// Run a batch from async code without blocking the runtime.
    pub async fn run_async<T, R, F>(&self, items: Vec<T>, f: F) -> BatchOutput<R>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        let len = items.len();
        let (tx, rx) = oneshot::channel();
        let pool = Arc::clone(&self.pool);
        let workers = self.workers;

        self.pool.spawn(move || {
            let output = run_chunks(&pool, workers, &items, |item| Ok::<R, Infallible>(f(item)));
            let _ = tx.send(output);
        });

        match rx.await {
            Ok(output) => output,
            Err(_) => {
                error!(items = len, "batch worker vanished before reporting");
                BatchOutput {
                    results: Vec::new(),
                    failed: vec![ChunkFailure {
                        index: 0,
                        range: 0..len,
                        error: "batch worker vanished".to_string(),
                    }],
                }
            }
        }
    }
}

fn run_chunks<T, R, E, F>(pool: &rayon::ThreadPool, workers: usize, items: &[T], f: F) -> BatchOutput<R>
where
    T: Sync,
    R: Send,
    E: Display,
    F: Fn(&T) -> std::result::Result<R, E> + Sync,
{
    if items.is_empty() {
        return BatchOutput::default();
    }

    let start = Instant::now();
    let chunk_size = items.len().div_ceil(workers);

    let mut chunks: Vec<ChunkResult<R>> = pool.install(|| {
        items
            .par_chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let first = index * chunk_size;
                let range = first..first + chunk.len();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    chunk.iter().map(&f).collect::<std::result::Result<Vec<R>, E>>()
                }));
                let outcome = match outcome {
                    Ok(Ok(results)) => Ok(results),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => Err(panic_message(payload.as_ref())),
                };
                ChunkResult {
                    index,
                    range,
                    outcome,
                }
            })
            .collect()
    });

    // Reassemble by chunk index so output order equals input order.
    chunks.sort_by_key(|chunk| chunk.index);

    let mut output = BatchOutput {
        results: Vec::with_capacity(items.len()),
        failed: Vec::new(),
    };
    for chunk in chunks {
        match chunk.outcome {
            Ok(results) => output.results.extend(results),
            Err(error) => {
                error!(
                    chunk = chunk.index,
                    start = chunk.range.start,
                    end = chunk.range.end,
                    %error,
                    "batch chunk failed"
                );
                output.failed.push(ChunkFailure {
                    index: chunk.index,
                    range: chunk.range,
                    error,
                });
            }
        }
    }

    let result = if output.is_complete() { "ok" } else { "partial" };
    metrics::operation_duration_ms().record(
        start.elapsed().as_secs_f64() * 1000.0,
        &[
            KeyValue::new("operation", "batch.run"),
            KeyValue::new("result", result),
        ],
    );
    output
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
