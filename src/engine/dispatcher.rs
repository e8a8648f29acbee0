//! Dispatcher: one bounded FIFO queue and one worker per kind.
//!
//! Ingestion calls [`Dispatcher::enqueue`], which never blocks: a full or
//! shut-down queue refuses the item and the caller gets `false`. Each worker
//! handles its kind's items strictly one at a time, in arrival order. A
//! handler that errors or panics is counted and logged; the worker moves on
//! to the next item.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::{Kind, Payload, QueueItem};
use crate::telemetry::dispatch::{record_outcome, start_item_span};
use crate::telemetry::metrics;

use super::handler::{Handler, HandlerRegistry};

struct KindQueue {
    kind: Kind,
    capacity: usize,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
}

impl KindQueue {
    fn new(kind: Kind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            kind,
            capacity,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn depth(&self) -> usize {
        // A closed channel no longer reports capacity; its items are gone.
        if self.tx.is_closed() {
            return 0;
        }
        self.capacity.saturating_sub(self.tx.capacity())
    }
}

#[derive(Default)]
struct Counters {
    processed: [AtomicU64; 3],
    rejected: [AtomicU64; 3],
    errors: AtomicU64,
}

/// Point-in-time copy of the dispatcher's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DispatchStats {
    /// Items whose handler returned successfully, per kind.
    pub processed: BTreeMap<Kind, u64>,
    /// Items refused at enqueue, per kind.
    pub rejected: BTreeMap<Kind, u64>,
    /// Handler errors, panics, and items with no handler.
    pub errors: u64,
}

impl DispatchStats {
    pub fn total_processed(&self) -> u64 {
        self.processed.values().sum()
    }
}

/// Items still queued when shutdown was signalled. They are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub abandoned: BTreeMap<Kind, usize>,
}

impl ShutdownReport {
    pub fn total_abandoned(&self) -> usize {
        self.abandoned.values().sum()
    }
}

/// Bounded multi-queue dispatcher. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    queues: Arc<[KindQueue; 3]>,
    handlers: Arc<HandlerRegistry>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl Dispatcher {
    pub fn new(config: &QueueConfig, handlers: HandlerRegistry) -> Self {
        let queues = Kind::ALL.map(|kind| KindQueue::new(kind, config.capacity(kind)));
        Self {
            queues: Arc::new(queues),
            handlers: Arc::new(handlers),
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    fn queue(&self, kind: Kind) -> &KindQueue {
        &self.queues[kind.index()]
    }

    /// Spawn one worker per kind on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the workers were already started.
    pub fn start(&self) -> Result<Workers> {
        let mut receivers = Vec::with_capacity(Kind::ALL.len());
        for queue in self.queues.iter() {
            let rx = queue
                .rx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or_else(|| Error::Other("dispatcher already started".to_string()))?;
            receivers.push((queue.kind, rx));
        }

        let handles = receivers
            .into_iter()
            .map(|(kind, rx)| {
                let worker = Worker {
                    kind,
                    handler: self.handlers.get(kind),
                    counters: Arc::clone(&self.counters),
                    shutdown: self.shutdown.clone(),
                };
                (kind, tokio::spawn(worker.run(rx)))
            })
            .collect();

        info!("dispatcher started");
        Ok(Workers { handles })
    }

    /// Offer an event to its kind's queue. Returns `false` when the queue is
    /// full or the dispatcher is shutting down; the event is then dropped.
    pub fn enqueue(&self, kind: Kind, payload: Payload) -> bool {
        self.enqueue_item(QueueItem::new(kind, payload))
    }

    pub fn enqueue_item(&self, item: QueueItem) -> bool {
        let kind = item.kind;
        if self.shutdown.is_cancelled() {
            self.reject(kind, "closed");
            return false;
        }

        match self.queue(kind).tx.try_send(item) {
            Ok(()) => {
                metrics::items_enqueued().add(1, &[KeyValue::new("kind", kind.as_str())]);
                true
            }
            Err(TrySendError::Full(item)) => {
                warn!(%kind, id = %item.id, "queue full, item dropped");
                self.reject(kind, "full");
                false
            }
            Err(TrySendError::Closed(item)) => {
                debug!(%kind, id = %item.id, "queue closed, item dropped");
                self.reject(kind, "closed");
                false
            }
        }
    }

    fn reject(&self, kind: Kind, reason: &'static str) {
        self.counters.rejected[kind.index()].fetch_add(1, Ordering::Relaxed);
        metrics::items_rejected().add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("reason", reason),
            ],
        );
    }

    /// Signal all workers to stop. A handler already running finishes; queued
    /// items are not handled.
    pub fn shutdown(&self) -> ShutdownReport {
        let report = ShutdownReport {
            abandoned: self.depths(),
        };
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            let abandoned = report.total_abandoned();
            if abandoned > 0 {
                warn!(abandoned, "dispatcher shut down with queued items");
            } else {
                info!("dispatcher shut down");
            }
        }
        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled on shutdown, for loops that should stop with the
    /// dispatcher.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn capacity(&self, kind: Kind) -> usize {
        self.queue(kind).capacity
    }

    pub fn depth(&self, kind: Kind) -> usize {
        self.queue(kind).depth()
    }

    /// Current queue depth per kind.
    pub fn depths(&self) -> BTreeMap<Kind, usize> {
        Kind::ALL.iter().map(|&kind| (kind, self.depth(kind))).collect()
    }

    pub fn processed(&self, kind: Kind) -> u64 {
        self.counters.processed[kind.index()].load(Ordering::Relaxed)
    }

    pub fn rejected(&self, kind: Kind) -> u64 {
        self.counters.rejected[kind.index()].load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            processed: Kind::ALL.iter().map(|&k| (k, self.processed(k))).collect(),
            rejected: Kind::ALL.iter().map(|&k| (k, self.rejected(k))).collect(),
            errors: self.error_count(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Join handles for the per-kind workers.
pub struct Workers {
    handles: Vec<(Kind, JoinHandle<()>)>,
}

impl Workers {
    /// Wait for every worker to exit. Call after [`Dispatcher::shutdown`].
    pub async fn join(self) {
        for (kind, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(%kind, "worker task failed: {e}");
            }
        }
    }

    /// Wait up to `timeout` for the workers, then abort the stragglers.
    /// Returns `true` if every worker exited on its own.
    pub async fn join_timeout(self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut clean = true;
        for (kind, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%kind, "worker task failed: {e}"),
                Err(_) => {
                    warn!(%kind, "worker did not stop in time, aborting");
                    handle.abort();
                    clean = false;
                }
            }
        }
        clean
    }
}

struct Worker {
    kind: Kind,
    handler: Option<Arc<dyn Handler>>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<QueueItem>) {
        let kind = self.kind;
        if self.handler.is_none() {
            warn!(%kind, "no handler registered, items of this kind will be dropped");
        }
        debug!(%kind, "worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.process(item).await;
        }

        rx.close();
        debug!(%kind, "worker stopped");
    }

    async fn process(&self, item: QueueItem) {
        let kind = self.kind;
        let id = item.id;
        let span = start_item_span(&item);

        async {
            let outcome = match self.handler.as_deref() {
                None => {
                    warn!(%kind, %id, "no handler for item, dropped");
                    "unrouted"
                }
                Some(handler) => match AssertUnwindSafe(handler.handle(item)).catch_unwind().await {
                    Ok(Ok(())) => "ok",
                    Ok(Err(e)) => {
                        error!(%kind, %id, error = %format!("{e:#}"), "handler failed");
                        "error"
                    }
                    Err(payload) => {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(%kind, %id, panic = %message, "handler panicked");
                        "panic"
                    }
                },
            };

            if outcome == "ok" {
                self.counters.processed[kind.index()].fetch_add(1, Ordering::Relaxed);
                metrics::items_processed().add(1, &[KeyValue::new("kind", kind.as_str())]);
            } else {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                metrics::handler_failures().add(
                    1,
                    &[
                        KeyValue::new("kind", kind.as_str()),
                        KeyValue::new("fault", outcome),
                    ],
                );
            }
            record_outcome(&span, outcome);
        }
        .instrument(span.clone())
        .await
    }
}
