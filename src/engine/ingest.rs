//! Line-delimited JSON ingestion.
//!
//! Each input line is `{"kind": ..., "payload": {...}}`. Lines are read on a
//! plain thread so a blocked read never holds up the runtime, and every
//! event is offered to the dispatcher without waiting.

use std::future::Future;
use std::io::{self, BufRead};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::model::{Kind, Payload};

use super::dispatcher::Dispatcher;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// One line of ingestion input.
#[derive(Deserialize)]
struct Envelope {
    kind: Kind,
    #[serde(default)]
    payload: Payload,
}

/// Counts from one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: u64,
    pub refused: u64,
    pub malformed: u64,
}

/// Why [`ingest_until`] returned.
#[derive(Debug)]
pub enum IngestExit {
    /// Input reached EOF and every queue drained.
    Exhausted(IngestSummary),
    /// The stop signal fired, while reading or while draining.
    Stopped,
    /// Reading the input failed.
    Failed(io::Error),
}

/// Feed `input` into the dispatcher from a detached thread until EOF.
pub fn ingest_lines<R>(input: R, dispatcher: Dispatcher) -> oneshot::Receiver<io::Result<IngestSummary>>
where
    R: BufRead + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut summary = IngestSummary::default();
        let mut result = Ok(());

        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let envelope: Envelope = match serde_json::from_str(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("skipping malformed event: {e}");
                    summary.malformed += 1;
                    continue;
                }
            };
            if dispatcher.enqueue(envelope.kind, envelope.payload) {
                summary.accepted += 1;
            } else {
                summary.refused += 1;
            }
        }

        info!(
            accepted = summary.accepted,
            refused = summary.refused,
            malformed = summary.malformed,
            "ingestion finished"
        );
        let _ = done_tx.send(result.map(|()| summary));
    });
    done_rx
}

/// Ingest `input`, then wait for the queues to empty, giving up as soon as
/// `stop` resolves.
///
/// Never shuts the dispatcher down; the caller does that whatever the exit.
pub async fn ingest_until<R, S>(dispatcher: &Dispatcher, input: R, stop: S) -> IngestExit
where
    R: BufRead + Send + 'static,
    S: Future,
{
    let mut stop = std::pin::pin!(stop);

    let summary = tokio::select! {
        _ = &mut stop => return IngestExit::Stopped,
        done = ingest_lines(input, dispatcher.clone()) => match done {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => return IngestExit::Failed(e),
            Err(_) => return IngestExit::Failed(io::Error::other("ingestion thread exited early")),
        },
    };

    info!("input exhausted, draining queues");
    tokio::select! {
        _ = &mut stop => IngestExit::Stopped,
        _ = drain(dispatcher) => IngestExit::Exhausted(summary),
    }
}

async fn drain(dispatcher: &Dispatcher) {
    while dispatcher.depths().values().any(|&depth| depth > 0) {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}
