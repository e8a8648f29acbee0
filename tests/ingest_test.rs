//! Integration tests for line ingestion and its stop signal.

use std::io::{self, BufReader, Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use surge_rs::config::QueueConfig;
use surge_rs::engine::{Dispatcher, HandlerRegistry, IngestExit, ingest_until};
use surge_rs::model::{Kind, QueueItem};

fn input(lines: &str) -> BufReader<Cursor<Vec<u8>>> {
    BufReader::new(Cursor::new(lines.as_bytes().to_vec()))
}

/// Yields `data`, then fails every read.
struct BrokenPipe {
    data: Cursor<Vec<u8>>,
}

impl Read for BrokenPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::BrokenPipe, "input closed")),
            n => Ok(n),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eof_drains_queues_and_reports_counts() {
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    let handlers = HandlerRegistry::empty().register(Kind::Message, move |_item: QueueItem| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });
    let dispatcher = Dispatcher::new(&QueueConfig::default(), handlers);
    let workers = dispatcher.start().unwrap();

    let lines = "{\"kind\":\"message\",\"payload\":{\"text\":\"hi\"}}\n\nnot json\n{\"kind\":\"message\"}\n";
    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        ingest_until(&dispatcher, input(lines), std::future::pending::<()>()),
    )
    .await
    .unwrap();

    let summary = match exit {
        IngestExit::Exhausted(summary) => summary,
        other => panic!("expected exhausted input, got {other:?}"),
    };
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.malformed, 1);
    assert_eq!(dispatcher.depth(Kind::Message), 0);

    dispatcher.shutdown();
    assert!(workers.join_timeout(Duration::from_secs(5)).await);
    assert_eq!(handled.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_signal_ends_a_drain_stuck_on_a_slow_handler() {
    let handlers = HandlerRegistry::empty().register(Kind::File, |_item: QueueItem| async {
        std::future::pending::<()>().await;
        Ok::<(), anyhow::Error>(())
    });
    let dispatcher = Dispatcher::new(&QueueConfig::default(), handlers);
    let workers = dispatcher.start().unwrap();

    let lines = "{\"kind\":\"file\"}\n{\"kind\":\"file\"}\n{\"kind\":\"file\"}\n";
    let stop = tokio::time::sleep(Duration::from_millis(300));
    let exit = tokio::time::timeout(Duration::from_secs(5), ingest_until(&dispatcher, input(lines), stop))
        .await
        .expect("drain ignored the stop signal");

    assert!(matches!(exit, IngestExit::Stopped));
    assert!(dispatcher.depth(Kind::File) > 0);

    let report = dispatcher.shutdown();
    assert!(report.total_abandoned() > 0);
    assert!(!workers.join_timeout(Duration::from_millis(100)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_error_is_reported_without_shutting_down() {
    let dispatcher = Dispatcher::new(&QueueConfig::default(), HandlerRegistry::empty());
    let reader = BufReader::new(BrokenPipe {
        data: Cursor::new(b"{\"kind\":\"callback\"}\n".to_vec()),
    });

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        ingest_until(&dispatcher, reader, std::future::pending::<()>()),
    )
    .await
    .unwrap();

    let e = match exit {
        IngestExit::Failed(e) => e,
        other => panic!("expected a read failure, got {other:?}"),
    };
    assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
    // The caller still owns shutdown and sees what was accepted.
    assert!(!dispatcher.is_shut_down());
    assert_eq!(dispatcher.depth(Kind::Callback), 1);
}
