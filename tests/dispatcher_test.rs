//! Integration tests for the dispatcher and its workers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use surge_rs::config::QueueConfig;
use surge_rs::engine::{Dispatcher, HandlerRegistry};
use surge_rs::model::{Kind, Payload, QueueItem};
use tokio::sync::Notify;

fn payload(n: u64) -> Payload {
    let mut p = Payload::new();
    p.insert("n".to_string(), json!(n));
    p
}

fn n_of(item: &QueueItem) -> u64 {
    item.payload["n"].as_u64().unwrap_or_default()
}

fn test_dispatcher(handlers: HandlerRegistry) -> Dispatcher {
    Dispatcher::new(&QueueConfig::default(), handlers)
}

/// Poll `done` until it holds, failing the test after five seconds.
async fn wait_until(done: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[test]
fn burst_beyond_capacity_is_refused() {
    let dispatcher = test_dispatcher(HandlerRegistry::empty());
    assert_eq!(dispatcher.capacity(Kind::Message), 1000);

    let accepted = (0..1200)
        .filter(|&n| dispatcher.enqueue(Kind::Message, payload(n)))
        .count();

    assert_eq!(accepted, 1000);
    assert_eq!(dispatcher.rejected(Kind::Message), 200);
    assert_eq!(dispatcher.depth(Kind::Message), 1000);
    assert_eq!(dispatcher.depth(Kind::Callback), 0);
}

#[test]
fn default_capacities_per_kind() {
    let dispatcher = test_dispatcher(HandlerRegistry::empty());
    assert_eq!(dispatcher.capacity(Kind::Message), 1000);
    assert_eq!(dispatcher.capacity(Kind::Callback), 500);
    assert_eq!(dispatcher.capacity(Kind::File), 100);
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn items_of_a_kind_are_handled_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handlers = HandlerRegistry::empty().register(Kind::Message, move |item: QueueItem| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(n_of(&item));
            Ok::<(), anyhow::Error>(())
        }
    });

    let dispatcher = test_dispatcher(handlers);
    for n in 0..50 {
        assert!(dispatcher.enqueue(Kind::Message, payload(n)));
    }
    let workers = dispatcher.start().unwrap();

    wait_until(|| dispatcher.processed(Kind::Message) == 50).await;
    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    assert_eq!(dispatcher.depth(Kind::Message), 0);

    dispatcher.shutdown();
    workers.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_item_does_not_stop_its_worker() {
    let handlers = HandlerRegistry::empty().register(Kind::File, |item: QueueItem| async move {
        if n_of(&item) == 3 {
            anyhow::bail!("corrupt upload");
        }
        Ok::<(), anyhow::Error>(())
    });

    let dispatcher = test_dispatcher(handlers);
    for n in 1..=10 {
        assert!(dispatcher.enqueue(Kind::File, payload(n)));
    }
    let workers = dispatcher.start().unwrap();

    wait_until(|| dispatcher.processed(Kind::File) + dispatcher.error_count() == 10).await;
    assert_eq!(dispatcher.processed(Kind::File), 9);
    assert_eq!(dispatcher.error_count(), 1);

    dispatcher.shutdown();
    workers.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_is_isolated() {
    let handlers = HandlerRegistry::empty().register(Kind::Callback, |item: QueueItem| async move {
        if n_of(&item) == 2 {
            panic!("handler bug");
        }
        Ok::<(), anyhow::Error>(())
    });

    let dispatcher = test_dispatcher(handlers);
    for n in 1..=5 {
        dispatcher.enqueue(Kind::Callback, payload(n));
    }
    let workers = dispatcher.start().unwrap();

    wait_until(|| dispatcher.processed(Kind::Callback) == 4).await;
    assert_eq!(dispatcher.error_count(), 1);

    // The worker is still alive.
    assert!(dispatcher.enqueue(Kind::Callback, payload(6)));
    wait_until(|| dispatcher.processed(Kind::Callback) == 5).await;

    dispatcher.shutdown();
    workers.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kind_without_handler_is_drained_as_errors() {
    let dispatcher = test_dispatcher(HandlerRegistry::empty());
    dispatcher.enqueue(Kind::Callback, payload(1));
    dispatcher.enqueue(Kind::Callback, payload(2));
    let workers = dispatcher.start().unwrap();

    wait_until(|| dispatcher.error_count() == 2).await;
    assert_eq!(dispatcher.processed(Kind::Callback), 0);
    assert_eq!(dispatcher.depth(Kind::Callback), 0);

    dispatcher.shutdown();
    workers.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_kind_does_not_block_others() {
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let handlers = HandlerRegistry::empty()
        .register(Kind::File, move |_item: QueueItem| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok::<(), anyhow::Error>(())
            }
        })
        .register(Kind::Message, |_item: QueueItem| async { Ok::<(), anyhow::Error>(()) });

    let dispatcher = test_dispatcher(handlers);
    let workers = dispatcher.start().unwrap();

    dispatcher.enqueue(Kind::File, payload(1));
    for n in 0..20 {
        dispatcher.enqueue(Kind::Message, payload(n));
    }
    wait_until(|| dispatcher.processed(Kind::Message) == 20).await;
    assert_eq!(dispatcher.processed(Kind::File), 0);

    release.notify_one();
    wait_until(|| dispatcher.processed(Kind::File) == 1).await;

    dispatcher.shutdown();
    workers.join().await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_lets_running_handler_finish() {
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let (s, f, c) = (Arc::clone(&started), Arc::clone(&finished), Arc::clone(&calls));
    let handlers = HandlerRegistry::empty().register(Kind::Message, move |_item: QueueItem| {
        let (started, finished, calls) = (Arc::clone(&s), Arc::clone(&f), Arc::clone(&c));
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            started.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            finished.store(true, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });

    let dispatcher = test_dispatcher(handlers);
    for n in 0..3 {
        dispatcher.enqueue(Kind::Message, payload(n));
    }
    let workers = dispatcher.start().unwrap();
    started.notified().await;

    let report = dispatcher.shutdown();
    assert_eq!(report.abandoned[&Kind::Message], 2);
    assert_eq!(report.total_abandoned(), 2);

    workers.join().await;
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.processed(Kind::Message), 1);
}

#[tokio::test]
async fn enqueue_after_shutdown_is_refused() {
    let dispatcher = test_dispatcher(HandlerRegistry::empty());
    let workers = dispatcher.start().unwrap();

    dispatcher.shutdown();
    assert!(!dispatcher.enqueue(Kind::Message, payload(1)));
    assert_eq!(dispatcher.rejected(Kind::Message), 1);

    workers.join().await;
    assert!(!dispatcher.enqueue(Kind::File, payload(2)));
    assert!(dispatcher.is_shut_down());
}

#[tokio::test]
async fn stats_snapshot_reports_every_kind() {
    let dispatcher = test_dispatcher(HandlerRegistry::empty());
    dispatcher.enqueue(Kind::File, payload(1));

    let stats = dispatcher.stats();
    assert_eq!(stats.processed.len(), 3);
    assert_eq!(stats.total_processed(), 0);
    assert_eq!(dispatcher.depths()[&Kind::File], 1);
}
