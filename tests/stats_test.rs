//! Integration tests for the periodic stats collector.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use surge_rs::config::{QueueConfig, ReclaimerConfig, StatsConfig, StoreConfig};
use surge_rs::engine::{Dispatcher, HandlerRegistry, StatsCollector};
use surge_rs::model::{Kind, Payload, QueueItem, StatsSnapshot};
use surge_rs::reclaim::Reclaimer;
use surge_rs::store::Store;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn test_collector(handlers: HandlerRegistry) -> (TempDir, Arc<Store>, Dispatcher, StatsCollector) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&StoreConfig::with_root(dir.path())).await.unwrap());
    let dispatcher = Dispatcher::new(&QueueConfig::default(), handlers);
    let reclaimer = Arc::new(Reclaimer::new(ReclaimerConfig::default()));
    let collector = StatsCollector::new(
        &StatsConfig::default(),
        dispatcher.clone(),
        Arc::clone(&store),
        reclaimer,
    );
    (dir, store, dispatcher, collector)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collect_once_persists_camel_case_snapshot() {
    let handlers = HandlerRegistry::empty().register(Kind::Message, |item: QueueItem| async move {
        if item.payload.contains_key("fail") {
            anyhow::bail!("rejected by handler");
        }
        Ok::<(), anyhow::Error>(())
    });
    let (_dir, store, dispatcher, collector) = test_collector(handlers).await;

    dispatcher.enqueue(Kind::Message, Payload::new());
    dispatcher.enqueue(Kind::Message, Payload::new());
    let mut failing = Payload::new();
    failing.insert("fail".to_string(), json!(true));
    dispatcher.enqueue(Kind::Message, failing);
    dispatcher.enqueue(Kind::File, Payload::new());

    let workers = dispatcher.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.error_count() < 2 || dispatcher.processed(Kind::Message) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let snapshot = collector.collect_once().await.unwrap();
    assert_eq!(snapshot.processed_by_kind["message"], 2);
    assert_eq!(snapshot.processed_by_kind["file"], 0);
    // One handler error plus one unrouted file item.
    assert_eq!(snapshot.error_count, 2);
    assert_eq!(snapshot.queue_depths.len(), 3);
    assert!(snapshot.items_per_second > 0.0);

    let doc = store.load("performance_stats").await.unwrap();
    for key in [
        "uptimeSeconds",
        "processedByKind",
        "errorCount",
        "queueDepths",
        "rejectedByKind",
        "itemsPerSecond",
        "timestamp",
    ] {
        assert!(doc.contains_key(key), "missing {key}");
    }
    let stored: StatsSnapshot = serde_json::from_value(serde_json::Value::Object(doc)).unwrap();
    assert_eq!(stored.error_count, 2);

    dispatcher.shutdown();
    workers.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loop_writes_until_cancelled() {
    let (_dir, store, dispatcher, collector) = test_collector(HandlerRegistry::empty()).await;
    dispatcher.enqueue(Kind::Callback, Payload::new());

    let collector = collector.with_interval(Duration::from_millis(50));
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let handle = tokio::spawn(async move { collector.run(loop_token).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.load("performance_stats").await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let doc = store.load("performance_stats").await.unwrap();
    assert_eq!(doc["queueDepths"]["callback"], 1);
    assert_eq!(doc["rejectedByKind"]["callback"], 0);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_interval_is_clamped_instead_of_panicking() {
    let (_dir, store, _dispatcher, collector) = test_collector(HandlerRegistry::empty()).await;
    let collector = collector.with_interval(Duration::ZERO);

    let token = CancellationToken::new();
    let loop_token = token.clone();
    let handle = tokio::spawn(async move { collector.run(loop_token).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.load("performance_stats").await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}
