//! Integration tests for the TTL cache.

use std::time::Duration;

use surge_rs::cache::{MemoCache, MemoKey, TtlCache};
use surge_rs::reclaim::{Pressure, Reclaimable};

fn test_cache(capacity: u64) -> TtlCache<String, u64> {
    TtlCache::new("test", capacity)
}

#[test]
fn entry_is_gone_after_its_ttl() {
    let cache = test_cache(10);
    cache.set("short".to_string(), 1, Duration::from_millis(50));
    cache.set("long".to_string(), 2, Duration::from_secs(60));

    assert_eq!(cache.get(&"short".to_string()), Some(1));
    std::thread::sleep(Duration::from_millis(150));

    assert_eq!(cache.get(&"short".to_string()), None);
    assert_eq!(cache.get(&"long".to_string()), Some(2));
}

#[test]
fn replacing_an_entry_resets_its_ttl() {
    let cache = test_cache(10);
    cache.set("k".to_string(), 1, Duration::from_millis(50));
    cache.set("k".to_string(), 2, Duration::from_secs(60));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(cache.get(&"k".to_string()), Some(2));
}

#[test]
fn capacity_is_never_exceeded() {
    let cache = test_cache(20);
    for i in 0..200u64 {
        cache.set(format!("key-{i}"), i, Duration::from_secs(60));
    }
    assert!(cache.len() <= 20);
}

#[test]
fn routine_reclaim_keeps_live_entries() {
    let cache = test_cache(10);
    cache.set("live".to_string(), 1, Duration::from_secs(60));
    cache.set("dead".to_string(), 2, Duration::from_millis(20));
    std::thread::sleep(Duration::from_millis(100));

    cache.reclaim(Pressure::Routine);

    assert_eq!(cache.get(&"live".to_string()), Some(1));
    assert_eq!(cache.get(&"dead".to_string()), None);
    assert_eq!(cache.len(), 1);
}

#[test]
fn invalidate_where_drops_matching_keys() {
    let cache = test_cache(10);
    for key in ["user:1", "user:2", "chat:1"] {
        cache.set(key.to_string(), 0, Duration::from_secs(60));
    }

    cache.invalidate_where(|key: &String| key.starts_with("user:"));

    assert_eq!(cache.get(&"user:1".to_string()), None);
    assert_eq!(cache.get(&"user:2".to_string()), None);
    assert_eq!(cache.get(&"chat:1".to_string()), Some(0));
}

#[tokio::test]
async fn get_or_try_insert_with_computes_once() {
    let cache: MemoCache = TtlCache::new("memo", 10);
    let key = MemoKey::new("double", &21).unwrap();
    let mut calls = 0;

    for _ in 0..3 {
        let value = cache
            .get_or_try_insert_with(key.clone(), Duration::from_secs(60), || {
                calls += 1;
                async { Ok::<_, String>(serde_json::json!(42)) }
            })
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(42));
    }
    assert_eq!(calls, 1);
}

#[tokio::test]
async fn failed_computations_are_not_cached() {
    let cache: MemoCache = TtlCache::new("memo", 10);
    let key = MemoKey::new("lookup", &"missing").unwrap();

    let err = cache
        .get_or_try_insert_with(key.clone(), Duration::from_secs(60), || async {
            Err::<serde_json::Value, _>("backend down")
        })
        .await;
    assert!(err.is_err());
    assert!(cache.get(&key).is_none());
}
