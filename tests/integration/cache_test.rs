//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 缓存协调器集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{memory_coordinator, setup_logging};
use oxcoord::backend::MemoryStore;
use oxcoord::cache::keys;
use oxcoord::config::{CacheConfig, LocalTierConfig};
use oxcoord::{
    CacheCoordinator, CachePolicy, CoordError, EventBus, InvalidationTargets, StoreAdapter,
    TtlTier,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
    price_cents: u64,
}

fn product(id: u64) -> Product {
    Product {
        id,
        name: format!("product-{}", id),
        price_cents: 100 * id,
    }
}

#[tokio::test]
async fn test_set_get_and_expiry() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();

    assert!(cache.set("product:1", &product(1), 1u64).await);
    assert_eq!(cache.get::<Product>("product:1").await, Some(product(1)));
    assert!(cache.exists("product:1").await);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(cache.get::<Product>("product:1").await, None);
    assert!(!cache.exists("product:1").await);
}

#[tokio::test]
async fn test_get_or_set_runs_fetcher_once_for_concurrent_misses() {
    let coord = memory_coordinator().await;
    let cache = coord.cache().clone();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = |calls: Arc<AtomicUsize>| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, CoordError>(product(7))
    };

    let (a, b) = tokio::join!(
        cache.get_or_set("k", || fetch(calls.clone()), 60u64),
        cache.get_or_set("k", || fetch(calls.clone()), 60u64),
    );

    assert_eq!(a.unwrap(), product(7));
    assert_eq!(b.unwrap(), product(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_get_or_set_does_not_cache_errors() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();

    let failed = cache
        .get_or_set("product:9", || async { Err::<Product, _>("origin down") }, 60u64)
        .await;
    assert_eq!(failed.unwrap_err(), "origin down");
    assert!(!cache.exists("product:9").await);

    let loaded = cache
        .get_or_set("product:9", || async { Ok::<_, &str>(product(9)) }, 60u64)
        .await
        .unwrap();
    assert_eq!(loaded, product(9));
    assert_eq!(cache.get::<Product>("product:9").await, Some(product(9)));
}

#[tokio::test]
async fn test_refresh_cache_replaces_stale_value() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();
    cache.set("product:3", &product(3), TtlTier::Long).await;

    let mut updated = product(3);
    updated.price_cents = 1;
    let fresh = updated.clone();
    let refreshed = cache
        .refresh_cache("product:3", || async move { Ok::<_, CoordError>(fresh) }, TtlTier::Long)
        .await
        .unwrap();

    assert_eq!(refreshed, updated);
    assert_eq!(cache.get::<Product>("product:3").await, Some(updated));
}

#[tokio::test]
async fn test_del_pattern_removes_exactly_matching_keys() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();

    for id in 1..=3 {
        cache.set(&keys::product(id), &product(id), 60u64).await;
    }
    cache.set(&keys::user(1), &"alice", 60u64).await;
    cache.set("products:abc", &vec![1u64, 2], 60u64).await;

    let deleted = cache.del_pattern("product:*").await;
    assert_eq!(deleted, 3);

    for id in 1..=3 {
        assert!(!cache.exists(&keys::product(id)).await);
    }
    assert!(cache.exists(&keys::user(1)).await);
    assert!(cache.exists("products:abc").await);
}

#[tokio::test]
async fn test_invalidate_product_does_not_touch_similar_ids() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();

    cache.set(&keys::product(1), &product(1), 60u64).await;
    cache.set(&keys::product(12), &product(12), 60u64).await;
    cache.set(&keys::search("shoes", "00ff"), &vec![1u64], 60u64).await;
    cache.set(&keys::products("00ff"), &vec![1u64, 12], 60u64).await;

    cache.invalidate_product("1").await;

    assert!(!cache.exists(&keys::product(1)).await);
    assert!(cache.exists(&keys::product(12)).await);
    assert!(!cache.exists(&keys::search("shoes", "00ff")).await);
    assert!(!cache.exists(&keys::products("00ff")).await);
}

#[tokio::test]
async fn test_tag_invalidation() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();
    let tags = vec!["shop:5".to_string()];

    cache.set_with_tags("product:1", &product(1), 60u64, &tags).await;
    cache.set_with_tags("product:2", &product(2), 60u64, &tags).await;
    cache.set("product:3", &product(3), 60u64).await;

    assert_eq!(cache.invalidate_tag("shop:5").await, 2);
    assert!(!cache.exists("product:1").await);
    assert!(!cache.exists("product:2").await);
    assert!(cache.exists("product:3").await);
    assert!(coord.store().scan("tag:shop:5:*").await.is_empty());
}

#[tokio::test]
async fn test_mget_mset_preserve_order() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();

    let pairs = vec![
        ("product:1".to_string(), product(1)),
        ("product:3".to_string(), product(3)),
    ];
    assert!(cache.mset(&pairs, 60u64).await);

    let values = cache
        .mget::<Product>(&[
            "product:3".to_string(),
            "product:2".to_string(),
            "product:1".to_string(),
        ])
        .await;
    assert_eq!(values, vec![Some(product(3)), None, Some(product(1))]);
}

#[tokio::test]
async fn test_warm_only_fills_cold_keys() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();
    cache.set("product:1", &product(100), 60u64).await;

    let report = cache
        .warm(
            vec![
                ("product:1".to_string(), product(1)),
                ("product:2".to_string(), product(2)),
            ],
            TtlTier::Short,
        )
        .await;

    assert_eq!(report.requested, 2);
    assert_eq!(report.loaded, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(cache.get::<Product>("product:1").await, Some(product(100)));
    assert_eq!(cache.get::<Product>("product:2").await, Some(product(2)));
}

#[tokio::test]
async fn test_warm_with_loads_cold_keys_in_batches() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();
    cache.set("product:1", &product(1), 60u64).await;
    let requested = Arc::new(std::sync::Mutex::new(Vec::new()));

    let seen = requested.clone();
    let report = cache
        .warm_with(
            &["product:1".to_string(), "product:2".to_string()],
            move |keys: Vec<String>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().extend(keys.clone());
                    Ok::<_, CoordError>(
                        keys.into_iter()
                            .map(|k| (k, product(2)))
                            .collect::<Vec<_>>(),
                    )
                }
            },
            TtlTier::Short,
        )
        .await
        .unwrap();

    assert_eq!(report.loaded, 1);
    assert_eq!(*requested.lock().unwrap(), vec!["product:2".to_string()]);
}

#[tokio::test]
async fn test_cached_and_invalidating_wrappers() {
    let coord = memory_coordinator().await;
    let cache = coord.cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let get_product = cache.cached(
        CachePolicy::<u64>::new("get_product")
            .key_with(|id| keys::product(*id))
            .ttl(TtlTier::Medium),
        move |id: u64| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoordError>(product(id))
            }
        },
    );

    assert_eq!(get_product.call(4).await.unwrap(), product(4));
    assert_eq!(get_product.call(4).await.unwrap(), product(4));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let update_product = cache.invalidating(
        InvalidationTargets::<u64>::new().keys_from(|id| vec![keys::product(*id)]),
        |id: u64| async move { Ok::<_, CoordError>(id) },
    );
    update_product.call(4).await.unwrap();

    assert_eq!(get_product.call(4).await.unwrap(), product(4));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_near_cache_evicted_by_remote_invalidation() {
    setup_logging();
    let shared = StoreAdapter::new(Arc::new(MemoryStore::default()));
    let config = CacheConfig {
        local_tier: Some(LocalTierConfig::default()),
        ..Default::default()
    };

    let writer = CacheCoordinator::new(shared.clone(), &config);
    let reader = CacheCoordinator::new(shared.clone(), &config);
    let writer_bus = EventBus::new(shared.clone(), Some("writer".to_string()));
    let reader_bus = EventBus::new(shared.clone(), Some("reader".to_string()));
    assert!(writer.attach_invalidation(&writer_bus).await);
    assert!(reader.attach_invalidation(&reader_bus).await);

    writer.set("product:1", &product(1), 60u64).await;
    assert_eq!(reader.get::<Product>("product:1").await, Some(product(1)));
    assert!(reader.local_entry_count().is_some());

    // 远端删除后，读者的近端副本必须随通知一起失效
    writer.del("product:1").await;
    let mut evicted = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if reader.get::<Product>("product:1").await.is_none() {
            evicted = true;
            break;
        }
    }
    assert!(evicted);

    writer_bus.shutdown();
    reader_bus.shutdown();
}
