//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 批量加载器集成测试

#[path = "../common/mod.rs"]
mod common;

use common::memory_coordinator;
use oxcoord::cache::keys;
use oxcoord::{batch_fn, BatchLoader, CachedBatchFn, CoordError, LoaderRegistry, TtlTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shop {
    id: u64,
    name: String,
}

fn shop(id: u64) -> Shop {
    Shop {
        id,
        name: format!("shop-{}", id),
    }
}

#[tokio::test]
async fn test_concurrent_loads_share_one_fetch() {
    let coord = memory_coordinator().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let loader = coord.loader(batch_fn(move |ids: Vec<u64>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CoordError>(ids.into_iter().map(|id| (id, shop(id))).collect::<HashMap<_, _>>())
        }
    }));

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(11).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Some(shop(11)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coord.metrics().loader_batches, 1);
}

#[tokio::test]
async fn test_load_many_returns_request_order() {
    let coord = memory_coordinator().await;
    let loader = coord.loader(batch_fn(|ids: Vec<u64>| async move {
        // 来源按自己的顺序返回，并缺失偶数ID
        let mut rows: Vec<u64> = ids.into_iter().filter(|id| id % 2 == 1).collect();
        rows.sort_unstable_by(|a, b| b.cmp(a));
        Ok::<_, CoordError>(rows.into_iter().map(|id| (id, shop(id))).collect::<HashMap<_, _>>())
    }));

    let values = loader.load_many(&[5, 2, 9, 1]).await.unwrap();
    assert_eq!(values, vec![Some(shop(5)), None, Some(shop(9)), Some(shop(1))]);
}

#[tokio::test]
async fn test_failed_batch_is_not_memoized() {
    let coord = memory_coordinator().await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let loader = coord.loader(batch_fn(move |ids: Vec<u64>| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(CoordError::Store("origin timeout".to_string()));
            }
            Ok::<_, CoordError>(ids.into_iter().map(|id| (id, shop(id))).collect::<HashMap<_, _>>())
        }
    }));

    let first = loader.load(3).await;
    assert!(matches!(first, Err(CoordError::BatchLoad(_))));

    assert_eq!(loader.load(3).await.unwrap(), Some(shop(3)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_clear_all_forces_refetch() {
    let coord = memory_coordinator().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let loader = coord.loader(batch_fn(move |ids: Vec<u64>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CoordError>(ids.into_iter().map(|id| (id, shop(id))).collect::<HashMap<_, _>>())
        }
    }));

    loader.load(1).await.unwrap();
    loader.load(1).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    loader.clear_all();
    loader.load(1).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cached_batch_fn_only_fetches_misses() {
    let coord = memory_coordinator().await;
    coord.cache().set(&keys::shop(1), &shop(1), 60u64).await;
    let fetched = Arc::new(Mutex::new(Vec::new()));

    let seen = fetched.clone();
    let origin = batch_fn(move |ids: Vec<u64>| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().extend(ids.iter().copied());
            Ok::<_, CoordError>(ids.into_iter().map(|id| (id, shop(id))).collect::<HashMap<_, _>>())
        }
    });
    let cached = CachedBatchFn::new(origin, coord.cache().clone(), |id: &u64| keys::shop(*id), TtlTier::Short);
    let loader: BatchLoader<u64, Shop> = coord.loader(cached);

    let values = loader.load_many(&[1, 2]).await.unwrap();
    assert_eq!(values, vec![Some(shop(1)), Some(shop(2))]);
    assert_eq!(*fetched.lock().unwrap(), vec![2]);
    assert_eq!(coord.cache().get::<Shop>(&keys::shop(2)).await, Some(shop(2)));
}

#[tokio::test]
async fn test_registry_clears_every_loader() {
    let coord = memory_coordinator().await;
    let registry = LoaderRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    registry.register(
        "shop",
        coord.loader(batch_fn(move |ids: Vec<u64>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoordError>(ids.into_iter().map(|id| (id, shop(id))).collect::<HashMap<_, _>>())
            }
        })),
    );

    let loader = registry.get::<u64, Shop>("shop").unwrap();
    loader.load(8).await.unwrap();
    loader.load(8).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    registry.clear_all();
    loader.load(8).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(registry.get::<String, Shop>("shop").is_none());
}
