//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! Redis集成测试：Lua 脚本、SCAN 与发布/订阅在真实 Redis 上的行为。
//! Redis 不可用时跳过。

#[path = "../common/mod.rs"]
mod common;

use common::{is_redis_available, redis_config, setup_logging, unique_name};
use oxcoord::config::{Config, LocalTierConfig};
use oxcoord::{handler_fn, CoordError, Coordinator, EventChannel, TtlTier};
use std::time::Duration;

async fn connect(namespace: &str, source: &str, near: bool) -> Option<Coordinator> {
    setup_logging();
    if !is_redis_available().await {
        println!("跳过测试: Redis不可用");
        return None;
    }
    let mut config: Config = redis_config();
    config.cache.namespace = Some(namespace.to_string());
    config.events.source = Some(source.to_string());
    if near {
        config.cache.local_tier = Some(LocalTierConfig::default());
    }
    match Coordinator::connect(config).await {
        Ok(coord) => Some(coord),
        Err(e) => {
            println!("跳过测试: Redis连接失败 - {}", e);
            None
        }
    }
}

#[tokio::test]
async fn test_redis_cache_round_trip_and_pattern_delete() {
    let ns = unique_name("cache");
    let Some(coord) = connect(&ns, "a", false).await else {
        return;
    };
    let cache = coord.cache();

    assert!(cache.set("product:1", &"one", TtlTier::Short).await);
    assert!(cache.set("product:2", &"two", TtlTier::Short).await);
    assert!(cache.set("user:1", &"alice", TtlTier::Short).await);
    assert_eq!(cache.get::<String>("product:1").await.as_deref(), Some("one"));

    let remaining = cache.ttl_remaining("product:1").await.unwrap();
    assert!(remaining <= Duration::from_secs(300));

    assert_eq!(cache.del_pattern("product:*").await, 2);
    assert!(!cache.exists("product:2").await);
    assert!(cache.exists("user:1").await);

    cache.del_pattern("*").await;
    coord.graceful_shutdown().await;
}

#[tokio::test]
async fn test_redis_lock_scripts() {
    let Some(coord) = connect(&unique_name("lock"), "a", false).await else {
        return;
    };
    let locks = coord.locks();
    let resource = unique_name("inventory:update");
    let opts = locks.options().once().ttl(Duration::from_millis(1000));

    let lock = locks.acquire(&resource, &opts).await.unwrap();
    assert!(locks.acquire(&resource, &opts).await.is_none());
    assert!(!locks.release(&resource, "intruder").await);
    assert!(locks.extend(&resource, &lock.lock_id, Duration::from_millis(300)).await);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!locks.release(&resource, &lock.lock_id).await);
    assert!(locks.try_acquire(&resource).await.is_some());

    locks.force_release(&resource).await;
    coord.graceful_shutdown().await;
}

#[tokio::test]
async fn test_redis_semaphore_accounting() {
    let Some(coord) = connect(&unique_name("sem"), "a", false).await else {
        return;
    };
    let semaphore = coord.locks().semaphore(&unique_name("exports"), 3);

    let permit = semaphore.acquire(2).await.unwrap().unwrap();
    assert!(semaphore.acquire(2).await.unwrap().is_none());
    assert_eq!(semaphore.used().await, 2);
    assert!(semaphore.release(&permit).await.unwrap());
    assert!(!semaphore.release(&permit).await.unwrap());
    assert_eq!(semaphore.available().await, 3);
    assert!(matches!(
        semaphore.acquire(5).await,
        Err(CoordError::PermitsExceeded { .. })
    ));
    coord.graceful_shutdown().await;
}

#[tokio::test]
async fn test_redis_pubsub_evicts_remote_near_cache() {
    let ns = unique_name("near");
    let Some(writer) = connect(&ns, "writer", true).await else {
        return;
    };
    let Some(reader) = connect(&ns, "reader", true).await else {
        return;
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    reader
        .events()
        .subscribe(
            EventChannel::CacheInvalidate,
            handler_fn(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.source.clone());
                    Ok::<(), CoordError>(())
                }
            }),
        )
        .await
        .unwrap();

    writer.cache().set("product:9", &9u32, TtlTier::Short).await;
    assert_eq!(reader.cache().get::<u32>("product:9").await, Some(9));

    writer.cache().del("product:9").await;
    let source = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(source.as_deref(), Some("writer"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reader.cache().get::<u32>("product:9").await, None);

    writer.graceful_shutdown().await;
    reader.graceful_shutdown().await;
}
