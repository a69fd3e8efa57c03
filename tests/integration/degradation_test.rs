//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 存储故障降级测试：存储完全不可用时，所有操作返回安全默认值而不是错误。

#[path = "../common/mod.rs"]
mod common;

use async_trait::async_trait;
use common::{setup_logging, FlakyStore};
use oxcoord::backend::{AtomicScript, KvStore, MessageStream, ScriptReply, Subscription};
use oxcoord::config::{CacheConfig, LockConfig};
use oxcoord::metrics::Metrics;
use oxcoord::rate_limiting::RateLimitConfig;
use oxcoord::{
    CacheCoordinator, CoordError, EventBus, EventChannel, LockManager, RateLimiter, Result,
    StoreAdapter,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 每个调用都失败的存储
#[derive(Debug, Default)]
struct UnreachableStore {
    calls: AtomicUsize,
}

impl UnreachableStore {
    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CoordError::Store("connection refused".to_string()))
    }
}

#[async_trait]
impl KvStore for UnreachableStore {
    async fn ping(&self) -> Result<()> {
        self.fail()
    }

    async fn get_bytes(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        self.fail()
    }

    async fn set_bytes(&self, _key: &str, _value: Vec<u8>, _ttl_secs: u64) -> Result<()> {
        self.fail()
    }

    async fn set_nx_px(&self, _key: &str, _value: &str, _ttl_ms: u64) -> Result<bool> {
        self.fail()
    }

    async fn del(&self, _keys: &[String]) -> Result<u64> {
        self.fail()
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        self.fail()
    }

    async fn mget_bytes(&self, _keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.fail()
    }

    async fn mset_bytes(&self, _items: Vec<(String, Vec<u8>)>, _ttl_secs: u64) -> Result<()> {
        self.fail()
    }

    async fn incr(&self, _key: &str, _delta: i64) -> Result<i64> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl_secs: u64) -> Result<bool> {
        self.fail()
    }

    async fn pttl(&self, _key: &str) -> Result<Option<u64>> {
        self.fail()
    }

    async fn scan_match(&self, _pattern: &str, _count: usize) -> Result<Vec<String>> {
        self.fail()
    }

    async fn eval(
        &self,
        _script: &AtomicScript,
        _keys: &[String],
        _args: &[String],
    ) -> Result<ScriptReply> {
        self.fail()
    }

    async fn publish(&self, _channel: &str, _payload: &str) -> Result<u64> {
        self.fail()
    }

    async fn listen(&self, _subscription: &Subscription) -> Result<MessageStream> {
        self.fail()
    }
}

fn unreachable_adapter() -> (Arc<UnreachableStore>, StoreAdapter, Arc<Metrics>) {
    setup_logging();
    let raw = Arc::new(UnreachableStore::default());
    let metrics = Arc::new(Metrics::default());
    let adapter = StoreAdapter::new(raw.clone()).with_metrics(metrics.clone());
    (raw, adapter, metrics)
}

#[tokio::test]
async fn test_cache_reads_and_writes_degrade_to_defaults() {
    let (raw, store, metrics) = unreachable_adapter();
    let cache = CacheCoordinator::new(store, &CacheConfig::default());

    assert_eq!(cache.get::<String>("product:1").await, None);
    assert!(!cache.set("product:1", "value", 60u64).await);
    assert!(!cache.del("product:1").await);
    assert!(!cache.exists("product:1").await);
    assert_eq!(
        cache.mget::<String>(&["a".to_string(), "b".to_string()]).await,
        vec![None, None]
    );
    assert_eq!(cache.del_pattern("product:*").await, 0);
    assert_eq!(cache.invalidate_tag("shop:1").await, 0);
    assert_eq!(cache.ttl_remaining("product:1").await, None);

    assert!(raw.calls.load(Ordering::SeqCst) > 0);
    assert!(metrics.snapshot().store_errors > 0);
}

#[tokio::test]
async fn test_get_or_set_falls_back_to_origin() {
    let (_raw, store, _metrics) = unreachable_adapter();
    let cache = CacheCoordinator::new(store, &CacheConfig::default());
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
        let value = cache
            .get_or_set(
                "user:1",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CoordError>("alice".to_string())
                },
                60u64,
            )
            .await
            .unwrap();
        assert_eq!(value, "alice");
    }
    // 无法缓存时每次都回源
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_locks_are_not_acquired_when_store_is_down() {
    let (_raw, store, _metrics) = unreachable_adapter();
    let locks = LockManager::new(store, &LockConfig::default());

    assert!(locks.try_acquire("inventory:update").await.is_none());
    assert!(!locks.release("inventory:update", "any").await);
    assert!(!locks.extend("inventory:update", "any", std::time::Duration::from_secs(1)).await);
    assert!(!locks.is_locked("inventory:update").await);

    let semaphore = locks.semaphore("exports", 2);
    assert!(semaphore.acquire(1).await.unwrap().is_none());
    assert_eq!(semaphore.used().await, 0);
}

#[tokio::test]
async fn test_event_bus_and_rate_limiter_fail_open() {
    let (_raw, store, _metrics) = unreachable_adapter();
    let bus = EventBus::new(store.clone(), None);

    assert_eq!(
        bus.publish(EventChannel::AnalyticsUpdate, "tick", serde_json::json!({}))
            .await,
        0
    );
    let handler = oxcoord::handler_fn(|_event| async { Ok::<(), CoordError>(()) });
    assert!(bus.subscribe(EventChannel::AnalyticsUpdate, handler).await.is_none());

    let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());
    let decision = limiter.check("10.1.1.1").await;
    assert!(decision.allowed);
    assert_eq!(decision.count, 0);

    assert!(!store.is_healthy().await);
}

#[tokio::test]
async fn test_rate_limit_window_expires_when_expire_fails() {
    setup_logging();
    let raw = Arc::new(FlakyStore::failing_expire());
    let store = StoreAdapter::new(raw.clone());
    let limiter = RateLimiter::new(
        store.clone(),
        RateLimitConfig {
            window_secs: 1,
            max_requests: 1,
        },
    );

    assert!(limiter.check("10.1.1.1").await.allowed);
    assert!(!limiter.check("10.1.1.1").await.allowed);
    assert!(store.pttl("rate_limit:10.1.1.1").await.is_some());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(limiter.check("10.1.1.1").await.allowed);
}

#[tokio::test]
async fn test_rate_limit_counter_without_ttl_is_repaired() {
    let raw = Arc::new(FlakyStore::failing_expire());
    let store = StoreAdapter::new(raw.clone());
    // 计数器已存在但没有过期时间
    raw.incr("rate_limit:10.2.2.2", 5).await.unwrap();
    assert!(store.pttl("rate_limit:10.2.2.2").await.is_none());

    let limiter = RateLimiter::new(
        store.clone(),
        RateLimitConfig {
            window_secs: 1,
            max_requests: 1,
        },
    );
    assert!(!limiter.check("10.2.2.2").await.allowed);
    assert!(store.pttl("rate_limit:10.2.2.2").await.is_some());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(limiter.check("10.2.2.2").await.allowed);
}
