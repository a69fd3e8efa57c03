//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器，负责按配置组装存储、缓存、锁、事件总线与限流器。

use crate::cache::CacheCoordinator;
use crate::config::Config;
use crate::error::{CoordError, Result};
use crate::events::EventBus;
use crate::loader::{BatchFn, BatchLoader};
use crate::lock::LockManager;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::rate_limiting::RateLimiter;
use crate::serialization::{json::JsonSerializer, SerializerEnum};
use crate::store::StoreAdapter;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{info, instrument};

/// 协调器
///
/// 持有同一个存储适配器之上的全部组件。克隆代价很低，可在任务间共享。
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<Config>,
    store: StoreAdapter,
    cache: CacheCoordinator,
    locks: LockManager,
    bus: EventBus,
    rate_limiter: RateLimiter,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("store", &self.store)
            .field("source", &self.bus.source())
            .finish()
    }
}

impl Coordinator {
    /// 按配置建立协调器
    ///
    /// 校验配置、连接存储，然后组装各组件。启用事件总线时，缓存失效会广播到
    /// `cache.invalidate`，并订阅其他实例的失效通知。
    ///
    /// # 参数
    ///
    /// * `config` - 协调器配置
    ///
    /// # 返回值
    ///
    /// 配置非法或初始连接失败时返回错误
    #[instrument(skip(config), level = "info", fields(mode = ?config.store.mode))]
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate().map_err(CoordError::Configuration)?;

        let metrics = Arc::new(Metrics::default());
        let serializer =
            SerializerEnum::Json(JsonSerializer::with_compression(config.cache.compression_threshold));
        let store = StoreAdapter::connect(&config.store)
            .await?
            .with_serializer(serializer)
            .with_metrics(metrics.clone())
            .with_scan_count(config.store.scan_count)
            .with_max_value_size(config.cache.max_value_size);

        let cache = CacheCoordinator::new(store.clone(), &config.cache);

        let locks = LockManager::new(store.clone(), &config.lock);
        locks.start_sweeper();

        let bus = if config.events.enabled {
            EventBus::new(store.clone(), config.events.source.clone())
        } else {
            EventBus::disabled(store.clone(), config.events.source.clone())
        };
        let attached = cache.attach_invalidation(&bus).await;

        let rate_limiter = RateLimiter::new(store.clone(), config.rate_limit.clone());

        info!(
            "Coordinator ready (source={}, events={}, invalidation_listener={})",
            bus.source(),
            bus.is_enabled(),
            attached
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            locks,
            bus,
            rate_limiter,
            metrics,
        })
    }

    /// 使用进程内存储的协调器
    pub async fn in_memory() -> Result<Self> {
        Self::connect(Config::in_memory()).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.store
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.cache
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// 创建批量加载器
    ///
    /// 加载器应随请求创建并随请求丢弃，记忆化结果不会跨请求共享。
    pub fn loader<K, V>(&self, batch_fn: impl BatchFn<K, V>) -> BatchLoader<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
        V: Clone + Send + Sync + 'static,
    {
        BatchLoader::new(batch_fn, &self.config.loader).with_metrics(self.metrics.clone())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 优雅关闭
    ///
    /// 停止锁清扫任务，取消全部订阅，然后关闭存储连接。
    #[instrument(skip(self), level = "info")]
    pub async fn graceful_shutdown(&self) {
        info!("Shutting down coordinator");
        self.locks.shutdown();
        self.bus.shutdown();
        self.store.graceful_shutdown().await;
        info!("Coordinator shut down");
    }
}
