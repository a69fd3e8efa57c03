//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了旁路缓存协调器：读穿、回填、按模式和标签失效、预热。
//!
//! 存储故障一律按未命中处理，调用方永远拿不到存储错误。

pub mod invalidation;
pub mod keys;
pub mod layer;
pub mod near;
pub mod ttl;

pub use invalidation::{InvalidationNotice, NearInvalidationHandler};
pub use layer::{CachePolicy, CachedOperation, InvalidatingOperation, InvalidationTargets, WarmingOperation};
pub use near::NearCache;
pub use ttl::{CacheTtl, TtlTier};

use crate::config::CacheConfig;
use crate::events::{EventBus, EventChannel};
use crate::metrics::Metrics;
use crate::serialization::Serializer;
use crate::store::StoreAdapter;
use crate::utils::{escape_glob, validate_key_length, GlobMatcher};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// 单次删除请求的最大键数
const DELETE_CHUNK: usize = 500;
/// 预热时单次批量写入的最大条目数
const WARM_CHUNK: usize = 100;

/// 预热结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    /// 请求预热的键数
    pub requested: usize,
    /// 实际写入的键数
    pub loaded: usize,
    /// 已经存在而跳过的键数
    pub skipped: usize,
}

struct CacheInner {
    store: StoreAdapter,
    namespace: Option<String>,
    default_ttl: CacheTtl,
    max_key_length: usize,
    near: Option<NearCache>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    bus: OnceLock<EventBus>,
    metrics: Arc<Metrics>,
}

/// 缓存协调器
///
/// 克隆开销很小，所有克隆共享同一组状态。
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("namespace", &self.inner.namespace)
            .field("near", &self.inner.near)
            .finish()
    }
}

impl CacheCoordinator {
    /// 创建缓存协调器
    ///
    /// # 参数
    ///
    /// * `store` - 存储适配器
    /// * `config` - 缓存配置
    pub fn new(store: StoreAdapter, config: &CacheConfig) -> Self {
        let metrics = store.metrics().clone();
        Self {
            inner: Arc::new(CacheInner {
                store,
                namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
                default_ttl: config.default_tier.into(),
                max_key_length: config.max_key_length,
                near: config.local_tier.as_ref().map(NearCache::new),
                inflight: DashMap::new(),
                bus: OnceLock::new(),
                metrics,
            }),
        }
    }

    /// 基于进程内存储、默认配置的协调器
    pub fn in_memory() -> Self {
        Self::new(StoreAdapter::in_memory(), &CacheConfig::default())
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.inner.store
    }

    pub fn default_ttl(&self) -> CacheTtl {
        self.inner.default_ttl
    }

    /// 近端缓存中的条目数，未启用时为 None
    pub fn local_entry_count(&self) -> Option<u64> {
        self.inner.near.as_ref().map(NearCache::entry_count)
    }

    /// 接入事件总线
    ///
    /// 之后每次失效都会在 `cache.invalidate` 上广播，其他实例据此清理各自的
    /// 近端缓存。只能接入一次，重复调用返回 false。
    pub async fn attach_invalidation(&self, bus: &EventBus) -> bool {
        if self.inner.bus.set(bus.clone()).is_err() {
            return false;
        }
        if self.inner.near.is_some() {
            let handler = Arc::new(NearInvalidationHandler::new(
                self.inner.near.clone(),
                bus.source().to_string(),
            ));
            if bus
                .subscribe(EventChannel::CacheInvalidate, handler)
                .await
                .is_none()
            {
                warn!("Could not listen for remote invalidations; relying on near-cache TTL");
            }
        }
        true
    }

    // ---- 键处理 ----

    fn full_key(&self, key: &str) -> String {
        match &self.inner.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    fn full_pattern(&self, pattern: &str) -> String {
        match &self.inner.namespace {
            Some(ns) => format!("{}:{}", escape_glob(ns), pattern),
            None => pattern.to_string(),
        }
    }

    fn strip_namespace<'a>(&self, full: &'a str) -> &'a str {
        match &self.inner.namespace {
            Some(ns) => full
                .strip_prefix(ns.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(full),
            None => full,
        }
    }

    fn accept_key(&self, key: &str) -> bool {
        match validate_key_length(key, self.inner.max_key_length) {
            Ok(()) => true,
            Err(e) => {
                warn!("Rejecting cache key: {}", e);
                false
            }
        }
    }

    // ---- 基本操作 ----

    async fn read_bytes(&self, full: &str) -> Option<Vec<u8>> {
        if let Some(near) = &self.inner.near {
            if let Some(bytes) = near.get(full).await {
                return Some(bytes);
            }
        }
        let bytes = self.inner.store.get_bytes(full).await?;
        if let Some(near) = &self.inner.near {
            near.insert(full, bytes.clone()).await;
        }
        Some(bytes)
    }

    /// 读取缓存
    ///
    /// 未命中、存储故障、反序列化失败都返回 None。
    #[instrument(skip(self), level = "debug")]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.accept_key(key) {
            return None;
        }
        let full = self.full_key(key);
        let Some(bytes) = self.read_bytes(&full).await else {
            Metrics::incr(&self.inner.metrics.cache_misses);
            debug!("Cache miss: {}", key);
            return None;
        };
        match self.inner.store.serializer().deserialize(&bytes) {
            Ok(value) => {
                Metrics::incr(&self.inner.metrics.cache_hits);
                debug!("Cache hit: {}", key);
                Some(value)
            }
            Err(e) => {
                Metrics::incr(&self.inner.metrics.cache_misses);
                warn!("Undecodable cache entry '{}', treating as miss: {}", key, e);
                None
            }
        }
    }

    /// 写入缓存
    ///
    /// # 参数
    ///
    /// * `key` - 缓存键（不含命名空间）
    /// * `value` - 值
    /// * `ttl` - TTL档位、秒数或 `Duration`
    ///
    /// # 返回值
    ///
    /// 写入成功返回 true
    pub async fn set<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: impl Into<CacheTtl>,
    ) -> bool {
        self.write(key, value, ttl.into(), &[]).await
    }

    /// 写入缓存并建立标签索引 `tag:{tag}:{key}`
    pub async fn set_with_tags<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: impl Into<CacheTtl>,
        tags: &[String],
    ) -> bool {
        self.write(key, value, ttl.into(), tags).await
    }

    #[instrument(skip(self, value), level = "debug", fields(ttl = ttl.secs()))]
    async fn write<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: CacheTtl,
        tags: &[String],
    ) -> bool {
        if !self.accept_key(key) {
            return false;
        }
        let bytes = match self.inner.store.serializer().serialize(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode value for '{}': {}", key, e);
                return false;
            }
        };
        let full = self.full_key(key);
        if !self
            .inner
            .store
            .set_bytes(&full, bytes.clone(), ttl.secs())
            .await
        {
            return false;
        }
        Metrics::incr(&self.inner.metrics.cache_sets);
        if let Some(near) = &self.inner.near {
            near.insert(&full, bytes).await;
        }

        if !tags.is_empty() {
            let index: Vec<(String, String)> = tags
                .iter()
                .map(|tag| (self.full_key(&keys::tag_index(tag, key)), key.to_string()))
                .collect();
            if !self.inner.store.mset(&index, ttl.secs()).await {
                warn!("Tag index for '{}' was not written", key);
            }
        }
        true
    }

    /// 删除单个键
    #[instrument(skip(self), level = "debug")]
    pub async fn del(&self, key: &str) -> bool {
        let full = self.full_key(key);
        let removed = self.inner.store.del(&full).await;
        if let Some(near) = &self.inner.near {
            near.invalidate(&full).await;
        }
        if removed {
            Metrics::incr(&self.inner.metrics.cache_invalidations);
        }
        self.notify(InvalidationNotice::keys(vec![full])).await;
        removed
    }

    pub async fn exists(&self, key: &str) -> bool {
        if !self.accept_key(key) {
            return false;
        }
        self.inner.store.exists(&self.full_key(key)).await
    }

    /// 批量读取，结果顺序与 `keys` 一致
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let values: Vec<Option<T>> = self.inner.store.mget(&full).await;
        let hits = values.iter().filter(|v| v.is_some()).count() as u64;
        Metrics::add(&self.inner.metrics.cache_hits, hits);
        Metrics::add(&self.inner.metrics.cache_misses, values.len() as u64 - hits);
        values
    }

    /// 批量写入，所有条目使用同一个TTL
    pub async fn mset<T: Serialize + Sync>(
        &self,
        pairs: &[(String, T)],
        ttl: impl Into<CacheTtl>,
    ) -> bool {
        if pairs.iter().any(|(k, _)| !self.accept_key(k)) {
            return false;
        }
        let full: Vec<(String, &T)> = pairs
            .iter()
            .map(|(k, v)| (self.full_key(k), v))
            .collect();
        let ok = self.inner.store.mset(&full, ttl.into().secs()).await;
        if ok {
            Metrics::add(&self.inner.metrics.cache_sets, pairs.len() as u64);
        }
        if let Some(near) = &self.inner.near {
            for (key, _) in &full {
                near.invalidate(key).await;
            }
        }
        ok
    }

    /// 剩余存活时间
    pub async fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.inner
            .store
            .pttl(&self.full_key(key))
            .await
            .map(Duration::from_millis)
    }

    // ---- 读穿 ----

    /// 命中则返回缓存值，否则调用 `fetcher` 回源并写入缓存
    ///
    /// 同一进程内同一个键的并发未命中只会调用一次 `fetcher`，其余调用方等待
    /// 并读取回填的结果。`fetcher` 的错误原样返回，且不会被缓存。
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: impl Into<CacheTtl>,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.get_or_set_tagged(key, fetcher, ttl.into(), &[]).await
    }

    pub(crate) async fn get_or_set_tagged<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: CacheTtl,
        tags: &[String],
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(value);
        }
        let full = self.full_key(key);
        let gate = self.gate(&full);
        let permit = gate.lock().await;

        let result = match self.get::<T>(key).await {
            Some(value) => Ok(value),
            None => match fetcher().await {
                Ok(value) => {
                    self.write(key, &value, ttl, tags).await;
                    Ok(value)
                }
                Err(e) => Err(e),
            },
        };

        drop(permit);
        self.release_gate(&full, gate);
        result
    }

    /// 先失效再回源重建
    #[instrument(skip(self, fetcher, ttl), level = "debug")]
    pub async fn refresh_cache<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: impl Into<CacheTtl>,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let full = self.full_key(key);
        let gate = self.gate(&full);
        let permit = gate.lock().await;

        self.del(key).await;
        let result = match fetcher().await {
            Ok(value) => {
                self.write(key, &value, ttl.into(), &[]).await;
                Ok(value)
            }
            Err(e) => Err(e),
        };

        drop(permit);
        self.release_gate(&full, gate);
        result
    }

    fn gate(&self, full: &str) -> Arc<Mutex<()>> {
        self.inner
            .inflight
            .entry(full.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, full: &str, gate: Arc<Mutex<()>>) {
        // 表中一份加上本调用方一份，说明没有其他等待者
        self.inner
            .inflight
            .remove_if(full, |_, g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) <= 2);
    }

    // ---- 失效 ----

    /// 删除所有匹配模式的键，返回删除数量
    #[instrument(skip(self), level = "debug")]
    pub async fn del_pattern(&self, pattern: &str) -> u64 {
        self.invalidate_targets(&[], &[pattern.to_string()], &[]).await
    }

    /// 删除带有某个标签的全部条目
    pub async fn invalidate_tag(&self, tag: &str) -> u64 {
        self.invalidate_targets(&[], &[], &[tag.to_string()]).await
    }

    /// 同时失效若干键、模式与标签，只广播一条通知
    ///
    /// # 返回值
    ///
    /// 删除的缓存条目数（不含标签索引项）
    #[instrument(skip(self), level = "debug")]
    pub async fn invalidate_targets(
        &self,
        keys: &[String],
        patterns: &[String],
        tags: &[String],
    ) -> u64 {
        let mut notice = InvalidationNotice {
            keys: keys.iter().map(|k| self.full_key(k)).collect(),
            patterns: patterns.iter().map(|p| self.full_pattern(p)).collect(),
            tags: tags.to_vec(),
        };

        let mut doomed = notice.keys.clone();
        for pattern in &notice.patterns {
            doomed.extend(self.inner.store.scan(pattern).await);
        }
        let mut index_keys = Vec::new();
        for tag in tags {
            let (entries, index) = self.resolve_tag(tag).await;
            notice.keys.extend(entries.iter().cloned());
            doomed.extend(entries);
            index_keys.extend(index);
        }
        doomed.sort_unstable();
        doomed.dedup();

        let deleted = self.delete_full_keys(&doomed).await;
        self.delete_full_keys(&index_keys).await;

        if let Some(near) = &self.inner.near {
            for key in &notice.keys {
                near.invalidate(key).await;
            }
            for pattern in &notice.patterns {
                if let Ok(matcher) = GlobMatcher::new(pattern) {
                    near.invalidate_matching(&matcher).await;
                }
            }
        }

        Metrics::add(&self.inner.metrics.cache_invalidations, deleted);
        info!(
            "Invalidated {} entries ({} keys, {} patterns, {} tags)",
            deleted,
            keys.len(),
            patterns.len(),
            tags.len()
        );
        self.notify(notice).await;
        deleted
    }

    /// 返回 (条目完整键, 索引完整键)
    async fn resolve_tag(&self, tag: &str) -> (Vec<String>, Vec<String>) {
        let index = self
            .inner
            .store
            .scan(&self.full_pattern(&keys::tag_pattern(tag)))
            .await;
        let entries = index
            .iter()
            .filter_map(|full| keys::key_from_tag_index(tag, self.strip_namespace(full)))
            .map(|key| self.full_key(key))
            .collect();
        (entries, index)
    }

    async fn delete_full_keys(&self, keys: &[String]) -> u64 {
        let mut deleted = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            deleted += self.inner.store.del_many(chunk).await;
        }
        deleted
    }

    async fn notify(&self, notice: InvalidationNotice) {
        if notice.is_empty() {
            return;
        }
        if let Some(bus) = self.inner.bus.get() {
            bus.publish(EventChannel::CacheInvalidate, "invalidate", &notice)
                .await;
        }
    }

    /// 商品变更：商品本身、商品列表、搜索结果与推荐
    pub async fn invalidate_product(&self, product_id: &str) -> u64 {
        let id = escape_glob(product_id);
        self.invalidate_targets(
            &[keys::product(product_id)],
            &[
                format!("product:{}:*", id),
                "products:*".to_string(),
                "search:*".to_string(),
                "recommendations:*".to_string(),
            ],
            &[],
        )
        .await
    }

    /// 用户变更：用户资料、购买记录与该用户的推荐
    pub async fn invalidate_user(&self, user_id: &str) -> u64 {
        let id = escape_glob(user_id);
        self.invalidate_targets(
            &[keys::user(user_id), keys::recommendations(user_id)],
            &[
                format!("user:{}:*", id),
                format!("user:purchases:{}:*", id),
                format!("recommendations:{}:*", id),
            ],
            &[],
        )
        .await
    }

    /// 店铺变更：店铺本身、店铺商品分页与商品列表
    pub async fn invalidate_shop(&self, shop_id: &str) -> u64 {
        let id = escape_glob(shop_id);
        self.invalidate_targets(
            &[keys::shop(shop_id)],
            &[
                format!("shop:{}:*", id),
                format!("shop:products:{}:*", id),
                "products:*".to_string(),
            ],
            &[],
        )
        .await
    }

    pub async fn invalidate_search(&self) -> u64 {
        self.invalidate_targets(&[], &["search:*".to_string()], &[])
            .await
    }

    /// 失效推荐结果，`user_id` 为 None 时失效全部用户的推荐
    pub async fn invalidate_recommendations(&self, user_id: Option<&str>) -> u64 {
        match user_id {
            Some(id) => {
                self.invalidate_targets(
                    &[keys::recommendations(id)],
                    &[format!("recommendations:{}:*", escape_glob(id))],
                    &[],
                )
                .await
            }
            None => {
                self.invalidate_targets(&[], &["recommendations:*".to_string()], &[])
                    .await
            }
        }
    }

    /// 清空近端缓存（不影响远端存储）
    pub fn clear_local(&self) {
        if let Some(near) = &self.inner.near {
            near.clear();
        }
    }

    // ---- 预热 ----

    /// 用已有数据预热，只写入当前不存在的键
    #[instrument(skip(self, entries, ttl), level = "debug", fields(count = entries.len()))]
    pub async fn warm<T: Serialize + Sync>(
        &self,
        entries: Vec<(String, T)>,
        ttl: impl Into<CacheTtl>,
    ) -> WarmupReport {
        let ttl = ttl.into();
        let requested = entries.len();
        let full: Vec<String> = entries.iter().map(|(k, _)| self.full_key(k)).collect();
        let present = self.inner.store.mget_bytes(&full).await;

        let cold: Vec<(String, T)> = entries
            .into_iter()
            .zip(present)
            .filter(|(_, existing)| existing.is_none())
            .map(|(entry, _)| entry)
            .collect();
        let skipped = requested - cold.len();

        let mut loaded = 0;
        let mut warmed_keys = Vec::new();
        for chunk in cold.chunks(WARM_CHUNK) {
            if self.mset(chunk, ttl).await {
                loaded += chunk.len();
                warmed_keys.extend(chunk.iter().map(|(k, _)| k.clone()));
            }
        }

        let report = WarmupReport {
            requested,
            loaded,
            skipped,
        };
        self.announce_warm(&warmed_keys, &report).await;
        report
    }

    /// 对不存在的键调用 `loader` 批量回源后写入
    ///
    /// `loader` 每次最多收到一批冷键，返回的条目全部写入缓存。
    pub async fn warm_with<T, F, Fut, E>(
        &self,
        keys: &[String],
        loader: F,
        ttl: impl Into<CacheTtl>,
    ) -> std::result::Result<WarmupReport, E>
    where
        T: Serialize + Sync,
        F: Fn(Vec<String>) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<(String, T)>, E>>,
    {
        let ttl = ttl.into();
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let present = self.inner.store.mget_bytes(&full).await;
        let cold: Vec<String> = keys
            .iter()
            .zip(present)
            .filter(|(_, existing)| existing.is_none())
            .map(|(k, _)| k.clone())
            .collect();

        let mut report = WarmupReport {
            requested: keys.len(),
            loaded: 0,
            skipped: keys.len() - cold.len(),
        };
        let mut warmed_keys = Vec::new();
        for chunk in cold.chunks(WARM_CHUNK) {
            let entries = loader(chunk.to_vec()).await?;
            if entries.is_empty() {
                continue;
            }
            if self.mset(&entries, ttl).await {
                report.loaded += entries.len();
                warmed_keys.extend(entries.into_iter().map(|(k, _)| k));
            }
        }
        self.announce_warm(&warmed_keys, &report).await;
        Ok(report)
    }

    async fn announce_warm(&self, keys: &[String], report: &WarmupReport) {
        info!(
            "Warmed cache: {} loaded, {} already present",
            report.loaded, report.skipped
        );
        if keys.is_empty() {
            return;
        }
        if let Some(bus) = self.inner.bus.get() {
            bus.publish(
                EventChannel::CacheWarm,
                "warm",
                serde_json::json!({ "keys": keys, "loaded": report.loaded }),
            )
            .await;
        }
    }
}
