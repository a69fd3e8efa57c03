//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 存储适配层：在 [`KvStore`] 之上提供类型化读写，并把所有传输/后端错误
//! 记录日志后降级为安全默认值（None / false / 0 / 空集合）。

use crate::backend::{
    AtomicScript, KvStore, MemoryStore, MessageStream, RedisStore, ScriptReply, Subscription,
};
use crate::config::{StoreConfig, StoreMode};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::serialization::{Serializer, SerializerEnum};
use crate::utils::validate_value_size;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// 存储适配器
///
/// 缓存不可用只能让调用方变慢，不能让调用方出错。这里的每个方法都不返回错误。
#[derive(Clone)]
pub struct StoreAdapter {
    store: Arc<dyn KvStore>,
    serializer: SerializerEnum,
    metrics: Arc<Metrics>,
    scan_count: usize,
    max_value_size: usize,
}

impl std::fmt::Debug for StoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAdapter")
            .field("store", &self.store)
            .field("scan_count", &self.scan_count)
            .finish()
    }
}

impl StoreAdapter {
    /// 包装一个已建立的存储
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            serializer: SerializerEnum::default(),
            metrics: Arc::new(Metrics::default()),
            scan_count: 500,
            max_value_size: 1024 * 1024 * 10,
        }
    }

    /// 进程内存储，主要用于测试
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    /// 按配置连接存储
    ///
    /// 初始化阶段的连接失败会返回错误，之后的调用才会降级。
    #[instrument(skip(config), level = "info", fields(mode = ?config.mode))]
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let store: Arc<dyn KvStore> = match config.mode {
            StoreMode::Memory => Arc::new(MemoryStore::new(config.memory_capacity)),
            StoreMode::Standalone | StoreMode::Sentinel => {
                Arc::new(RedisStore::connect(config).await?)
            }
        };
        Ok(Self::new(store).with_scan_count(config.scan_count))
    }

    pub fn with_serializer(mut self, serializer: SerializerEnum) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count.max(1);
        self
    }

    pub fn with_max_value_size(mut self, max_value_size: usize) -> Self {
        self.max_value_size = max_value_size;
        self
    }

    /// 底层存储
    pub fn raw(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn serializer(&self) -> &SerializerEnum {
        &self.serializer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn degrade<T>(&self, op: &str, target: &str, result: Result<T>, fallback: T) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                Metrics::incr(&self.metrics.store_errors);
                warn!("Store {} failed for '{}', degrading: {}", op, target, e);
                fallback
            }
        }
    }

    /// 存储是否可达
    pub async fn is_healthy(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Store ping failed: {}", e);
                false
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let result = self.store.get_bytes(key).await;
        self.degrade("get", key, result, None)
    }

    /// 读取并反序列化；反序列化失败也按未命中处理
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key).await?;
        let decoded = self.serializer.deserialize(&bytes);
        self.degrade("decode", key, decoded.map(Some), None)
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    pub async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> bool {
        if ttl_secs == 0 {
            warn!("Refusing to write '{}' without a TTL", key);
            return false;
        }
        if let Err(e) = validate_value_size(&value, self.max_value_size) {
            warn!("Refusing to write '{}': {}", key, e);
            return false;
        }
        let result = self.store.set_bytes(key, value, ttl_secs).await;
        self.degrade("set", key, result.map(|_| true), false)
    }

    pub async fn set<T: Serialize + Sync + ?Sized>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        let encoded = self.serializer.serialize(value);
        match self.degrade("encode", key, encoded.map(Some), None) {
            Some(bytes) => self.set_bytes(key, bytes, ttl_secs).await,
            None => false,
        }
    }

    pub async fn del(&self, key: &str) -> bool {
        self.del_many(&[key.to_string()]).await > 0
    }

    /// 删除多个键，返回删除的数量
    #[instrument(skip(self, keys), level = "debug", fields(key_count = keys.len()))]
    pub async fn del_many(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let result = self.store.del(keys).await;
        self.degrade("del", &format!("{} keys", keys.len()), result, 0)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let result = self.store.exists(key).await;
        self.degrade("exists", key, result, false)
    }

    /// 批量读取原始字节，不反序列化
    pub async fn mget_bytes(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let result = self.store.mget_bytes(keys).await;
        self.degrade(
            "mget",
            &format!("{} keys", keys.len()),
            result,
            vec![None; keys.len()],
        )
    }

    /// 批量读取，结果与 `keys` 一一对应
    #[instrument(skip(self, keys), level = "debug", fields(key_count = keys.len()))]
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let result = self.store.mget_bytes(keys).await;
        let raw = self.degrade(
            "mget",
            &format!("{} keys", keys.len()),
            result,
            vec![None; keys.len()],
        );
        raw.into_iter()
            .zip(keys)
            .map(|(bytes, key)| {
                let bytes = bytes?;
                let decoded = self.serializer.deserialize(&bytes);
                self.degrade("decode", key, decoded.map(Some), None)
            })
            .collect()
    }

    #[instrument(skip(self, pairs), level = "debug", fields(item_count = pairs.len()))]
    pub async fn mset<T: Serialize + Sync>(&self, pairs: &[(String, T)], ttl_secs: u64) -> bool {
        if pairs.is_empty() {
            return true;
        }
        if ttl_secs == 0 {
            warn!("Refusing to write {} keys without a TTL", pairs.len());
            return false;
        }
        let mut items = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let encoded = self.serializer.serialize(value);
            match self.degrade("encode", key, encoded.map(Some), None) {
                Some(bytes) if validate_value_size(&bytes, self.max_value_size).is_ok() => {
                    items.push((key.clone(), bytes))
                }
                _ => return false,
            }
        }
        let result = self.store.mset_bytes(items, ttl_secs).await;
        self.degrade("mset", &format!("{} keys", pairs.len()), result.map(|_| true), false)
    }

    /// 计数器加一。失败返回 0
    ///
    /// 给出 `ttl_secs_if_first` 时，递增与补设过期时间在存储端一步完成：
    /// 计数器只要没有过期时间就会被设置，不会因为某次补设失败而永久存在。
    #[instrument(skip(self), level = "debug")]
    pub async fn incr(&self, key: &str, ttl_secs_if_first: Option<u64>) -> i64 {
        match ttl_secs_if_first {
            Some(ttl_secs) => self
                .execute_atomic_script(
                    &AtomicScript::IncrWithTtl,
                    &[key.to_string()],
                    &["1".to_string(), ttl_secs.saturating_mul(1000).max(1).to_string()],
                )
                .await
                .and_then(|reply| reply.as_int())
                .unwrap_or(0),
            None => {
                let result = self.store.incr(key, 1).await;
                self.degrade("incr", key, result, 0)
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        let result = self.store.expire(key, ttl_secs).await;
        self.degrade("expire", key, result, false)
    }

    /// 剩余存活时间（毫秒）
    pub async fn pttl(&self, key: &str) -> Option<u64> {
        let result = self.store.pttl(key).await;
        self.degrade("pttl", key, result, None)
    }

    /// 返回所有匹配 glob 模式的键（内部按游标分页）
    #[instrument(skip(self), level = "debug")]
    pub async fn scan(&self, pattern: &str) -> Vec<String> {
        let result = self.store.scan_match(pattern, self.scan_count).await;
        self.degrade("scan", pattern, result, Vec::new())
    }

    /// SET NX PX，失败视为未设置
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> bool {
        let result = self.store.set_nx_px(key, value, ttl_ms).await;
        self.degrade("set_nx", key, result, false)
    }

    /// 在存储端原子执行脚本，失败返回 None
    #[instrument(skip(self, script, args), level = "debug", fields(script = script.name()))]
    pub async fn execute_atomic_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Option<ScriptReply> {
        let target = keys.first().map(String::as_str).unwrap_or("<no key>");
        let result = self.store.eval(script, keys, args).await;
        self.degrade("eval", target, result.map(Some), None)
    }

    /// 发布消息，失败按无人接收处理
    pub async fn publish(&self, channel: &str, payload: &str) -> u64 {
        let result = self.store.publish(channel, payload).await;
        self.degrade("publish", channel, result, 0)
    }

    /// 打开订阅，失败返回 None
    pub async fn listen(&self, subscription: &Subscription) -> Option<MessageStream> {
        let result = self.store.listen(subscription).await;
        self.degrade("listen", subscription.name(), result.map(Some), None)
    }

    /// 关闭底层连接
    pub async fn graceful_shutdown(&self) {
        if let Err(e) = self.store.shutdown().await {
            warn!("Store shutdown reported an error: {}", e);
        }
    }
}
