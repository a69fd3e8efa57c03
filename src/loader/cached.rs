//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 在批量回源前加一层缓存：先批量读缓存，只对未命中的键回源，再批量回填。

use super::BatchFn;
use crate::cache::{CacheCoordinator, CacheTtl};
use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

type CacheKeyFn<K> = Arc<dyn Fn(&K) -> String + Send + Sync>;

/// 带缓存的批量回源
pub struct CachedBatchFn<K, V, B> {
    inner: B,
    cache: CacheCoordinator,
    cache_key: CacheKeyFn<K>,
    ttl: CacheTtl,
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<K, V, B> CachedBatchFn<K, V, B> {
    /// # 参数
    ///
    /// * `inner` - 真正的回源实现
    /// * `cache` - 缓存协调器
    /// * `cache_key` - 实体键到缓存键的映射，例如 `|id| keys::product(id)`
    /// * `ttl` - 回填使用的TTL
    pub fn new(
        inner: B,
        cache: CacheCoordinator,
        cache_key: impl Fn(&K) -> String + Send + Sync + 'static,
        ttl: impl Into<CacheTtl>,
    ) -> Self {
        Self {
            inner,
            cache,
            cache_key: Arc::new(cache_key),
            ttl: ttl.into(),
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<K, V, B> BatchFn<K, V> for CachedBatchFn<K, V, B>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    B: BatchFn<K, V>,
{
    async fn load_batch(&self, keys: Vec<K>) -> Result<HashMap<K, V>> {
        let cache_keys: Vec<String> = keys.iter().map(|k| (self.cache_key)(k)).collect();
        let cached: Vec<Option<V>> = self.cache.mget(&cache_keys).await;

        let mut found = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();
        for (key, hit) in keys.into_iter().zip(cached) {
            match hit {
                Some(value) => {
                    found.insert(key, value);
                }
                None => misses.push(key),
            }
        }
        debug!("Cached batch: {} hits, {} misses", found.len(), misses.len());
        if misses.is_empty() {
            return Ok(found);
        }

        let loaded = self.inner.load_batch(misses).await?;
        if !loaded.is_empty() {
            let fill: Vec<(String, &V)> = loaded
                .iter()
                .map(|(k, v)| ((self.cache_key)(k), v))
                .collect();
            self.cache.mset(&fill, self.ttl).await;
        }
        found.extend(loaded);
        Ok(found)
    }
}
