//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了进程内近端缓存，位于远端存储之前。

use crate::config::LocalTierConfig;
use crate::utils::GlobMatcher;
use moka::future::Cache;
use std::time::Duration;
use tracing::{debug, instrument};

/// 近端缓存
///
/// 条目只保留很短的时间，跨实例一致性依赖失效事件和这个短TTL。
#[derive(Clone)]
pub struct NearCache {
    cache: Cache<String, Vec<u8>>,
}

impl NearCache {
    pub fn new(config: &LocalTierConfig) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(config.max_capacity)
                .time_to_live(Duration::from_secs(config.ttl_secs))
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: &str, value: Vec<u8>) {
        self.cache.insert(key.to_string(), value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// 删除所有匹配 glob 模式的条目，返回删除数量
    #[instrument(skip(self, matcher), level = "debug", fields(pattern = matcher.pattern()))]
    pub async fn invalidate_matching(&self, matcher: &GlobMatcher) -> usize {
        let victims: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| matcher.is_match(key))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in &victims {
            self.cache.invalidate(key).await;
        }
        debug!("Near cache dropped {} entries", victims.len());
        victims.len()
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl std::fmt::Debug for NearCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
