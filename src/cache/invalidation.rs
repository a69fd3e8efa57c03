//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了跨实例的缓存失效通知，通过 `cache.invalidate` 频道传播。

use super::near::NearCache;
use crate::error::Result;
use crate::events::{Event, EventHandler};
use crate::utils::GlobMatcher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// 失效通知内容
///
/// `keys` 与 `patterns` 均为带命名空间的完整键。标签失效时，发布方会把
/// 已解析出的键一并放入 `keys`，接收方无需再查询标签索引。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvalidationNotice {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl InvalidationNotice {
    pub fn keys(keys: Vec<String>) -> Self {
        Self {
            keys,
            ..Default::default()
        }
    }

    pub fn patterns(patterns: Vec<String>) -> Self {
        Self {
            patterns,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty() && self.tags.is_empty()
    }
}

/// 收到其他实例的失效通知后清理本地近端缓存
pub struct NearInvalidationHandler {
    near: Option<NearCache>,
    own_source: String,
}

impl NearInvalidationHandler {
    pub fn new(near: Option<NearCache>, own_source: String) -> Self {
        Self { near, own_source }
    }

    /// 按通知内容清理近端缓存，返回清理的条目数
    pub async fn apply(&self, notice: &InvalidationNotice) -> usize {
        let Some(near) = &self.near else {
            return 0;
        };
        let mut dropped = 0;
        for key in &notice.keys {
            near.invalidate(key).await;
            dropped += 1;
        }
        for pattern in &notice.patterns {
            match GlobMatcher::new(pattern) {
                Ok(matcher) => dropped += near.invalidate_matching(&matcher).await,
                Err(e) => warn!("Ignoring invalid pattern '{}' in notice: {}", pattern, e),
            }
        }
        dropped
    }
}

#[async_trait]
impl EventHandler for NearInvalidationHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        if event.source == self.own_source {
            return Ok(());
        }
        let notice: InvalidationNotice = event.data_as()?;
        let dropped = self.apply(&notice).await;
        debug!(
            "Applied invalidation from {}: {} near entries dropped",
            event.source, dropped
        );
        Ok(())
    }
}
