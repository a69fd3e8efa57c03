//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块实现了基于存储计数器的分布式限流（固定窗口）。
//!
//! 计数器位于 `rate_limit:{identifier}`，窗口内第一次请求时设置过期时间，
//! 所有实例共享同一个计数。存储不可用时放行请求。

use crate::cache::keys;
use crate::store::StoreAdapter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// 限流配置
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 窗口长度（秒）
    pub window_secs: u64,
    /// 每个窗口允许的最大请求数
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 100,
        }
    }
}

/// 单次检查的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// 当前窗口内的请求数（存储不可用时为 0）
    pub count: u64,
    pub remaining: u64,
    /// 被拒绝时距离窗口结束的时间
    pub retry_after: Option<Duration>,
}

/// 分布式限流器
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: StoreAdapter,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: StoreAdapter, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// 记录一次请求并判断是否放行
    ///
    /// # 参数
    ///
    /// * `identifier` - 限流对象，例如客户端IP或用户ID
    ///
    /// # 返回值
    ///
    /// 返回本次请求的判定结果
    #[instrument(skip(self), level = "debug")]
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let key = keys::rate_limit(identifier);
        let count = self
            .store
            .incr(&key, Some(self.config.window_secs))
            .await
            .max(0) as u64;

        // incr 失败返回 0：放行
        if count == 0 || count <= self.config.max_requests {
            return RateLimitDecision {
                allowed: true,
                count,
                remaining: self.config.max_requests.saturating_sub(count),
                retry_after: None,
            };
        }

        let retry_after = self.store.pttl(&key).await.map(Duration::from_millis);
        debug!(
            "Rate limit exceeded for '{}': {} > {}",
            identifier, count, self.config.max_requests
        );
        RateLimitDecision {
            allowed: false,
            count,
            remaining: 0,
            retry_after,
        }
    }

    /// 清除某个对象的计数
    pub async fn reset(&self, identifier: &str) -> bool {
        self.store.del(&keys::rate_limit(identifier)).await
    }
}
