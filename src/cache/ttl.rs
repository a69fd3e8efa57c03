//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 缓存TTL档位。调用方选择档位而不是自己拼秒数，以此限定全局条目寿命。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TTL档位
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    /// 5 分钟
    Short,
    /// 1 小时
    #[default]
    Medium,
    /// 24 小时
    Long,
    /// 7 天
    VeryLong,
    /// 30 天，唯一允许的"静态"档位
    Static,
}

impl TtlTier {
    pub const fn seconds(self) -> u64 {
        match self {
            TtlTier::Short => 300,
            TtlTier::Medium => 3_600,
            TtlTier::Long => 86_400,
            TtlTier::VeryLong => 604_800,
            TtlTier::Static => 2_592_000,
        }
    }

    pub const fn duration(self) -> Duration {
        Duration::from_secs(self.seconds())
    }
}

/// 实际写入存储的TTL（秒），限定在 [1, Static] 之间
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheTtl(u64);

impl CacheTtl {
    pub const MAX_SECS: u64 = TtlTier::Static.seconds();

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.clamp(1, Self::MAX_SECS))
    }

    pub fn secs(self) -> u64 {
        self.0
    }
}

impl From<TtlTier> for CacheTtl {
    fn from(tier: TtlTier) -> Self {
        Self(tier.seconds())
    }
}

impl From<Duration> for CacheTtl {
    fn from(d: Duration) -> Self {
        // 不足一秒向上取整
        let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
        Self::from_secs(secs)
    }
}

impl From<u64> for CacheTtl {
    fn from(secs: u64) -> Self {
        Self::from_secs(secs)
    }
}
