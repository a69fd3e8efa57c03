//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的配置结构和解析逻辑。

use crate::cache::ttl::TtlTier;
use crate::error::{CoordError, Result};
use crate::rate_limiting::RateLimitConfig;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_VERSION: u32 = 1;

/// 协调层总配置
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub config_version: Option<u32>,
    /// 远端存储配置
    pub store: StoreConfig,
    /// 缓存协调器配置
    pub cache: CacheConfig,
    /// 分布式锁配置
    pub lock: LockConfig,
    /// 事件总线配置
    pub events: EventsConfig,
    /// 批量加载器配置
    pub loader: LoaderConfig,
    /// 限流配置
    pub rate_limit: RateLimitConfig,
}

/// 存储模式
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// 进程内存储，用于单节点部署和测试
    Memory,
    /// Redis单机模式
    #[default]
    Standalone,
    /// Redis哨兵模式
    Sentinel,
}

/// 远端存储配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StoreConfig {
    /// 存储模式
    pub mode: StoreMode,
    /// 连接字符串
    pub connection_string: SecretString,
    /// Redis 密码（可选）
    pub password: Option<SecretString>,
    /// 是否启用 TLS
    pub enable_tls: bool,
    /// 哨兵配置
    pub sentinel: Option<SentinelConfig>,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 命令执行超时时间（毫秒）
    pub command_timeout_ms: u64,
    /// SCAN 每次迭代的 COUNT 提示
    pub scan_count: usize,
    /// 内存模式下的最大条目数
    pub memory_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::Standalone,
            connection_string: SecretString::new("redis://localhost:6379".to_string().into()),
            password: None,
            enable_tls: false,
            sentinel: None,
            connection_timeout_ms: 5000,
            command_timeout_ms: 3000,
            scan_count: 500,
            memory_capacity: 100_000,
        }
    }
}

impl StoreConfig {
    /// 进程内存储配置
    pub fn memory() -> Self {
        Self {
            mode: StoreMode::Memory,
            ..Default::default()
        }
    }
}

/// 哨兵配置
#[derive(Deserialize, Clone, Debug)]
pub struct SentinelConfig {
    /// 主节点名称
    pub master_name: String,
    /// 哨兵节点列表
    pub nodes: Vec<String>,
}

/// 缓存协调器配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    /// 键前缀，用于多个应用共享同一个存储
    pub namespace: Option<String>,
    /// 调用方未指定时使用的TTL档位
    pub default_tier: TtlTier,
    /// 进程内近端缓存（可选）
    pub local_tier: Option<LocalTierConfig>,
    /// 键的最大长度
    pub max_key_length: usize,
    /// 值的最大大小（字节）
    pub max_value_size: usize,
    /// 超过该字节数的值写入前压缩，0 表示不压缩
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            default_tier: TtlTier::Medium,
            local_tier: None,
            max_key_length: 512,
            max_value_size: 1024 * 1024 * 10, // 10MB
            compression_threshold: 0,
        }
    }
}

/// 近端缓存配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LocalTierConfig {
    /// 最大条目数
    pub max_capacity: u64,
    /// 近端条目的存活时间（秒），应远小于远端TTL
    pub ttl_secs: u64,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl_secs: 30,
        }
    }
}

/// 分布式锁配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LockConfig {
    /// 默认锁TTL（毫秒）
    pub default_ttl_ms: u64,
    /// 重试间隔（毫秒）
    pub retry_delay_ms: u64,
    /// 默认最大重试次数
    pub max_retries: u32,
    /// 阻塞模式默认超时（毫秒）
    pub blocking_timeout_ms: u64,
    /// 本地持有表清理间隔（毫秒）
    pub sweep_interval_ms: u64,
    /// 锁键前缀
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            retry_delay_ms: 100,
            max_retries: 3,
            blocking_timeout_ms: 10_000,
            sweep_interval_ms: 60_000,
            key_prefix: "lock".to_string(),
        }
    }
}

/// 事件总线配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EventsConfig {
    /// 是否启用事件总线
    pub enabled: bool,
    /// 本实例标识，写入每个事件的 source 字段
    pub source: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: None,
        }
    }
}

/// 批量加载器配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LoaderConfig {
    /// 单次回源的最大键数
    pub max_batch_size: usize,
    /// 收集窗口（毫秒）
    ///
    /// 0 表示让出调度直到队列不再增长后立即派发，只保证同一工作线程上的调用被合并。
    /// 多线程运行时上并发任务分布在不同工作线程，建议设为几毫秒。
    pub batch_delay_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_delay_ms: 0,
        }
    }
}

impl Config {
    /// 从 TOML 字符串解析配置
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| CoordError::Configuration(e.to_string()))?;
        config.validate().map_err(CoordError::Configuration)?;
        Ok(config)
    }

    /// 从 TOML 文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// 仅使用进程内存储的配置，主要用于测试
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig::memory(),
            ..Default::default()
        }
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保所有值在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(version) = self.config_version {
            if version > CONFIG_VERSION {
                return Err(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                ));
            }
        }

        let store = &self.store;
        if store.mode != StoreMode::Memory {
            if !(100..=30000).contains(&store.connection_timeout_ms) {
                return Err("store.connection_timeout_ms must be between 100 and 30000 ms".into());
            }
            if !(100..=60000).contains(&store.command_timeout_ms) {
                return Err("store.command_timeout_ms must be between 100 and 60000 ms".into());
            }
        }
        if store.mode == StoreMode::Sentinel && store.sentinel.is_none() {
            return Err("store.sentinel must be set when mode = \"sentinel\"".into());
        }
        if store.scan_count == 0 {
            return Err("store.scan_count cannot be zero".into());
        }
        if store.mode == StoreMode::Memory && store.memory_capacity == 0 {
            return Err("store.memory_capacity cannot be zero".into());
        }

        let cache = &self.cache;
        if cache.max_key_length == 0 || cache.max_key_length > 4096 {
            return Err("cache.max_key_length must be between 1 and 4096".into());
        }
        if cache.max_value_size == 0 || cache.max_value_size > 512 * 1024 * 1024 {
            return Err("cache.max_value_size must be between 1 byte and 512MB".into());
        }
        if let Some(local) = &cache.local_tier {
            if local.max_capacity == 0 {
                return Err("cache.local_tier.max_capacity cannot be zero".into());
            }
            if local.ttl_secs == 0 || local.ttl_secs > TtlTier::Short.seconds() {
                return Err(format!(
                    "cache.local_tier.ttl_secs must be between 1 and {}",
                    TtlTier::Short.seconds()
                ));
            }
        }

        let lock = &self.lock;
        if lock.default_ttl_ms == 0 {
            return Err("lock.default_ttl_ms cannot be zero".into());
        }
        if lock.retry_delay_ms == 0 {
            return Err("lock.retry_delay_ms cannot be zero".into());
        }
        if lock.blocking_timeout_ms == 0 {
            return Err("lock.blocking_timeout_ms cannot be zero".into());
        }
        if lock.sweep_interval_ms < 100 {
            return Err("lock.sweep_interval_ms must be at least 100 ms".into());
        }
        if lock.key_prefix.is_empty() {
            return Err("lock.key_prefix cannot be empty".into());
        }

        if self.loader.max_batch_size == 0 || self.loader.max_batch_size > 10_000 {
            return Err("loader.max_batch_size must be between 1 and 10000".into());
        }
        if self.loader.batch_delay_ms > 1000 {
            return Err("loader.batch_delay_ms cannot exceed 1000 ms".into());
        }

        if self.rate_limit.window_secs == 0 {
            return Err("rate_limit.window_secs cannot be zero".into());
        }
        if self.rate_limit.max_requests == 0 {
            return Err("rate_limit.max_requests cannot be zero".into());
        }

        Ok(())
    }
}
