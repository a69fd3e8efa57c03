//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! oxcoord - 基于 Redis 的分布式协调库
//!
//! 提供缓存旁路读写与失效、分布式锁（互斥锁/信号量）、
//! 发布/订阅事件总线以及请求级批量加载器。存储不可用时所有缓存操作
//! 降级为默认值，调用方只会变慢而不会出错。

#![doc(html_root_url = "https://docs.rs/oxcoord/0.1.0")]

pub use serde;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use tokio;

pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod loader;
pub mod lock;
pub mod metrics;
pub mod rate_limiting;
pub mod serialization;
pub mod store;
pub mod telemetry;
pub mod utils;

// Re-export commonly used items
pub use cache::{CacheCoordinator, CachePolicy, CacheTtl, InvalidationTargets, TtlTier};
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{CoordError, Result};
pub use events::{handler_fn, Event, EventBus, EventChannel, EventHandler, HandlerId};
pub use loader::{batch_fn, BatchFn, BatchLoader, CachedBatchFn, LoaderRegistry};
pub use lock::{
    AcquireOptions, DistributedMutex, Lock, LockGuard, LockManager, Semaphore, SemaphorePermit,
};
pub use rate_limiting::{RateLimitConfig, RateLimiter};
pub use store::StoreAdapter;

/// oxcoord 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
