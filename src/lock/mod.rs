//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于存储原子操作的分布式锁。
//!
//! 每个资源的状态迁移：
//!
//! ```text
//! UNLOCKED --SET NX PX--> LOCKED --比较后删除 / TTL到期--> UNLOCKED
//!                           |
//!                           +--比较后续期--> LOCKED
//! ```

pub mod primitives;

pub use primitives::{DistributedMutex, Semaphore, SemaphorePermit};

use crate::backend::AtomicScript;
use crate::config::LockConfig;
use crate::error::{CoordError, Result};
use crate::metrics::Metrics;
use crate::store::StoreAdapter;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 一次成功的加锁
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub resource: String,
    /// 持有者标识，释放与续期必须提供
    pub lock_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    fn new(resource: &str, lock_id: String, ttl: Duration) -> Self {
        let acquired_at = Utc::now();
        Self {
            resource: resource.to_string(),
            lock_id,
            acquired_at,
            ttl,
            expires_at: acquired_at + chrono_duration(ttl),
        }
    }

    /// 按本地时钟判断是否已过期
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// 加锁选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOptions {
    pub ttl: Duration,
    pub retry_delay: Duration,
    /// 非阻塞模式下首次尝试之后的重试次数
    pub max_retries: u32,
    /// 阻塞模式：一直轮询直到 `blocking_timeout`
    pub blocking: bool,
    pub blocking_timeout: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

impl AcquireOptions {
    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.default_ttl_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retries: config.max_retries,
            blocking: false,
            blocking_timeout: Duration::from_millis(config.blocking_timeout_ms),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// 只尝试一次
    pub fn once(mut self) -> Self {
        self.blocking = false;
        self.max_retries = 0;
        self
    }

    /// 阻塞等待，最多 `timeout`
    pub fn blocking(mut self, timeout: Duration) -> Self {
        self.blocking = true;
        self.blocking_timeout = timeout;
        self
    }
}

struct LockInner {
    store: StoreAdapter,
    key_prefix: String,
    defaults: AcquireOptions,
    sweep_interval: Duration,
    held: DashMap<String, Lock>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// 分布式锁管理器
///
/// 本地持有表只是辅助信息，存储中的锁记录才是唯一的事实来源。
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockInner>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("key_prefix", &self.inner.key_prefix)
            .field("held", &self.inner.held.len())
            .finish()
    }
}

impl LockManager {
    /// 创建锁管理器，不会启动后台清理任务
    pub fn new(store: StoreAdapter, config: &LockConfig) -> Self {
        let metrics = store.metrics().clone();
        Self {
            inner: Arc::new(LockInner {
                store,
                key_prefix: config.key_prefix.clone(),
                defaults: AcquireOptions::from_config(config),
                sweep_interval: Duration::from_millis(config.sweep_interval_ms),
                held: DashMap::new(),
                metrics,
                cancel: CancellationToken::new(),
                sweeper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// 配置给出的默认选项
    pub fn options(&self) -> AcquireOptions {
        self.inner.defaults.clone()
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.inner.store
    }

    fn key(&self, resource: &str) -> String {
        format!("{}:{}", self.inner.key_prefix, resource)
    }

    /// 启动本地持有表的定期清理
    ///
    /// 清理只删除本地已过期的记录，不会访问存储。重复调用无效果。
    pub fn start_sweeper(&self) -> bool {
        let Ok(mut slot) = self.inner.sweeper.lock() else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        let weak: Weak<LockInner> = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let pruned = sweep(&inner.held);
                        if pruned > 0 {
                            debug!("Lock sweep pruned {} expired entries", pruned);
                        }
                    }
                }
            }
            debug!("Lock sweeper stopped");
        }));
        true
    }

    /// 停止清理任务
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Ok(mut slot) = self.inner.sweeper.lock() {
            slot.take();
        }
    }

    /// 立即清理一次本地持有表，返回删除的记录数
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.inner.held)
    }

    /// 本进程当前认为持有的锁
    pub fn held_locks(&self) -> Vec<Lock> {
        self.inner.held.iter().map(|e| e.value().clone()).collect()
    }

    /// 尝试加锁
    ///
    /// # 参数
    ///
    /// * `resource` - 资源名，对应存储键 `{prefix}:{resource}`
    /// * `opts` - 加锁选项
    ///
    /// # 返回值
    ///
    /// 成功返回 [`Lock`]；在选项允许的尝试次数或超时内未获得则返回 None。
    /// 存储故障同样视为未获得。
    #[instrument(skip(self, opts), level = "debug", fields(blocking = opts.blocking))]
    pub async fn acquire(&self, resource: &str, opts: &AcquireOptions) -> Option<Lock> {
        let key = self.key(resource);
        let lock_id = uuid::Uuid::new_v4().to_string();
        let ttl_ms = millis(opts.ttl);
        let deadline = opts.blocking.then(|| Instant::now() + opts.blocking_timeout);
        let mut attempts: u32 = 0;

        loop {
            if self.inner.store.set_if_absent(&key, &lock_id, ttl_ms).await {
                let lock = Lock::new(resource, lock_id, opts.ttl);
                self.inner.held.insert(resource.to_string(), lock.clone());
                Metrics::incr(&self.inner.metrics.locks_acquired);
                debug!("Acquired lock on '{}' after {} retries", resource, attempts);
                return Some(lock);
            }
            Metrics::incr(&self.inner.metrics.locks_contended);

            let delay = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    opts.retry_delay.min(deadline - now)
                }
                None => {
                    if attempts >= opts.max_retries {
                        break;
                    }
                    opts.retry_delay
                }
            };
            attempts += 1;
            tokio::time::sleep(delay).await;
        }

        debug!("Lock on '{}' not acquired after {} attempts", resource, attempts + 1);
        None
    }

    /// 单次尝试，使用默认TTL
    pub async fn try_acquire(&self, resource: &str) -> Option<Lock> {
        self.acquire(resource, &self.options().once()).await
    }

    /// 释放锁，只有持有者标识匹配时才会删除
    #[instrument(skip(self), level = "debug")]
    pub async fn release(&self, resource: &str, lock_id: &str) -> bool {
        let reply = self
            .inner
            .store
            .execute_atomic_script(
                &AtomicScript::CompareAndDelete,
                &[self.key(resource)],
                &[lock_id.to_string()],
            )
            .await;
        self.inner
            .held
            .remove_if(resource, |_, lock| lock.lock_id == lock_id);

        if reply.and_then(|r| r.as_int()) == Some(1) {
            Metrics::incr(&self.inner.metrics.locks_released);
            debug!("Released lock on '{}'", resource);
            true
        } else {
            Metrics::incr(&self.inner.metrics.lock_conflicts);
            warn!(
                "Release of '{}' refused: lock is absent or held by another owner",
                resource
            );
            false
        }
    }

    /// 延长锁的存活时间，新的过期时间为当前时间加 `additional`
    #[instrument(skip(self), level = "debug")]
    pub async fn extend(&self, resource: &str, lock_id: &str, additional: Duration) -> bool {
        let reply = self
            .inner
            .store
            .execute_atomic_script(
                &AtomicScript::CompareAndExpire,
                &[self.key(resource)],
                &[lock_id.to_string(), millis(additional).to_string()],
            )
            .await;

        if reply.and_then(|r| r.as_int()) == Some(1) {
            if let Some(mut lock) = self.inner.held.get_mut(resource) {
                if lock.lock_id == lock_id {
                    lock.ttl = additional;
                    lock.expires_at = Utc::now() + chrono_duration(additional);
                }
            }
            debug!("Extended lock on '{}' by {:?}", resource, additional);
            true
        } else {
            Metrics::incr(&self.inner.metrics.lock_conflicts);
            warn!(
                "Extend of '{}' refused: lock is absent or held by another owner",
                resource
            );
            false
        }
    }

    /// 无条件删除锁记录，仅供运维恢复使用
    #[instrument(skip(self), level = "debug")]
    pub async fn force_release(&self, resource: &str) -> bool {
        let removed = self.inner.store.del(&self.key(resource)).await;
        self.inner.held.remove(resource);
        warn!("Force-released lock on '{}' (existed: {})", resource, removed);
        removed
    }

    pub async fn is_locked(&self, resource: &str) -> bool {
        self.inner.store.exists(&self.key(resource)).await
    }

    /// 当前持有者标识
    pub async fn holder(&self, resource: &str) -> Option<String> {
        let bytes = self.inner.store.get_bytes(&self.key(resource)).await?;
        String::from_utf8(bytes).ok()
    }

    /// 加锁并返回守卫
    pub async fn lock(&self, resource: &str, opts: &AcquireOptions) -> Option<LockGuard> {
        let lock = self.acquire(resource, opts).await?;
        Some(LockGuard {
            manager: self.clone(),
            lock,
            released: false,
        })
    }

    /// 在锁保护下执行 `f`，完成后释放
    ///
    /// 未获得锁时返回 [`CoordError::Lock`]，`f` 不会被调用。
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, opts: &AcquireOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self
            .lock(resource, opts)
            .await
            .ok_or_else(|| CoordError::Lock(format!("could not acquire lock on '{}'", resource)))?;
        let output = f().await;
        if !guard.unlock().await {
            info!("Lock on '{}' expired before the critical section finished", resource);
        }
        Ok(output)
    }

    /// 单许可互斥量
    pub fn mutex(&self, resource: &str) -> DistributedMutex {
        DistributedMutex::new(self.clone(), resource)
    }

    /// 最多 `max_permits` 个许可的分布式信号量
    pub fn semaphore(&self, resource: &str, max_permits: u32) -> Semaphore {
        Semaphore::new(
            self.inner.store.clone(),
            resource,
            max_permits,
            self.inner.defaults.ttl,
        )
    }
}

fn sweep(held: &DashMap<String, Lock>) -> usize {
    let before = held.len();
    held.retain(|_, lock| !lock.is_expired());
    before.saturating_sub(held.len())
}

/// 锁守卫
///
/// 通过 [`LockGuard::unlock`] 显式释放。直接丢弃的守卫不会访问存储，
/// 锁记录由TTL回收。
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    lock: Lock,
    released: bool,
}

impl LockGuard {
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub async fn extend(&mut self, additional: Duration) -> bool {
        let ok = self
            .manager
            .extend(&self.lock.resource, &self.lock.lock_id, additional)
            .await;
        if ok {
            self.lock.ttl = additional;
            self.lock.expires_at = Utc::now() + chrono_duration(additional);
        }
        ok
    }

    pub async fn unlock(mut self) -> bool {
        self.released = true;
        self.manager
            .release(&self.lock.resource, &self.lock.lock_id)
            .await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(
                "Guard for '{}' dropped without unlock; lock expires at {}",
                self.lock.resource, self.lock.expires_at
            );
        }
    }
}
