//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 建立在锁管理器之上的互斥量与信号量。

use super::{AcquireOptions, LockGuard, LockManager};
use crate::backend::AtomicScript;
use crate::error::{CoordError, Result};
use crate::store::StoreAdapter;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// 单资源、单许可的分布式互斥量
#[derive(Debug, Clone)]
pub struct DistributedMutex {
    manager: LockManager,
    resource: String,
}

impl DistributedMutex {
    pub fn new(manager: LockManager, resource: &str) -> Self {
        Self {
            manager,
            resource: resource.to_string(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// 按管理器默认选项加锁（有限次重试）
    pub async fn lock(&self) -> Option<LockGuard> {
        self.manager
            .lock(&self.resource, &self.manager.options())
            .await
    }

    pub async fn try_lock(&self) -> Option<LockGuard> {
        self.manager
            .lock(&self.resource, &self.manager.options().once())
            .await
    }

    /// 在互斥量保护下执行 `f`
    pub async fn run<T, F, Fut>(&self, opts: &AcquireOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.manager.with_lock(&self.resource, opts, f).await
    }
}

/// 信号量许可
///
/// 由 [`Semaphore::acquire`] 返回，凭令牌归还。同一许可只能归还一次，
/// 过期后归还也不会生效。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphorePermit {
    pub resource: String,
    pub token: String,
    pub permits: u32,
}

/// 分布式信号量
///
/// 存储中的 `semaphore:{resource}` 记录每个持有者的令牌、许可数和过期时间。
/// 申请、归还和计数都在存储端原子完成，并先清理过期的持有者，
/// 因此崩溃的持有者占用的许可会在各自的TTL之后回收。
#[derive(Debug, Clone)]
pub struct Semaphore {
    store: StoreAdapter,
    resource: String,
    key: String,
    max_permits: u32,
    ttl: Duration,
}

impl Semaphore {
    /// # 参数
    ///
    /// * `store` - 存储适配器
    /// * `resource` - 资源名
    /// * `max_permits` - 最大许可数
    /// * `ttl` - 每个持有者的许可有效期
    pub fn new(store: StoreAdapter, resource: &str, max_permits: u32, ttl: Duration) -> Self {
        Self {
            store,
            resource: resource.to_string(),
            key: format!("semaphore:{}", resource),
            max_permits,
            ttl,
        }
    }

    pub fn max_permits(&self) -> u32 {
        self.max_permits
    }

    fn check(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Err(CoordError::InvalidInput(format!(
                "semaphore '{}' requires at least one permit per request",
                self.resource
            )));
        }
        if n > self.max_permits {
            return Err(CoordError::PermitsExceeded {
                resource: self.resource.clone(),
                requested: n,
                max: self.max_permits,
            });
        }
        Ok(())
    }

    /// 申请 `n` 个许可，不等待
    ///
    /// `n` 为 0 或超过 `max_permits` 是调用方的编程错误，分别返回
    /// [`CoordError::InvalidInput`] 与 [`CoordError::PermitsExceeded`]；
    /// 许可不足或存储故障返回 `Ok(None)`。
    #[instrument(skip(self), level = "debug", fields(resource = %self.resource))]
    pub async fn acquire(&self, n: u32) -> Result<Option<SemaphorePermit>> {
        self.check(n)?;
        let token = uuid::Uuid::new_v4().to_string();
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply = self
            .store
            .execute_atomic_script(
                &AtomicScript::AcquirePermits,
                &[self.key.clone()],
                &[
                    token.clone(),
                    n.to_string(),
                    self.max_permits.to_string(),
                    ttl_ms.to_string(),
                ],
            )
            .await;
        let granted = reply.and_then(|r| r.as_int()) == Some(1);
        debug!("Semaphore '{}' acquire {} -> {}", self.resource, n, granted);
        Ok(granted.then(|| SemaphorePermit {
            resource: self.resource.clone(),
            token,
            permits: n,
        }))
    }

    /// 轮询申请直到成功或超时
    pub async fn acquire_timeout(
        &self,
        n: u32,
        timeout: Duration,
        retry_delay: Duration,
    ) -> Result<Option<SemaphorePermit>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(permit) = self.acquire(n).await? {
                return Ok(Some(permit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(retry_delay.min(deadline - now)).await;
        }
    }

    /// 归还许可
    ///
    /// 只移除该许可自己的令牌。许可已归还、已过期或存储故障时返回 `Ok(false)`；
    /// 许可属于其他资源时返回 [`CoordError::InvalidInput`]。
    #[instrument(skip(self, permit), level = "debug", fields(resource = %self.resource))]
    pub async fn release(&self, permit: &SemaphorePermit) -> Result<bool> {
        if permit.resource != self.resource {
            return Err(CoordError::InvalidInput(format!(
                "permit for '{}' cannot be returned to semaphore '{}'",
                permit.resource, self.resource
            )));
        }
        let reply = self
            .store
            .execute_atomic_script(
                &AtomicScript::ReleasePermits,
                &[self.key.clone()],
                &[permit.token.clone()],
            )
            .await;
        match reply.and_then(|r| r.as_int()) {
            Some(left) if left >= 0 => {
                debug!("Semaphore '{}' released {}, {} still in use", self.resource, permit.permits, left);
                Ok(true)
            }
            _ => {
                warn!(
                    "Semaphore '{}' release refused: permit already returned or expired",
                    self.resource
                );
                Ok(false)
            }
        }
    }

    /// 当前有效持有者占用的许可数
    pub async fn used(&self) -> u32 {
        self.store
            .execute_atomic_script(&AtomicScript::CountPermits, &[self.key.clone()], &[])
            .await
            .and_then(|r| r.as_int())
            .and_then(|used| u32::try_from(used).ok())
            .unwrap_or(0)
    }

    pub async fn available(&self) -> u32 {
        self.max_permits.saturating_sub(self.used().await)
    }
}
