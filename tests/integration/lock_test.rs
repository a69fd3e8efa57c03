//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 分布式锁集成测试

#[path = "../common/mod.rs"]
mod common;

use common::memory_coordinator;
use oxcoord::CoordError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_lock_expires_before_release() {
    let coord = memory_coordinator().await;
    let locks = coord.locks();
    let opts = locks.options().once().ttl(Duration::from_millis(1000));

    let lock = locks.acquire("inventory:update", &opts).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(!locks.release("inventory:update", &lock.lock_id).await);
    assert!(!locks.is_locked("inventory:update").await);
}

#[tokio::test]
async fn test_concurrent_non_blocking_acquire_has_one_winner() {
    let coord = memory_coordinator().await;
    let opts = coord.locks().options().once();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let locks = coord.locks().clone();
        let opts = opts.clone();
        tasks.push(tokio::spawn(async move {
            locks.acquire("order:42", &opts).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_blocking_acquire_succeeds_after_release() {
    let coord = memory_coordinator().await;
    let locks = coord.locks().clone();
    let first = locks.try_acquire("report:daily").await.unwrap();

    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move {
            let opts = locks
                .options()
                .retries(0, Duration::from_millis(20))
                .blocking(Duration::from_secs(2));
            locks.acquire("report:daily", &opts).await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(locks.release("report:daily", &first.lock_id).await);

    let second = waiter.await.unwrap().expect("waiter should get the lock");
    assert_ne!(second.lock_id, first.lock_id);
}

#[tokio::test]
async fn test_blocking_acquire_times_out() {
    let coord = memory_coordinator().await;
    let locks = coord.locks();
    let _held = locks.try_acquire("report:weekly").await.unwrap();

    let started = tokio::time::Instant::now();
    let opts = locks
        .options()
        .retries(0, Duration::from_millis(25))
        .blocking(Duration::from_millis(200));
    assert!(locks.acquire("report:weekly", &opts).await.is_none());

    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(2));
}

#[tokio::test]
async fn test_release_with_wrong_id_keeps_holder() {
    let coord = memory_coordinator().await;
    let locks = coord.locks();

    let lock = locks.try_acquire("cart:7").await.unwrap();
    assert!(!locks.release("cart:7", "someone-else").await);
    assert_eq!(locks.holder("cart:7").await, Some(lock.lock_id.clone()));

    assert!(locks.release("cart:7", &lock.lock_id).await);
    assert!(locks.try_acquire("cart:7").await.is_some());
}

#[tokio::test]
async fn test_extend_does_not_resurrect_expired_lock() {
    let coord = memory_coordinator().await;
    let locks = coord.locks();
    let opts = locks.options().once().ttl(Duration::from_millis(200));

    let lock = locks.acquire("job:sync", &opts).await.unwrap();
    assert!(locks.extend("job:sync", &lock.lock_id, Duration::from_millis(500)).await);
    assert!(!locks.extend("job:sync", "intruder", Duration::from_secs(10)).await);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!locks.extend("job:sync", &lock.lock_id, Duration::from_secs(10)).await);
    assert!(!locks.is_locked("job:sync").await);
}

#[tokio::test]
async fn test_with_lock_serializes_critical_sections() {
    let coord = memory_coordinator().await;
    let inside = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let locks = coord.locks().clone();
        let inside = inside.clone();
        let max_seen = max_seen.clone();
        tasks.push(tokio::spawn(async move {
            let opts = locks
                .options()
                .retries(0, Duration::from_millis(10))
                .blocking(Duration::from_secs(5));
            locks
                .with_lock("ledger", &opts, || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(!coord.locks().is_locked("ledger").await);
}

#[tokio::test]
async fn test_with_lock_reports_contention() {
    let coord = memory_coordinator().await;
    let locks = coord.locks();
    let _held = locks.try_acquire("ledger:busy").await.unwrap();

    let result = locks
        .with_lock("ledger:busy", &locks.options().once(), || async { 1 })
        .await;
    assert!(matches!(result, Err(CoordError::Lock(_))));
}

#[tokio::test]
async fn test_semaphore_limits_aggregate_permits() {
    let coord = memory_coordinator().await;
    let semaphore = coord.locks().semaphore("exports", 3);

    let two = semaphore.acquire(2).await.unwrap().unwrap();
    assert!(semaphore.acquire(2).await.unwrap().is_none());
    let _one = semaphore.acquire(1).await.unwrap().unwrap();
    assert_eq!(semaphore.available().await, 0);

    assert!(semaphore.release(&two).await.unwrap());
    assert!(semaphore.acquire(2).await.unwrap().is_some());

    let err = semaphore.acquire(4).await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::PermitsExceeded {
            requested: 4,
            max: 3,
            ..
        }
    ));
}

/// 重复归还不能让并发持有者超过上限
#[tokio::test]
async fn test_semaphore_repeated_release_cannot_oversubscribe() {
    let coord = memory_coordinator().await;
    let semaphore = coord.locks().semaphore("render", 2);

    let a = semaphore.acquire(1).await.unwrap().unwrap();
    let _b = semaphore.acquire(1).await.unwrap().unwrap();
    assert!(semaphore.release(&a).await.unwrap());
    assert!(!semaphore.release(&a).await.unwrap());

    let c = semaphore.acquire(1).await.unwrap();
    let d = semaphore.acquire(1).await.unwrap();
    assert!(c.is_some());
    assert!(d.is_none());
    assert_eq!(semaphore.used().await, 2);
}

#[tokio::test]
async fn test_force_release_and_guard() {
    let coord = memory_coordinator().await;
    let locks = coord.locks();

    let _stale = locks.try_acquire("stuck").await.unwrap();
    assert!(locks.force_release("stuck").await);
    assert!(!locks.is_locked("stuck").await);

    let mut guard = locks.lock("stuck", &locks.options().once()).await.unwrap();
    assert!(guard.extend(Duration::from_secs(5)).await);
    assert!(guard.unlock().await);
    assert!(!locks.is_locked("stuck").await);
}
