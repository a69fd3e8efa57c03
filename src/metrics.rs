//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的运行时指标。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 指标收集器
///
/// 每个 [`crate::Coordinator`] 持有一份，通过 `Arc` 在各组件间共享
#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_sets: AtomicU64,
    pub cache_invalidations: AtomicU64,
    pub store_errors: AtomicU64,
    pub locks_acquired: AtomicU64,
    pub locks_contended: AtomicU64,
    pub locks_released: AtomicU64,
    pub lock_conflicts: AtomicU64,
    pub events_published: AtomicU64,
    pub events_delivered: AtomicU64,
    pub handler_failures: AtomicU64,
    pub loader_batches: AtomicU64,
    pub loader_keys: AtomicU64,
}

/// 指标快照
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_sets: u64,
    pub cache_invalidations: u64,
    pub store_errors: u64,
    pub locks_acquired: u64,
    pub locks_contended: u64,
    pub locks_released: u64,
    pub lock_conflicts: u64,
    pub events_published: u64,
    pub events_delivered: u64,
    pub handler_failures: u64,
    pub loader_batches: u64,
    pub loader_keys: u64,
}

impl Metrics {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_sets: load(&self.cache_sets),
            cache_invalidations: load(&self.cache_invalidations),
            store_errors: load(&self.store_errors),
            locks_acquired: load(&self.locks_acquired),
            locks_contended: load(&self.locks_contended),
            locks_released: load(&self.locks_released),
            lock_conflicts: load(&self.lock_conflicts),
            events_published: load(&self.events_published),
            events_delivered: load(&self.events_delivered),
            handler_failures: load(&self.handler_failures),
            loader_batches: load(&self.loader_batches),
            loader_keys: load(&self.loader_keys),
        }
    }
}

impl MetricsSnapshot {
    /// 缓存命中率，尚无请求时返回 None
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            None
        } else {
            Some(self.cache_hits as f64 / total as f64)
        }
    }

    /// Prometheus 文本格式输出
    pub fn render_prometheus(&self, instance: &str) -> String {
        let rows = [
            ("oxcoord_cache_hits_total", self.cache_hits),
            ("oxcoord_cache_misses_total", self.cache_misses),
            ("oxcoord_cache_sets_total", self.cache_sets),
            ("oxcoord_cache_invalidations_total", self.cache_invalidations),
            ("oxcoord_store_errors_total", self.store_errors),
            ("oxcoord_locks_acquired_total", self.locks_acquired),
            ("oxcoord_locks_contended_total", self.locks_contended),
            ("oxcoord_locks_released_total", self.locks_released),
            ("oxcoord_lock_conflicts_total", self.lock_conflicts),
            ("oxcoord_events_published_total", self.events_published),
            ("oxcoord_events_delivered_total", self.events_delivered),
            ("oxcoord_handler_failures_total", self.handler_failures),
            ("oxcoord_loader_batches_total", self.loader_batches),
            ("oxcoord_loader_keys_total", self.loader_keys),
        ];
        let mut output = String::new();
        for (name, value) in rows {
            output.push_str(&format!("{}{{instance=\"{}\"}} {}\n", name, instance, value));
        }
        output
    }
}
