//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了请求级批量加载器，用于消除 N+1 查询。
//!
//! 同一调度轮次内对同一实体类型的 `load` 调用被合并为一次批量回源，
//! 结果按请求顺序返回，并在加载器生命周期内记忆。

pub mod cached;
pub mod registry;

pub use cached::CachedBatchFn;
pub use registry::{Clearable, LoaderRegistry};

use crate::config::LoaderConfig;
use crate::error::{CoordError, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, instrument};

/// 批量回源接口
///
/// 返回的映射中缺失的键视为不存在（结果为 None）。
#[async_trait]
pub trait BatchFn<K, V>: Send + Sync + 'static {
    /// 批量加载数据
    ///
    /// # 参数
    ///
    /// * `keys` - 去重后的键列表
    ///
    /// # 返回值
    ///
    /// 键到值的映射
    async fn load_batch(&self, keys: Vec<K>) -> Result<HashMap<K, V>>;
}

/// 以闭包实现的批量回源
pub struct FnBatch<F>(F);

#[async_trait]
impl<K, V, F, Fut> BatchFn<K, V> for FnBatch<F>
where
    K: Send + 'static,
    V: Send + 'static,
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HashMap<K, V>>> + Send,
{
    async fn load_batch(&self, keys: Vec<K>) -> Result<HashMap<K, V>> {
        (self.0)(keys).await
    }
}

pub fn batch_fn<K, V, F, Fut>(f: F) -> FnBatch<F>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HashMap<K, V>>> + Send,
{
    FnBatch(f)
}

type Outcome<V> = std::result::Result<Option<V>, String>;

/// 零延迟时最多让出调度的次数，队列长度稳定后提前派发
const MAX_SETTLE_YIELDS: usize = 16;

struct LoaderState<K, V> {
    /// 已解析的结果，包括不存在的键
    memo: HashMap<K, Option<V>>,
    /// 等待下一次派发的键，按首次请求顺序
    queue: Vec<(u64, K)>,
    /// 排队或回源中的键及其等待者，按发起时的代数区分
    waiters: HashMap<(u64, K), Vec<oneshot::Sender<Outcome<V>>>>,
    /// `clear_all` 每调用一次加一，旧代的回源结果不再写入记忆
    generation: u64,
    scheduled: bool,
}

struct LoaderInner<K, V> {
    batch_fn: Arc<dyn BatchFn<K, V>>,
    max_batch_size: usize,
    batch_delay: Duration,
    state: Mutex<LoaderState<K, V>>,
    metrics: Option<Arc<Metrics>>,
}

/// 批量加载器
///
/// 通常每个请求创建一个，克隆共享同一组状态。
pub struct BatchLoader<K, V> {
    inner: Arc<LoaderInner<K, V>>,
}

impl<K, V> Clone for BatchLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for BatchLoader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("max_batch_size", &self.inner.max_batch_size)
            .field("batch_delay", &self.inner.batch_delay)
            .finish()
    }
}

impl<K, V> BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(batch_fn: impl BatchFn<K, V>, config: &LoaderConfig) -> Self {
        Self::from_arc(Arc::new(batch_fn), config)
    }

    pub fn from_arc(batch_fn: Arc<dyn BatchFn<K, V>>, config: &LoaderConfig) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                batch_fn,
                max_batch_size: config.max_batch_size.max(1),
                batch_delay: Duration::from_millis(config.batch_delay_ms),
                state: Mutex::new(LoaderState {
                    memo: HashMap::new(),
                    queue: Vec::new(),
                    waiters: HashMap::new(),
                    generation: 0,
                    scheduled: false,
                }),
                metrics: None,
            }),
        }
    }

    /// 记录批次与键数到给定的计数器
    pub fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.metrics = Some(metrics);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LoaderState<K, V>> {
        // 中毒时沿用内部状态
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 加载单个键
    ///
    /// 回源失败时所有合并到同一批次的调用方都会收到
    /// [`CoordError::BatchLoad`]，失败的键不会被记忆。
    pub async fn load(&self, key: K) -> Result<Option<V>> {
        let rx = {
            let mut guard = self.state();
            let state = &mut *guard;
            if let Some(hit) = state.memo.get(&key) {
                return Ok(hit.clone());
            }
            let (tx, rx) = oneshot::channel();
            let generation = state.generation;
            match state.waiters.entry((generation, key.clone())) {
                Entry::Occupied(mut waiting) => waiting.get_mut().push(tx),
                Entry::Vacant(slot) => {
                    slot.insert(vec![tx]);
                    state.queue.push((generation, key));
                    if state.queue.len() >= self.inner.max_batch_size {
                        let batch = std::mem::take(&mut state.queue);
                        tokio::spawn(self.clone().dispatch(batch));
                    } else if !state.scheduled {
                        state.scheduled = true;
                        tokio::spawn(self.clone().flush_later());
                    }
                }
            }
            rx
        };

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(CoordError::BatchLoad(message)),
            Err(_) => Err(CoordError::BatchLoad(
                "batch was dropped before it resolved".to_string(),
            )),
        }
    }

    /// 加载多个键，结果与 `keys` 顺序一致
    pub async fn load_many(&self, keys: &[K]) -> Result<Vec<Option<V>>> {
        futures::future::join_all(keys.iter().cloned().map(|k| self.load(k)))
            .await
            .into_iter()
            .collect()
    }

    /// 预先放入一个已知结果，已有结果时不覆盖
    pub fn prime(&self, key: K, value: V) {
        self.state().memo.entry(key).or_insert(Some(value));
    }

    /// 丢弃某个键的记忆结果
    pub fn clear(&self, key: &K) {
        self.state().memo.remove(key);
    }

    /// 丢弃所有记忆结果
    ///
    /// 之后的 `load` 不会合并进此前已经发出的批次，
    /// 这些批次的结果仍交给原来的调用方，但不再进入记忆。
    pub fn clear_all(&self) {
        let mut state = self.state();
        state.memo.clear();
        state.generation += 1;
    }

    async fn flush_later(self) {
        if self.inner.batch_delay.is_zero() {
            self.settle().await;
        } else {
            tokio::time::sleep(self.inner.batch_delay).await;
        }
        let queued = {
            let mut state = self.state();
            state.scheduled = false;
            std::mem::take(&mut state.queue)
        };
        if queued.is_empty() {
            return;
        }
        let size = self.inner.max_batch_size;
        let batches: Vec<Vec<(u64, K)>> = queued.chunks(size).map(|c| c.to_vec()).collect();
        futures::future::join_all(batches.into_iter().map(|b| self.clone().dispatch(b))).await;
    }

    /// 反复让出调度，直到一轮之内没有新键入队
    ///
    /// 多线程运行时上其他工作线程的 `load` 可能晚于单次让出才到达，
    /// 需要严格合并时应配置 `batch_delay_ms`。
    async fn settle(&self) {
        let mut queued = self.state().queue.len();
        for _ in 0..MAX_SETTLE_YIELDS {
            tokio::task::yield_now().await;
            let now = self.state().queue.len();
            if now == queued {
                break;
            }
            queued = now;
        }
    }

    #[instrument(skip(self, entries), level = "debug", fields(batch_size = entries.len()))]
    async fn dispatch(self, entries: Vec<(u64, K)>) {
        let mut seen = HashSet::new();
        let keys: Vec<K> = entries
            .iter()
            .filter(|(_, key)| seen.insert(key.clone()))
            .map(|(_, key)| key.clone())
            .collect();
        if let Some(metrics) = &self.inner.metrics {
            Metrics::incr(&metrics.loader_batches);
            Metrics::add(&metrics.loader_keys, keys.len() as u64);
        }
        let key_count = keys.len();
        let result = match AssertUnwindSafe(self.inner.batch_fn.load_batch(keys))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(CoordError::BatchLoad(format!(
                "batch function panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let mut guard = self.state();
        let state = &mut *guard;
        match result {
            Ok(found) => {
                debug!("Batch resolved {} of {} keys", found.len(), key_count);
                for (generation, key) in entries {
                    let value = found.get(&key).cloned();
                    if generation == state.generation {
                        state.memo.insert(key.clone(), value.clone());
                    }
                    for tx in state.waiters.remove(&(generation, key)).unwrap_or_default() {
                        let _ = tx.send(Ok(value.clone()));
                    }
                }
            }
            Err(e) => {
                error!("Batch load of {} keys failed: {}", key_count, e);
                let message = e.to_string();
                for entry in entries {
                    for tx in state.waiters.remove(&entry).unwrap_or_default() {
                        let _ = tx.send(Err(message.clone()));
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
