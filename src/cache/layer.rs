//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了声明式缓存包装器：读缓存、写后失效、执行后预热。
//!
//! 包装器持有一个异步操作 `Fn(A) -> Future<Output = Result<T, E>>`，
//! 调用方通过 `call(args)` 使用，与直接调用原操作的签名一致。

use super::{CacheCoordinator, CacheTtl, WarmupReport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;
type KeysFn<A> = Arc<dyn Fn(&A) -> Vec<String> + Send + Sync>;
type SkipFn<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;

/// 缓存策略
pub struct CachePolicy<A> {
    name: String,
    ttl: Option<CacheTtl>,
    tags: Vec<String>,
    key_fn: Option<KeyFn<A>>,
    skip_fn: Option<SkipFn<A>>,
}

impl<A> CachePolicy<A> {
    /// # 参数
    ///
    /// * `name` - 操作标识，默认键为 `{name}:{参数的JSON}`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: None,
            tags: Vec::new(),
            key_fn: None,
            skip_fn: None,
        }
    }

    /// 未设置时使用协调器的默认档位
    pub fn ttl(mut self, ttl: impl Into<CacheTtl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// 自定义键生成
    pub fn key_with(mut self, f: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// 谓词为真时绕过缓存直接调用操作
    pub fn skip_cache_when(mut self, f: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.skip_fn = Some(Arc::new(f));
        self
    }

    pub fn should_skip(&self, args: &A) -> bool {
        self.skip_fn.as_ref().map(|f| f(args)).unwrap_or(false)
    }
}

impl<A: Serialize> CachePolicy<A> {
    /// 计算缓存键，参数无法序列化时返回 None（此时不走缓存）
    pub fn key_for(&self, args: &A) -> Option<String> {
        if let Some(f) = &self.key_fn {
            return Some(f(args));
        }
        serde_json::to_string(args)
            .ok()
            .map(|encoded| format!("{}:{}", self.name, encoded))
    }
}

/// 带缓存的操作
pub struct CachedOperation<A, F> {
    cache: CacheCoordinator,
    policy: CachePolicy<A>,
    op: F,
}

impl<A: Serialize, F> CachedOperation<A, F> {
    pub fn new(cache: CacheCoordinator, policy: CachePolicy<A>, op: F) -> Self {
        Self { cache, policy, op }
    }

    /// 命中直接返回，未命中调用操作并写入缓存；操作失败时不缓存
    pub async fn call<Fut, T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        let key = if self.policy.should_skip(&args) {
            None
        } else {
            self.policy.key_for(&args)
        };
        let Some(key) = key else {
            debug!("Bypassing cache for {}", self.policy.name);
            return (self.op)(args).await;
        };
        let ttl = self.policy.ttl.unwrap_or_else(|| self.cache.default_ttl());
        self.cache
            .get_or_set_tagged(&key, || (self.op)(args), ttl, &self.policy.tags)
            .await
    }
}

/// 需要失效的目标
pub struct InvalidationTargets<A> {
    keys: Vec<String>,
    patterns: Vec<String>,
    tags: Vec<String>,
    keys_fn: Option<KeysFn<A>>,
}

impl<A> Default for InvalidationTargets<A> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            patterns: Vec::new(),
            tags: Vec::new(),
            keys_fn: None,
        }
    }
}

impl<A> InvalidationTargets<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, keys: I) -> Self {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn patterns<I: IntoIterator<Item = S>, S: Into<String>>(mut self, patterns: I) -> Self {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// 根据调用参数计算额外要删除的键
    pub fn keys_from(mut self, f: impl Fn(&A) -> Vec<String> + Send + Sync + 'static) -> Self {
        self.keys_fn = Some(Arc::new(f));
        self
    }
}

/// 执行成功后失效缓存的操作
pub struct InvalidatingOperation<A, F> {
    cache: CacheCoordinator,
    targets: InvalidationTargets<A>,
    op: F,
}

impl<A, F> InvalidatingOperation<A, F> {
    pub fn new(cache: CacheCoordinator, targets: InvalidationTargets<A>, op: F) -> Self {
        Self { cache, targets, op }
    }

    pub async fn call<Fut, T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut keys = self.targets.keys.clone();
        if let Some(f) = &self.targets.keys_fn {
            keys.extend(f(&args));
        }
        let result = (self.op)(args).await?;
        self.cache
            .invalidate_targets(&keys, &self.targets.patterns, &self.targets.tags)
            .await;
        Ok(result)
    }
}

/// 执行成功后把结果预热到若干冷键的操作
pub struct WarmingOperation<A, F> {
    cache: CacheCoordinator,
    keys_fn: KeysFn<A>,
    ttl: CacheTtl,
    op: F,
}

impl<A, F> WarmingOperation<A, F> {
    pub fn new(
        cache: CacheCoordinator,
        keys_fn: impl Fn(&A) -> Vec<String> + Send + Sync + 'static,
        ttl: impl Into<CacheTtl>,
        op: F,
    ) -> Self {
        Self {
            cache,
            keys_fn: Arc::new(keys_fn),
            ttl: ttl.into(),
            op,
        }
    }

    /// 返回操作结果；预热只写入当前不存在的键
    pub async fn call<Fut, T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + Sync,
    {
        let keys = (self.keys_fn)(&args);
        let value = (self.op)(args).await?;
        if !keys.is_empty() {
            let entries: Vec<(String, &T)> = keys.into_iter().map(|k| (k, &value)).collect();
            let WarmupReport { loaded, .. } = self.cache.warm(entries, self.ttl).await;
            debug!("Warming wrapper populated {} keys", loaded);
        }
        Ok(value)
    }
}

impl CacheCoordinator {
    /// 用缓存包装一个操作
    pub fn cached<A: Serialize, F>(&self, policy: CachePolicy<A>, op: F) -> CachedOperation<A, F> {
        CachedOperation::new(self.clone(), policy, op)
    }

    /// 包装一个写操作，成功后失效目标
    pub fn invalidating<A, F>(
        &self,
        targets: InvalidationTargets<A>,
        op: F,
    ) -> InvalidatingOperation<A, F> {
        InvalidatingOperation::new(self.clone(), targets, op)
    }

    /// 包装一个操作，成功后把结果写入 `keys_fn` 给出的冷键
    pub fn warming<A, F>(
        &self,
        keys_fn: impl Fn(&A) -> Vec<String> + Send + Sync + 'static,
        ttl: impl Into<CacheTtl>,
        op: F,
    ) -> WarmingOperation<A, F> {
        WarmingOperation::new(self.clone(), keys_fn, ttl, op)
    }
}
