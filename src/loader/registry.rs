//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 请求级加载器注册表，按实体类型名保存加载器并统一清理。

use super::BatchLoader;
use dashmap::DashMap;
use std::any::Any;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// 可以清空记忆结果的对象
pub trait Clearable: Send + Sync {
    fn clear_all(&self);
}

impl<K, V> Clearable for BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clear_all(&self) {
        BatchLoader::clear_all(self);
    }
}

struct Registered {
    loader: Arc<dyn Any + Send + Sync>,
    clearer: Arc<dyn Clearable>,
}

/// 加载器注册表
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: Arc<DashMap<String, Registered>>,
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册加载器，同名的旧加载器被替换
    pub fn register<K, V>(&self, name: &str, loader: BatchLoader<K, V>)
    where
        K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.loaders.insert(
            name.to_string(),
            Registered {
                loader: Arc::new(loader.clone()),
                clearer: Arc::new(loader),
            },
        );
    }

    /// 取出加载器，名称不存在或类型不符时返回 None
    pub fn get<K, V>(&self, name: &str) -> Option<BatchLoader<K, V>>
    where
        K: 'static,
        V: 'static,
    {
        let entry = self.loaders.get(name)?;
        entry.loader.downcast_ref::<BatchLoader<K, V>>().cloned()
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// 清空所有加载器的记忆结果
    pub fn clear_all(&self) {
        for entry in self.loaders.iter() {
            entry.clearer.clear_all();
        }
        debug!("Cleared {} loaders", self.loaders.len());
    }
}
