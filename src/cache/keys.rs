//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 键命名空间约定（冒号分隔）。

use crate::utils::escape_glob;
use serde::Serialize;
use std::fmt::Display;
use std::hash::{BuildHasher, Hash, Hasher};

/// 固定种子，保证不同进程对同一过滤条件得到相同的哈希
const FILTER_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x6f78_636f_6f72_6401,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
);

pub fn product(id: impl Display) -> String {
    format!("product:{}", id)
}

pub fn products(filters_hash: &str) -> String {
    format!("products:{}", filters_hash)
}

pub fn user(id: impl Display) -> String {
    format!("user:{}", id)
}

pub fn user_purchases(id: impl Display, page: u32) -> String {
    format!("user:purchases:{}:{}", id, page)
}

pub fn shop(id: impl Display) -> String {
    format!("shop:{}", id)
}

pub fn shop_products(id: impl Display, page: u32) -> String {
    format!("shop:products:{}:{}", id, page)
}

pub fn search(query: &str, filters_hash: &str) -> String {
    format!("search:{}:{}", query, filters_hash)
}

pub fn recommendations(user_id: impl Display) -> String {
    format!("recommendations:{}", user_id)
}

pub fn rate_limit(identifier: &str) -> String {
    format!("rate_limit:{}", identifier)
}

/// 标签索引项 `tag:{tag}:{key}`
pub fn tag_index(tag: &str, key: &str) -> String {
    format!("tag:{}:{}", tag, key)
}

/// 匹配某个标签下所有索引项的模式
pub fn tag_pattern(tag: &str) -> String {
    format!("tag:{}:*", escape_glob(tag))
}

/// 从标签索引项还原被索引的键
pub fn key_from_tag_index<'a>(tag: &str, index_key: &'a str) -> Option<&'a str> {
    index_key
        .strip_prefix("tag:")?
        .strip_prefix(tag)?
        .strip_prefix(':')
}

/// 过滤条件的稳定哈希
///
/// 先转成 `serde_json::Value`，对象键有序，字段顺序不同的同一组条件得到相同结果。
pub fn filters_hash<T: Serialize + ?Sized>(filters: &T) -> String {
    let canonical = serde_json::to_value(filters)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let (k0, k1, k2, k3) = FILTER_HASH_SEEDS;
    let mut hasher = ahash::RandomState::with_seeds(k0, k1, k2, k3).build_hasher();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
