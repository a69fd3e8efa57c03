//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了进程内存储实现，基于Moka，用于单节点部署和测试。

use super::{AtomicScript, KvStore, MessageStream, ScriptReply, StoreMessage, Subscription};
use crate::error::{CoordError, Result};
use crate::utils::GlobMatcher;
use async_trait::async_trait;
use futures::StreamExt;
use moka::future::Cache;
use moka::Expiry;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument, warn};

const PUBSUB_CAPACITY: usize = 1024;

/// 信号量持有者：令牌 -> (许可数, 过期时间戳毫秒)
type PermitHolders = BTreeMap<String, (i64, i64)>;

#[derive(Clone, Debug)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }

    fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

struct EntryExpiry;

impl Expiry<String, MemoryEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.remaining()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining()
    }
}

/// 进程内存储
///
/// 语义与 Redis 存储保持一致：秒/毫秒级过期、glob 扫描、内置原子脚本和 pub/sub。
/// 复合操作在一个本地互斥锁下执行，保证与 Redis 脚本相同的原子性。
pub struct MemoryStore {
    entries: Cache<String, MemoryEntry>,
    write_lock: Mutex<()>,
    bus: broadcast::Sender<StoreMessage>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl MemoryStore {
    /// 创建新的内存存储
    ///
    /// # 参数
    ///
    /// * `capacity` - 最大条目数
    pub fn new(capacity: u64) -> Self {
        let (bus, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .expire_after(EntryExpiry)
                .build(),
            write_lock: Mutex::new(()),
            bus,
        }
    }

    async fn live(&self, key: &str) -> Option<MemoryEntry> {
        match self.entries.get(key).await {
            Some(entry) if entry.is_live() => Some(entry),
            Some(_) => {
                self.entries.invalidate(key).await;
                None
            }
            None => None,
        }
    }

    fn parse_counter(entry: Option<&MemoryEntry>) -> Result<i64> {
        match entry {
            None => Ok(0),
            Some(entry) => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    CoordError::Store("value is not an integer or out of range".to_string())
                }),
        }
    }

    fn arg_i64(args: &[String], index: usize) -> Result<i64> {
        args.get(index)
            .and_then(|a| a.parse::<i64>().ok())
            .ok_or_else(|| CoordError::InvalidInput(format!("script argument {} must be an integer", index + 1)))
    }

    fn arg_str(args: &[String], index: usize) -> Result<&str> {
        args.get(index)
            .map(String::as_str)
            .ok_or_else(|| CoordError::InvalidInput(format!("script argument {} is missing", index + 1)))
    }

    fn deadline_ms(ttl_ms: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(ttl_ms))
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// 解析信号量持有者表并去掉已过期的持有者
    fn live_holders(entry: Option<&MemoryEntry>, now_ms: i64) -> Result<PermitHolders> {
        let mut holders: PermitHolders = match entry {
            None => PermitHolders::new(),
            Some(entry) => serde_json::from_slice(&entry.value).map_err(|e| {
                CoordError::Store(format!("semaphore holder table is corrupt: {}", e))
            })?,
        };
        holders.retain(|_, (_, expires_at)| *expires_at > now_ms);
        Ok(holders)
    }

    /// 写回持有者表，键的过期时间取最晚的持有者；表为空时删除键
    async fn store_holders(&self, key: &str, holders: &PermitHolders, now_ms: i64) -> Result<()> {
        let Some(latest) = holders.values().map(|(_, expires_at)| *expires_at).max() else {
            self.entries.invalidate(key).await;
            return Ok(());
        };
        let value = serde_json::to_vec(holders).map_err(|e| CoordError::Serialization(e.to_string()))?;
        self.entries
            .insert(
                key.to_string(),
                MemoryEntry {
                    value,
                    expires_at: Self::deadline_ms((latest - now_ms).max(1) as u64),
                },
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live(key).await.map(|e| e.value))
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.entries
            .insert(
                key.to_string(),
                MemoryEntry {
                    value,
                    expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
                },
            )
            .await;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.live(key).await.is_some() {
            return Ok(false);
        }
        self.entries
            .insert(
                key.to_string(),
                MemoryEntry {
                    value: value.as_bytes().to_vec(),
                    expires_at: Self::deadline_ms(ttl_ms),
                },
            )
            .await;
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = self.entries.remove(key.as_str()).await {
                if entry.is_live() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).await.is_some())
    }

    async fn mget_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.live(key).await.map(|e| e.value));
        }
        Ok(values)
    }

    async fn mset_bytes(&self, items: Vec<(String, Vec<u8>)>, ttl_secs: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        for (key, value) in items {
            self.entries
                .insert(key, MemoryEntry { value, expires_at })
                .await;
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let current = self.live(key).await;
        let next = Self::parse_counter(current.as_ref())?
            .checked_add(delta)
            .ok_or_else(|| CoordError::Store("increment would overflow".to_string()))?;
        self.entries
            .insert(
                key.to_string(),
                MemoryEntry {
                    value: next.to_string().into_bytes(),
                    expires_at: current.and_then(|e| e.expires_at),
                },
            )
            .await;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match self.live(key).await {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                self.entries.insert(key.to_string(), entry).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pttl(&self, key: &str) -> Result<Option<u64>> {
        Ok(self
            .live(key)
            .await
            .and_then(|e| e.remaining())
            .map(|d| d.as_millis() as u64))
    }

    #[instrument(skip(self), level = "debug")]
    async fn scan_match(&self, pattern: &str, _count: usize) -> Result<Vec<String>> {
        let matcher = GlobMatcher::new(pattern)?;
        let mut found: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, entry)| entry.is_live() && matcher.is_match(key.as_str()))
            .map(|(key, _)| key.to_string())
            .collect();
        found.sort_unstable();
        debug!("Memory scan {} matched {} keys", pattern, found.len());
        Ok(found)
    }

    #[instrument(skip(self, script), level = "debug", fields(script = script.name()))]
    async fn eval(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply> {
        let key = keys
            .first()
            .ok_or_else(|| CoordError::InvalidInput("script requires one key".to_string()))?;
        let _guard = self.write_lock.lock().await;
        let current = self.live(key).await;

        match script {
            AtomicScript::CompareAndDelete => {
                let expected = args.first().map(String::as_bytes);
                match current {
                    Some(entry) if Some(entry.value.as_slice()) == expected => {
                        self.entries.invalidate(key.as_str()).await;
                        Ok(ScriptReply::Int(1))
                    }
                    _ => Ok(ScriptReply::Int(0)),
                }
            }
            AtomicScript::CompareAndExpire => {
                let expected = args.first().map(String::as_bytes);
                let ttl_ms = Self::arg_i64(args, 1)?.max(0) as u64;
                match current {
                    Some(mut entry) if Some(entry.value.as_slice()) == expected => {
                        entry.expires_at = Self::deadline_ms(ttl_ms);
                        self.entries.insert(key.clone(), entry).await;
                        Ok(ScriptReply::Int(1))
                    }
                    _ => Ok(ScriptReply::Int(0)),
                }
            }
            AtomicScript::AcquirePermits => {
                let token = Self::arg_str(args, 0)?;
                let requested = Self::arg_i64(args, 1)?;
                let max = Self::arg_i64(args, 2)?;
                let ttl_ms = Self::arg_i64(args, 3)?.max(1);
                let now = Self::now_ms();
                let mut holders = Self::live_holders(current.as_ref(), now)?;
                let used: i64 = holders.values().map(|(permits, _)| *permits).sum();
                let granted = used + requested <= max;
                if granted {
                    holders.insert(token.to_string(), (requested, now + ttl_ms));
                }
                self.store_holders(key, &holders, now).await?;
                Ok(ScriptReply::Int(i64::from(granted)))
            }
            AtomicScript::ReleasePermits => {
                let token = Self::arg_str(args, 0)?;
                let now = Self::now_ms();
                let mut holders = Self::live_holders(current.as_ref(), now)?;
                let released = holders.remove(token);
                self.store_holders(key, &holders, now).await?;
                match released {
                    Some(_) => Ok(ScriptReply::Int(
                        holders.values().map(|(permits, _)| *permits).sum(),
                    )),
                    None => Ok(ScriptReply::Int(-1)),
                }
            }
            AtomicScript::CountPermits => {
                let now = Self::now_ms();
                let holders = Self::live_holders(current.as_ref(), now)?;
                self.store_holders(key, &holders, now).await?;
                Ok(ScriptReply::Int(
                    holders.values().map(|(permits, _)| *permits).sum(),
                ))
            }
            AtomicScript::IncrWithTtl => {
                let delta = Self::arg_i64(args, 0)?;
                let ttl_ms = Self::arg_i64(args, 1)?.max(1) as u64;
                let next = Self::parse_counter(current.as_ref())?
                    .checked_add(delta)
                    .ok_or_else(|| CoordError::Store("increment would overflow".to_string()))?;
                let expires_at = current
                    .and_then(|e| e.expires_at)
                    .or_else(|| Self::deadline_ms(ttl_ms));
                self.entries
                    .insert(
                        key.clone(),
                        MemoryEntry {
                            value: next.to_string().into_bytes(),
                            expires_at,
                        },
                    )
                    .await;
                Ok(ScriptReply::Int(next))
            }
            AtomicScript::Custom(_) => Err(CoordError::NotSupported(
                "custom Lua scripts require the Redis store".to_string(),
            )),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let message = StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // 没有订阅者时 send 返回错误，消息直接丢弃
        Ok(self.bus.send(message).map(|n| n as u64).unwrap_or(0))
    }

    async fn listen(&self, subscription: &Subscription) -> Result<MessageStream> {
        let pattern = match subscription {
            Subscription::Channel(_) => None,
            Subscription::Pattern(p) => Some(GlobMatcher::new(p)?),
        };
        let exact = subscription.name().to_string();
        let rx = self.bus.subscribe();

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let pattern = pattern.clone();
            let exact = exact.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) => {
                            let matched = match &pattern {
                                Some(m) => m.is_match(&msg.channel),
                                None => msg.channel == exact,
                            };
                            if matched {
                                return Some((msg, rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Memory pub/sub listener lagged, {} messages dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
