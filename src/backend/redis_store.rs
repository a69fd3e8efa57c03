//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于Redis的远端存储实现。

use super::{AtomicScript, KvStore, MessageStream, ScriptReply, StoreMessage, Subscription};
use crate::backend::redis_provider::{DefaultRedisProvider, RedisProvider};
use crate::config::{StoreConfig, StoreMode};
use crate::error::{CoordError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Redis 存储
///
/// 命令走共享的 `ConnectionManager`（自动重连），每个订阅使用独立的 pub/sub 连接。
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    command_timeout: Duration,
    connection_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// 按配置连接 Redis
    #[instrument(skip(config), level = "info", name = "init_redis_store")]
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        Self::connect_with_provider(config, Arc::new(DefaultRedisProvider)).await
    }

    /// 使用指定的连接提供者连接 Redis
    #[instrument(skip(config, provider), level = "info", fields(mode = ?config.mode))]
    pub async fn connect_with_provider(
        config: &StoreConfig,
        provider: Arc<dyn RedisProvider>,
    ) -> Result<Self> {
        let (client, manager) = match config.mode {
            StoreMode::Standalone => provider.get_standalone_client(config).await?,
            StoreMode::Sentinel => provider.get_sentinel_client(config).await?,
            StoreMode::Memory => {
                return Err(CoordError::Configuration(
                    "RedisStore cannot be built for memory mode".to_string(),
                ))
            }
        };
        info!("Redis store connected (mode={:?})", config.mode);
        Ok(Self {
            client,
            manager,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
        })
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(res) => res.map_err(CoordError::from),
            Err(_) => Err(CoordError::Timeout(format!(
                "Redis {} timed out after {}ms",
                op,
                self.command_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    #[instrument(skip(self), level = "debug")]
    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let response: String = self
            .timed("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        debug!("Redis ping response: {}", response);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        self.timed("GET", conn.get(key)).await
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        self.timed(
            "SET",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<()>(&mut conn),
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let result: Option<String> = self
            .timed(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(result.is_some())
    }

    #[instrument(skip(self, keys), level = "debug", fields(key_count = keys.len()))]
    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        self.timed("DEL", redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        self.timed("EXISTS", redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await
    }

    #[instrument(skip(self, keys), level = "debug", fields(key_count = keys.len()))]
    async fn mget_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        self.timed("MGET", redis::cmd("MGET").arg(keys).query_async(&mut conn))
            .await
    }

    #[instrument(skip(self, items), level = "debug", fields(item_count = items.len()))]
    async fn mset_bytes(&self, items: Vec<(String, Vec<u8>)>, ttl_secs: u64) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        // MSET 不支持过期时间，改为事务内逐条 SET EX
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in items {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .ignore();
        }
        let mut conn = self.manager.clone();
        self.timed("MSET", pipe.query_async::<()>(&mut conn)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.manager.clone();
        self.timed(
            "INCRBY",
            redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn),
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        self.timed(
            "EXPIRE",
            redis::cmd("EXPIRE").arg(key).arg(ttl_secs).query_async(&mut conn),
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn pttl(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.manager.clone();
        let ttl: i64 = self
            .timed("PTTL", redis::cmd("PTTL").arg(key).query_async(&mut conn))
            .await?;
        Ok(if ttl >= 0 { Some(ttl as u64) } else { None })
    }

    #[instrument(skip(self), level = "debug")]
    async fn scan_match(&self, pattern: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self
                .timed(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(count)
                        .query_async(&mut conn),
                )
                .await?;
            found.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        // SCAN 可能重复返回同一个键
        found.sort_unstable();
        found.dedup();
        debug!("SCAN {} matched {} keys", pattern, found.len());
        Ok(found)
    }

    #[instrument(skip(self, script), level = "debug", fields(script = script.name()))]
    async fn eval(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply> {
        let script = redis::Script::new(script.source());
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let mut conn = self.manager.clone();
        let value: redis::Value = self
            .timed("EVAL", invocation.invoke_async(&mut conn))
            .await?;
        Ok(ScriptReply::from(value))
    }

    #[instrument(skip(self, payload), level = "debug")]
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        self.timed(
            "PUBLISH",
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn),
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn listen(&self, subscription: &Subscription) -> Result<MessageStream> {
        let mut pubsub = tokio::time::timeout(self.connection_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| CoordError::Timeout("pub/sub connection timed out".to_string()))??;
        match subscription {
            Subscription::Channel(channel) => pubsub.subscribe(channel).await?,
            Subscription::Pattern(pattern) => pubsub.psubscribe(pattern).await?,
        }
        debug!("Redis listener opened for {:?}", subscription);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(StoreMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    debug!("Dropping undecodable pub/sub payload: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Redis store shutting down");
        Ok(())
    }
}
