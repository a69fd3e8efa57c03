//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和设置。

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use oxcoord::backend::{
    AtomicScript, KvStore, MemoryStore, MessageStream, ScriptReply, Subscription,
};
use oxcoord::config::{Config, StoreMode};
use oxcoord::{CoordError, Coordinator, Result};
use secrecy::SecretString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new("debug"))
            .try_init()
            .ok();
    });
}

/// 测试用 Redis 地址，优先读取 `REDIS_URL`
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// 检查Redis是否可用
///
/// 在一秒内建立连接并完成 PING 才视为可用
pub async fn is_redis_available() -> bool {
    let client = match redis::Client::open(redis_url()) {
        Ok(client) => client,
        Err(_) => return false,
    };
    let ping = async {
        let mut conn = client.get_multiplexed_async_connection().await.ok()?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .ok()
    };
    matches!(
        tokio::time::timeout(Duration::from_secs(1), ping).await,
        Ok(Some(_))
    )
}

/// 指向测试 Redis 的配置
pub fn redis_config() -> Config {
    let mut config = Config::default();
    config.store.mode = StoreMode::Standalone;
    config.store.connection_string = SecretString::new(redis_url().into());
    config.store.connection_timeout_ms = 2000;
    config
}

/// 使用进程内存储的协调器
pub async fn memory_coordinator() -> Coordinator {
    setup_logging();
    Coordinator::in_memory()
        .await
        .expect("in-memory coordinator should always build")
}

/// 生成唯一名称
///
/// 在基础名称后附加UUID，确保共享 Redis 的测试之间互不干扰
pub fn unique_name(base: &str) -> String {
    format!("{}_{}", base, uuid::Uuid::new_v4().simple())
}

/// 包装内存存储的故障注入存储
///
/// 可以让 `expire` 始终失败，也可以随时切断所有已打开的订阅流，模拟连接断开。
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_expire: bool,
    connection: Mutex<CancellationToken>,
    listen_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(10_000),
            fail_expire: false,
            connection: Mutex::new(CancellationToken::new()),
            listen_calls: AtomicUsize::new(0),
        }
    }

    /// `expire` 总是返回传输错误
    pub fn failing_expire() -> Self {
        Self {
            fail_expire: true,
            ..Self::new()
        }
    }

    /// 结束当前所有订阅流，之后新打开的订阅不受影响
    pub fn drop_connections(&self) {
        let mut connection = self.connection.lock().unwrap();
        connection.cancel();
        *connection = CancellationToken::new();
    }

    pub fn listen_calls(&self) -> usize {
        self.listen_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_bytes(key).await
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.inner.set_bytes(key, value, ttl_secs).await
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        self.inner.set_nx_px(key, value, ttl_ms).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn mget_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.inner.mget_bytes(keys).await
    }

    async fn mset_bytes(&self, items: Vec<(String, Vec<u8>)>, ttl_secs: u64) -> Result<()> {
        self.inner.mset_bytes(items, ttl_secs).await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.inner.incr(key, delta).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        if self.fail_expire {
            return Err(CoordError::Store("connection reset during EXPIRE".to_string()));
        }
        self.inner.expire(key, ttl_secs).await
    }

    async fn pttl(&self, key: &str) -> Result<Option<u64>> {
        self.inner.pttl(key).await
    }

    async fn scan_match(&self, pattern: &str, count: usize) -> Result<Vec<String>> {
        self.inner.scan_match(pattern, count).await
    }

    async fn eval(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply> {
        self.inner.eval(script, keys, args).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.inner.publish(channel, payload).await
    }

    async fn listen(&self, subscription: &Subscription) -> Result<MessageStream> {
        let stream = self.inner.listen(subscription).await?;
        let connection = self.connection.lock().unwrap().clone();
        self.listen_calls.fetch_add(1, Ordering::SeqCst);
        Ok(stream
            .take_until(async move { connection.cancelled().await })
            .boxed())
    }
}
