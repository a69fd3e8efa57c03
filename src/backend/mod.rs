//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了远端键值存储的抽象以及 Redis / 内存两种实现。

pub mod memory;
pub mod redis_provider;
pub mod redis_store;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// 清理信号量哈希 KEYS[1] 中已过期的持有者，并把仍有效的许可数累加到 `used`
///
/// 每个字段是一个持有者令牌，值为 `{permits}:{expires_at_ms}`，时间取存储端 TIME。
macro_rules! prune_permit_holders {
    () => {
        r#"
        redis.replicate_commands()
        local t = redis.call("TIME")
        local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
        local used = 0
        local holders = redis.call("HGETALL", KEYS[1])
        for i = 1, #holders, 2 do
            local permits, expires = string.match(holders[i + 1], "^(%d+):(%d+)$")
            if permits == nil or tonumber(expires) <= now then
                redis.call("HDEL", KEYS[1], holders[i])
            else
                used = used + tonumber(permits)
            end
        end
        "#
    };
}

/// 服务端原子脚本
///
/// 所有"比较后操作"都必须在存储端一步完成，不能拆成客户端的先查后改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicScript {
    /// KEYS[1] 的值等于 ARGV[1] 时删除，返回 1/0
    CompareAndDelete,
    /// KEYS[1] 的值等于 ARGV[1] 时设置 PEXPIRE ARGV[2]，返回 1/0
    CompareAndExpire,
    /// 清理过期持有者后，若已用许可加 ARGV[2] 不超过 ARGV[3]，
    /// 以令牌 ARGV[1] 登记 ARGV[2] 个许可，有效期 ARGV[4] 毫秒，返回 1/0
    AcquirePermits,
    /// 移除令牌 ARGV[1]，返回剩余已用许可数；令牌不存在或已过期时返回 -1
    ReleasePermits,
    /// 清理过期持有者，返回已用许可数
    CountPermits,
    /// KEYS[1] 加 ARGV[1]，键没有过期时间时设置 PEXPIRE ARGV[2]，返回新值
    IncrWithTtl,
    /// 任意 Lua 脚本，仅 Redis 后端支持
    Custom(String),
}

impl AtomicScript {
    /// Lua 源码
    pub fn source(&self) -> &str {
        match self {
            AtomicScript::CompareAndDelete => {
                r#"
                if redis.call("GET", KEYS[1]) == ARGV[1] then
                    return redis.call("DEL", KEYS[1])
                else
                    return 0
                end
                "#
            }
            AtomicScript::CompareAndExpire => {
                r#"
                if redis.call("GET", KEYS[1]) == ARGV[1] then
                    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
                else
                    return 0
                end
                "#
            }
            AtomicScript::AcquirePermits => concat!(
                prune_permit_holders!(),
                r#"
                local requested = tonumber(ARGV[2])
                if used + requested > tonumber(ARGV[3]) then
                    return 0
                end
                local ttl = tonumber(ARGV[4])
                redis.call("HSET", KEYS[1], ARGV[1], string.format("%d:%d", requested, now + ttl))
                if redis.call("PTTL", KEYS[1]) < ttl then
                    redis.call("PEXPIRE", KEYS[1], ttl)
                end
                return 1
                "#
            ),
            AtomicScript::ReleasePermits => concat!(
                prune_permit_holders!(),
                r#"
                local entry = redis.call("HGET", KEYS[1], ARGV[1])
                if not entry then
                    return -1
                end
                redis.call("HDEL", KEYS[1], ARGV[1])
                return used - tonumber(string.match(entry, "^(%d+):"))
                "#
            ),
            AtomicScript::CountPermits => concat!(prune_permit_holders!(), "return used\n"),
            AtomicScript::IncrWithTtl => {
                r#"
                local value = redis.call("INCRBY", KEYS[1], ARGV[1])
                if redis.call("PTTL", KEYS[1]) < 0 then
                    redis.call("PEXPIRE", KEYS[1], ARGV[2])
                end
                return value
                "#
            }
            AtomicScript::Custom(source) => source.as_str(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AtomicScript::CompareAndDelete => "compare_and_delete",
            AtomicScript::CompareAndExpire => "compare_and_expire",
            AtomicScript::AcquirePermits => "acquire_permits",
            AtomicScript::ReleasePermits => "release_permits",
            AtomicScript::CountPermits => "count_permits",
            AtomicScript::IncrWithTtl => "incr_with_ttl",
            AtomicScript::Custom(_) => "custom",
        }
    }
}

/// 脚本返回值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Nil,
    Int(i64),
    Text(String),
    Array(Vec<ScriptReply>),
}

impl ScriptReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptReply::Int(v) => Some(*v),
            ScriptReply::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl From<redis::Value> for ScriptReply {
    fn from(value: redis::Value) -> Self {
        match value {
            redis::Value::Nil => ScriptReply::Nil,
            redis::Value::Int(v) => ScriptReply::Int(v),
            redis::Value::BulkString(bytes) => {
                ScriptReply::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            redis::Value::SimpleString(s) => ScriptReply::Text(s),
            redis::Value::Okay => ScriptReply::Text("OK".to_string()),
            redis::Value::Array(items) => {
                ScriptReply::Array(items.into_iter().map(ScriptReply::from).collect())
            }
            other => ScriptReply::Text(format!("{:?}", other)),
        }
    }
}

/// 订阅目标
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// 精确频道
    Channel(String),
    /// glob 模式频道
    Pattern(String),
}

impl Subscription {
    pub fn name(&self) -> &str {
        match self {
            Subscription::Channel(name) | Subscription::Pattern(name) => name,
        }
    }
}

/// 从订阅中收到的原始消息
#[derive(Debug, Clone)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

pub type MessageStream = BoxStream<'static, StoreMessage>;

/// 远端键值存储接口
///
/// 所有方法都如实返回传输/后端错误，降级为安全默认值是
/// [`crate::store::StoreAdapter`] 的职责。TTL 单位为秒，锁相关为毫秒。
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn ping(&self) -> Result<()>;

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()>;

    /// SET key value NX PX ttl_ms
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// 删除多个键，返回实际删除的数量
    async fn del(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn mget_bytes(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn mset_bytes(&self, items: Vec<(String, Vec<u8>)>, ttl_secs: u64) -> Result<()>;

    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    /// 剩余存活时间（毫秒），键不存在或无过期时间时返回 None
    async fn pttl(&self, key: &str) -> Result<Option<u64>>;

    /// 按 glob 模式遍历所有匹配键
    async fn scan_match(&self, pattern: &str, count: usize) -> Result<Vec<String>>;

    async fn eval(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptReply>;

    /// 发布消息，返回收到消息的订阅者数量
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// 打开一个订阅，返回消息流；流被丢弃即取消订阅
    async fn listen(&self, subscription: &Subscription) -> Result<MessageStream>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
