//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的错误类型和处理机制。

use thiserror::Error;

/// 协调层错误类型枚举
///
/// 存储不可用类错误在适配层被吞掉并降级为安全默认值，
/// 只有调用方的编程错误（例如信号量超额申请）会真正返回给调用方。
#[derive(Error, Debug)]
pub enum CoordError {
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 存储后端操作失败
    #[error("Store operation failed: {0}")]
    Store(String),

    /// Redis错误
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 输入不合法
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 操作不支持
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// 信号量申请数超过上限（调用方编程错误）
    #[error("Requested {requested} permits but semaphore '{resource}' allows at most {max}")]
    PermitsExceeded {
        resource: String,
        requested: u32,
        max: u32,
    },

    /// 锁操作错误
    #[error("Lock error: {0}")]
    Lock(String),

    /// 批量加载失败
    #[error("Batch load failed: {0}")]
    BatchLoad(String),

    /// 事件处理器错误
    #[error("Event handler error: {0}")]
    Handler(String),

    /// IO错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 关闭错误
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// 协调层操作结果类型别名
pub type Result<T> = std::result::Result<T, CoordError>;
