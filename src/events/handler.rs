//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 事件处理器接口。

use super::Event;
use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// 事件处理器
///
/// 每次事件到达时在独立任务中调用，返回错误或 panic 只影响本处理器。
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> Result<()>;
}

/// 以闭包实现的处理器
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        (self.0)(event).await
    }
}

/// 把异步闭包包装成 `Arc<dyn EventHandler>`
///
/// ```ignore
/// let handler = handler_fn(|event| async move {
///     tracing::info!("got {}", event.event_type);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
