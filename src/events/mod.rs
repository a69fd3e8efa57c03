//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于存储发布/订阅的事件总线。
//!
//! 投递语义为"至多一次、尽力而为"：发布失败被记录后丢弃，没有重试或重放。
//! 事件总线只是加速失效传播的手段，条目的TTL才是最终保障。

pub mod channel;
pub mod handler;

pub use channel::EventChannel;
pub use handler::{handler_fn, EventHandler, FnHandler};

use crate::backend::{MessageStream, Subscription};
use crate::error::{CoordError, Result};
use crate::metrics::Metrics;
use crate::store::StoreAdapter;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const RECONNECT_MIN_DELAY: Duration = Duration::from_millis(100);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// 总线上传递的事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub channel: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// 发布方实例标识
    pub source: String,
}

impl Event {
    /// 把 `data` 解析为具体类型
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| CoordError::Serialization(e.to_string()))
    }
}

/// 处理器注册标识，用于单独注销某个处理器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    handlers: Vec<(HandlerId, Arc<dyn EventHandler>)>,
    listener: JoinHandle<()>,
}

struct BusInner {
    store: StoreAdapter,
    source: String,
    enabled: bool,
    next_id: AtomicU64,
    registrations: Arc<DashMap<Subscription, Registration>>,
    metrics: Arc<Metrics>,
}

/// 事件总线
///
/// 每个频道或模式只持有一条订阅连接，同一订阅下的多个处理器共享它。
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("source", &self.inner.source)
            .field("enabled", &self.inner.enabled)
            .field("subscriptions", &self.inner.registrations.len())
            .finish()
    }
}

impl EventBus {
    /// 创建事件总线
    ///
    /// # 参数
    ///
    /// * `store` - 存储适配器
    /// * `source` - 本实例标识，为 None 时生成随机 UUID
    pub fn new(store: StoreAdapter, source: Option<String>) -> Self {
        Self::build(store, source, true)
    }

    /// 创建一个不做任何事的总线，发布与订阅都直接返回
    pub fn disabled(store: StoreAdapter, source: Option<String>) -> Self {
        Self::build(store, source, false)
    }

    fn build(store: StoreAdapter, source: Option<String>, enabled: bool) -> Self {
        let metrics = store.metrics().clone();
        Self {
            inner: Arc::new(BusInner {
                store,
                source: source.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                enabled,
                next_id: AtomicU64::new(1),
                registrations: Arc::new(DashMap::new()),
                metrics,
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// 发布事件，返回收到消息的订阅者数量
    ///
    /// 自动写入 `timestamp` 与 `source`。序列化或传输失败时记录日志并返回 0。
    #[instrument(skip(self, data), level = "debug", fields(channel = %channel))]
    pub async fn publish<D: Serialize>(
        &self,
        channel: EventChannel,
        event_type: &str,
        data: D,
    ) -> u64 {
        if !self.inner.enabled {
            return 0;
        }
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("Dropping {} event '{}': {}", channel, event_type, e);
                return 0;
            }
        };
        let event = Event {
            channel: channel.as_str().to_string(),
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
            source: self.inner.source.clone(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping {} event '{}': {}", channel, event_type, e);
                return 0;
            }
        };
        let receivers = self.inner.store.publish(channel.as_str(), &payload).await;
        Metrics::incr(&self.inner.metrics.events_published);
        debug!("Published {} '{}' to {} receivers", channel, event_type, receivers);
        receivers
    }

    /// 订阅一个频道
    ///
    /// 返回的 [`HandlerId`] 可用于 [`EventBus::unsubscribe`]。
    /// 存储不可用时返回 None。
    pub async fn subscribe(
        &self,
        channel: EventChannel,
        handler: Arc<dyn EventHandler>,
    ) -> Option<HandlerId> {
        self.register(Subscription::Channel(channel.as_str().to_string()), handler)
            .await
    }

    /// 按 glob 模式订阅，例如 `product.*`
    pub async fn psubscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Option<HandlerId> {
        self.register(Subscription::Pattern(pattern.to_string()), handler)
            .await
    }

    /// 注销频道上的处理器
    ///
    /// `handler` 为 None 时移除整个订阅。返回是否有东西被移除。
    pub fn unsubscribe(&self, channel: EventChannel, handler: Option<HandlerId>) -> bool {
        self.deregister(&Subscription::Channel(channel.as_str().to_string()), handler)
    }

    pub fn punsubscribe(&self, pattern: &str, handler: Option<HandlerId>) -> bool {
        self.deregister(&Subscription::Pattern(pattern.to_string()), handler)
    }

    /// 某个频道上已注册的处理器数量
    pub fn handler_count(&self, channel: EventChannel) -> usize {
        self.inner
            .registrations
            .get(&Subscription::Channel(channel.as_str().to_string()))
            .map(|r| r.handlers.len())
            .unwrap_or(0)
    }

    /// 停止所有订阅
    pub fn shutdown(&self) {
        let subs: Vec<Subscription> = self
            .inner
            .registrations
            .iter()
            .map(|r| r.key().clone())
            .collect();
        for sub in subs {
            self.deregister(&sub, None);
        }
        debug!("Event bus '{}' shut down", self.inner.source);
    }

    #[instrument(skip(self, handler), level = "debug")]
    async fn register(
        &self,
        subscription: Subscription,
        handler: Arc<dyn EventHandler>,
    ) -> Option<HandlerId> {
        if !self.inner.enabled {
            return None;
        }
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        if let Some(mut existing) = self.inner.registrations.get_mut(&subscription) {
            existing.handlers.push((id, handler));
            return Some(id);
        }

        let stream = self.inner.store.listen(&subscription).await?;

        match self.inner.registrations.entry(subscription.clone()) {
            Entry::Occupied(mut occupied) => {
                // 并发注册已经建立了监听，丢弃本次打开的流
                occupied.get_mut().handlers.push((id, handler));
            }
            Entry::Vacant(vacant) => {
                let listener = tokio::spawn(listen_loop(
                    subscription.clone(),
                    stream,
                    self.inner.store.clone(),
                    self.inner.registrations.clone(),
                    self.inner.metrics.clone(),
                ));
                vacant.insert(Registration {
                    handlers: vec![(id, handler)],
                    listener,
                });
            }
        }
        debug!("Registered handler {:?} on {:?}", id, subscription);
        Some(id)
    }

    fn deregister(&self, subscription: &Subscription, handler: Option<HandlerId>) -> bool {
        let registrations = &self.inner.registrations;
        let removed = match handler {
            Some(id) => {
                let Some(mut reg) = registrations.get_mut(subscription) else {
                    return false;
                };
                let before = reg.handlers.len();
                reg.handlers.retain(|(h, _)| *h != id);
                before != reg.handlers.len()
            }
            None => true,
        };

        let empty = registrations
            .get(subscription)
            .map(|r| r.handlers.is_empty())
            .unwrap_or(false);
        if handler.is_none() || empty {
            return match registrations.remove(subscription) {
                Some((_, reg)) => {
                    reg.listener.abort();
                    debug!("Closed subscription {:?}", subscription);
                    true
                }
                None => false,
            };
        }
        removed
    }
}

/// 订阅的监听任务
///
/// 流结束（连接断开）后只要订阅仍在注册表中就按指数退避重新打开，
/// 已注册的处理器无需重新订阅。订阅被移除时任务退出。
async fn listen_loop(
    subscription: Subscription,
    mut stream: MessageStream,
    store: StoreAdapter,
    registrations: Arc<DashMap<Subscription, Registration>>,
    metrics: Arc<Metrics>,
) {
    let mut delay = RECONNECT_MIN_DELAY;
    loop {
        while let Some(message) = stream.next().await {
            delay = RECONNECT_MIN_DELAY;
            let event: Event = match serde_json::from_str(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    debug!("Ignoring malformed event on {}: {}", message.channel, e);
                    continue;
                }
            };
            let handlers: Vec<Arc<dyn EventHandler>> = match registrations.get(&subscription) {
                Some(reg) => reg.handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            };
            deliver(Arc::new(event), handlers, &metrics).await;
        }

        warn!("Subscription {:?} stream ended, reopening", subscription);
        stream = loop {
            tokio::time::sleep(delay).await;
            if !registrations.contains_key(&subscription) {
                debug!("Subscription {:?} removed while reconnecting", subscription);
                return;
            }
            match store.listen(&subscription).await {
                Some(stream) => break stream,
                None => {
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    warn!(
                        "Reopening {:?} failed, next attempt in {}ms",
                        subscription,
                        delay.as_millis()
                    );
                }
            }
        };
        info!("Subscription {:?} reopened", subscription);
    }
}

async fn deliver(event: Arc<Event>, handlers: Vec<Arc<dyn EventHandler>>, metrics: &Metrics) {
    let tasks: Vec<JoinHandle<Result<()>>> = handlers
        .into_iter()
        .map(|handler| {
            let event = event.clone();
            tokio::spawn(async move { handler.handle(event).await })
        })
        .collect();

    for outcome in futures::future::join_all(tasks).await {
        match outcome {
            Ok(Ok(())) => Metrics::incr(&metrics.events_delivered),
            Ok(Err(e)) => {
                Metrics::incr(&metrics.handler_failures);
                error!("Handler for {} '{}' failed: {}", event.channel, event.event_type, e);
            }
            Err(e) => {
                Metrics::incr(&metrics.handler_failures);
                error!("Handler for {} '{}' panicked: {}", event.channel, event.event_type, e);
            }
        }
    }
}
