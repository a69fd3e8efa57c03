//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了日志与链路追踪的初始化。

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// 默认过滤规则，`RUST_LOG` 优先
pub const DEFAULT_FILTER: &str = "info,oxcoord=debug";

/// 初始化 tracing 与 OpenTelemetry
///
/// 应在进程启动时调用一次。组合了 `EnvFilter`、控制台输出层和
/// OpenTelemetry 层；全局 subscriber 已存在时返回 false。
///
/// # 参数
///
/// * `service_name` - 服务名称，作为 tracer 名
/// * `filter` - 过滤规则，None 时读取 `RUST_LOG`，再退回 [`DEFAULT_FILTER`]
pub fn init_tracing(service_name: &str, filter: Option<&str>) -> bool {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    // 未配置导出器时 provider 只生成 span 上下文
    let provider = SdkTracerProvider::builder().build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(service_name.to_string());

    let subscriber = Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(tracing_opentelemetry::layer().with_tracer(tracer));

    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// 刷新并关闭全局 tracer provider
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
