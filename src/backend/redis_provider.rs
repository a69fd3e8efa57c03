//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了Redis连接提供者接口和默认实现。

use crate::{
    config::StoreConfig,
    error::{CoordError, Result},
    utils::redact_connection_string,
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use secrecy::ExposeSecret;
use tokio::time::{timeout, Duration};

/// Redis 连接提供者
///
/// 连接的建立和存储命令分开，测试可以替换为不依赖真实 Redis 的实现
#[async_trait]
pub trait RedisProvider: Send + Sync {
    async fn get_standalone_client(&self, config: &StoreConfig)
        -> Result<(Client, ConnectionManager)>;
    async fn get_sentinel_client(&self, config: &StoreConfig)
        -> Result<(Client, ConnectionManager)>;
}

pub struct DefaultRedisProvider;

impl DefaultRedisProvider {
    fn standalone_url(config: &StoreConfig) -> String {
        let raw = config.connection_string.expose_secret();
        if config.enable_tls && !raw.starts_with("rediss://") {
            raw.replace("redis://", "rediss://")
        } else {
            raw.to_string()
        }
    }

    async fn connect_manager(client: &Client, config: &StoreConfig, target: &str) -> Result<ConnectionManager> {
        match timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        {
            Ok(res) => Ok(res?),
            Err(_) => Err(CoordError::Timeout(format!(
                "Connection timed out after {}ms. Target: {}",
                config.connection_timeout_ms,
                redact_connection_string(target)
            ))),
        }
    }
}

#[async_trait]
impl RedisProvider for DefaultRedisProvider {
    async fn get_standalone_client(
        &self,
        config: &StoreConfig,
    ) -> Result<(Client, ConnectionManager)> {
        let url = Self::standalone_url(config);
        tracing::info!("Connecting to Redis at {}", redact_connection_string(&url));
        let client = Client::open(url.as_str())?;
        let manager = Self::connect_manager(&client, config, &url).await?;
        Ok((client, manager))
    }

    async fn get_sentinel_client(
        &self,
        config: &StoreConfig,
    ) -> Result<(Client, ConnectionManager)> {
        let sentinel_config = config.sentinel.as_ref().ok_or_else(|| {
            CoordError::Configuration("Sentinel configuration is missing".to_string())
        })?;

        // redis+sentinel://[:password@]host:port[,host:port]/master_name
        let mut url = "redis+sentinel://".to_string();
        if let Some(password) = &config.password {
            url.push_str(&format!(":{}@", password.expose_secret()));
        }

        let nodes: Vec<String> = sentinel_config
            .nodes
            .iter()
            .map(|n| {
                n.trim_start_matches("redis://")
                    .trim_start_matches("redis+sentinel://")
                    .to_string()
            })
            .collect();

        if nodes.is_empty() {
            return Err(CoordError::Configuration(
                "No sentinel nodes provided".to_string(),
            ));
        }

        url.push_str(&nodes.join(","));
        url.push('/');
        url.push_str(&sentinel_config.master_name);

        tracing::info!(
            "Connecting to Redis through sentinels {}",
            redact_connection_string(&url)
        );
        let client = Client::open(url.as_str())?;
        let manager = Self::connect_manager(&client, config, &url).await?;
        Ok((client, manager))
    }
}
