//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了状态查询命令的实现。

use crate::cli::StatusArgs;
use crate::coordinator::Coordinator;
use crate::utils::redact_connection_string;
use anyhow::Result;
use secrecy::ExposeSecret;

pub async fn execute(coordinator: &Coordinator, args: &StatusArgs) -> Result<()> {
    let config = coordinator.config();
    let healthy = coordinator.store().is_healthy().await;

    if args.prometheus {
        println!(
            "{}",
            coordinator.metrics().render_prometheus(coordinator.events().source())
        );
        return Ok(());
    }

    println!("=== Coordinator Status ===\n");
    println!("Store mode:  {:?}", config.store.mode);
    println!(
        "Connection:  {}",
        redact_connection_string(config.store.connection_string.expose_secret())
    );
    println!(
        "Health:      {}",
        if healthy { "✅ HEALTHY" } else { "❌ UNREACHABLE" }
    );
    println!("Instance:    {}", coordinator.events().source());
    println!(
        "Events:      {}",
        if coordinator.events().is_enabled() { "enabled" } else { "disabled" }
    );

    if args.verbose && healthy {
        let locks = coordinator
            .store()
            .scan(&format!("{}:*", config.lock.key_prefix))
            .await;
        let semaphores = coordinator.store().scan("semaphore:*").await;
        println!("\nLocks held:  {}", locks.len());
        println!("Semaphores:  {}", semaphores.len());
        for key in locks.iter().take(20) {
            let holder = coordinator.store().get_bytes(key).await;
            let ttl = coordinator.store().pttl(key).await;
            println!(
                "  - {} (holder={}, ttl={})",
                key,
                holder
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                    .unwrap_or_else(|| "-".to_string()),
                ttl.map(|ms| format!("{}ms", ms))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    Ok(())
}
