//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了事件发布命令的实现。

use crate::cli::PublishArgs;
use crate::coordinator::Coordinator;
use crate::events::EventChannel;
use anyhow::{bail, Context, Result};

pub async fn execute(coordinator: &Coordinator, args: &PublishArgs) -> Result<()> {
    if !coordinator.events().is_enabled() {
        bail!("The event bus is disabled in the configuration");
    }

    let channel: EventChannel = args
        .channel
        .parse()
        .with_context(|| format!("Unknown channel '{}'", args.channel))?;
    let data: serde_json::Value =
        serde_json::from_str(&args.data).context("Payload is not valid JSON")?;

    let receivers = coordinator
        .events()
        .publish(channel, &args.event_type, data)
        .await;
    println!(
        "Published '{}' on {} ({} receiver(s))",
        args.event_type, channel, receivers
    );
    Ok(())
}
