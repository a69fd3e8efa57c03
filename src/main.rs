//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块是协调器管理命令的入口点。

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    oxcoord::telemetry::init_tracing("oxcoord-cli", Some("warn"));
    let outcome = oxcoord::cli::run().await;
    oxcoord::telemetry::shutdown_tracing();
    outcome
}
