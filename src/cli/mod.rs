//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use crate::config::Config;
use crate::coordinator::Coordinator;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "oxcoord")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Path to the TOML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "status", about = "Check store connectivity and show counters")]
    Status(StatusArgs),

    #[command(name = "unlock", about = "Force release a distributed lock")]
    Unlock(UnlockArgs),

    #[command(name = "invalidate", about = "Invalidate cache entries")]
    Invalidate(InvalidateArgs),

    #[command(name = "publish", about = "Publish an event on a channel")]
    Publish(PublishArgs),

    #[command(name = "scan", about = "List keys matching a glob pattern")]
    Scan(ScanArgs),
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[arg(short, long, help = "Show lock and key counts")]
    pub verbose: bool,

    #[arg(short, long, help = "Output counters in Prometheus format")]
    pub prometheus: bool,
}

#[derive(Parser, Debug)]
pub struct UnlockArgs {
    #[arg(help = "Resource name (without the lock prefix)")]
    pub resource: String,
}

#[derive(Parser, Debug)]
pub struct ScanArgs {
    #[arg(help = "Glob pattern, e.g. 'product:*'")]
    pub pattern: String,

    #[arg(short, long, default_value_t = 100, help = "Maximum number of keys to print")]
    pub limit: usize,
}

#[derive(Parser, Debug)]
pub struct PublishArgs {
    #[arg(help = "Channel name, e.g. 'product.updated'")]
    pub channel: String,

    #[arg(help = "Event type")]
    pub event_type: String,

    #[arg(default_value = "{}", help = "JSON payload")]
    pub data: String,
}

mod admin;
mod invalidate;
mod publish;
mod status;

pub use invalidate::{InvalidateArgs, InvalidateTarget};

/// 加载配置并建立协调器
async fn connect(path: Option<&PathBuf>) -> Result<Coordinator> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    Coordinator::connect(config)
        .await
        .context("Failed to connect to the store")
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let coordinator = connect(cli.config.as_ref()).await?;

    let outcome = match &cli.command {
        Commands::Status(args) => status::execute(&coordinator, args).await,
        Commands::Unlock(args) => admin::execute_unlock(&coordinator, args).await,
        Commands::Invalidate(args) => invalidate::execute(&coordinator, args).await,
        Commands::Publish(args) => publish::execute(&coordinator, args).await,
        Commands::Scan(args) => admin::execute_scan(&coordinator, args).await,
    };

    coordinator.graceful_shutdown().await;
    outcome
}
