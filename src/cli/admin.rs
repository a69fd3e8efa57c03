//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了管理员操作命令的实现。

use crate::cli::{ScanArgs, UnlockArgs};
use crate::coordinator::Coordinator;
use anyhow::{bail, Result};

/// 强制释放锁，不校验持有者
pub async fn execute_unlock(coordinator: &Coordinator, args: &UnlockArgs) -> Result<()> {
    let locks = coordinator.locks();
    let holder = locks.holder(&args.resource).await;

    if !locks.force_release(&args.resource).await {
        bail!("Lock '{}' is not held", args.resource);
    }

    println!(
        "Released lock '{}' (holder was {})",
        args.resource,
        holder.as_deref().unwrap_or("unknown")
    );
    Ok(())
}

pub async fn execute_scan(coordinator: &Coordinator, args: &ScanArgs) -> Result<()> {
    let mut keys = coordinator.store().scan(&args.pattern).await;
    keys.sort();

    for key in keys.iter().take(args.limit) {
        println!("{}", key);
    }
    if keys.len() > args.limit {
        println!("... {} more", keys.len() - args.limit);
    }
    println!("\n{} key(s) match '{}'", keys.len(), args.pattern);
    Ok(())
}
