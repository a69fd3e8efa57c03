//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存失效命令的实现。

use crate::coordinator::Coordinator;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
pub struct InvalidateArgs {
    #[command(subcommand)]
    pub target: InvalidateTarget,
}

#[derive(Subcommand, Debug)]
pub enum InvalidateTarget {
    #[command(about = "Delete every key matching a glob pattern")]
    Pattern { pattern: String },

    #[command(about = "Delete every key registered under a tag")]
    Tag { tag: String },

    #[command(about = "Invalidate a product and its derived entries")]
    Product { id: String },

    #[command(about = "Invalidate a user and its derived entries")]
    User { id: String },

    #[command(about = "Invalidate a shop and its product listings")]
    Shop { id: String },

    #[command(about = "Invalidate all cached search results")]
    Search,

    #[command(about = "Invalidate recommendations for one user or all users")]
    Recommendations {
        #[arg(long)]
        user: Option<String>,
    },
}

pub async fn execute(coordinator: &Coordinator, args: &InvalidateArgs) -> Result<()> {
    let cache = coordinator.cache();
    let (label, deleted) = match &args.target {
        InvalidateTarget::Pattern { pattern } => {
            (format!("pattern '{}'", pattern), cache.del_pattern(pattern).await)
        }
        InvalidateTarget::Tag { tag } => (format!("tag '{}'", tag), cache.invalidate_tag(tag).await),
        InvalidateTarget::Product { id } => {
            (format!("product {}", id), cache.invalidate_product(id).await)
        }
        InvalidateTarget::User { id } => (format!("user {}", id), cache.invalidate_user(id).await),
        InvalidateTarget::Shop { id } => (format!("shop {}", id), cache.invalidate_shop(id).await),
        InvalidateTarget::Search => ("search results".to_string(), cache.invalidate_search().await),
        InvalidateTarget::Recommendations { user } => {
            let label = match user {
                Some(user) => format!("recommendations for user {}", user),
                None => "all recommendations".to_string(),
            };
            (label, cache.invalidate_recommendations(user.as_deref()).await)
        }
    };

    println!("Invalidated {}: {} key(s) deleted", label, deleted);
    Ok(())
}
