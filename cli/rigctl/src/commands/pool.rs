//! Pool commands.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::output::print_json;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct AllocateArgs {
    /// OS tag of the pool (e.g. centos, precise).
    #[arg(long)]
    os: String,

    /// Target environment.
    #[arg(long)]
    env: String,

    /// Number of machines.
    #[arg(long)]
    count: usize,
}

#[derive(Debug, Args)]
pub struct BringUpArgs {
    #[arg(long)]
    os: String,
}

#[derive(Debug, Args)]
pub struct TopUpArgs {
    #[arg(long)]
    os: String,

    /// Cluster size the pool should be able to serve.
    #[arg(long)]
    count: usize,

    /// Image tag for new instances.
    #[arg(long)]
    image: String,
}

pub async fn allocate(ctx: &CommandContext, args: AllocateArgs) -> Result<()> {
    let machines = ctx
        .allocator()
        .allocate(&args.os, &args.env, args.count)
        .await?;
    print_json(&json!({ "environment": args.env, "machines": machines }))
}

pub async fn bring_up(ctx: &CommandContext, args: BringUpArgs) -> Result<()> {
    let report = ctx
        .allocator()
        .interface_bring_up(&args.os, &ctx.lifecycle())
        .await?;
    print_json(&report)
}

pub async fn top_up(ctx: &CommandContext, args: TopUpArgs) -> Result<()> {
    let report = ctx
        .allocator()
        .top_up(&args.os, args.count, &args.image)
        .await?;
    print_json(&report)
}
