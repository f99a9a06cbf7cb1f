//! Machine commands.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use crate::output::print_json;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct EraseArgs {
    /// Machine name.
    name: String,
}

#[derive(Debug, Args)]
pub struct RemoveStuckArgs {
    /// Provisioning policy to scan.
    #[arg(long)]
    policy: String,
}

pub async fn erase(ctx: &CommandContext, args: EraseArgs) -> Result<()> {
    let machine = ctx
        .pool
        .inventory
        .get_machine(&args.name)
        .await?
        .with_context(|| format!("machine not found: {}", args.name))?;

    let state = ctx.lifecycle().erase(&machine).await?;
    print_json(&json!({ "machine": machine.name, "state": state.as_str() }))
}

pub async fn remove_stuck(ctx: &CommandContext, args: RemoveStuckArgs) -> Result<()> {
    let report = ctx.lifecycle().remove_stuck_models(&args.policy).await?;
    print_json(&report)
}
