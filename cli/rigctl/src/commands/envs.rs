//! Environment commands.

use anyhow::Result;
use clap::Args;
use rigpool_model::MachineState;
use serde_json::json;

use crate::output::print_json;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct PrepareArgs {
    /// Base name of the environment.
    #[arg(long)]
    name: String,

    #[arg(long)]
    os: String,

    /// Branch tag; becomes `package_component`.
    #[arg(long)]
    branch: String,

    /// Feature tag (repeatable; later features override earlier ones).
    #[arg(long = "feature")]
    pub(super) features: Vec<String>,
}

#[derive(Debug, Args)]
pub struct NameArgs {
    /// Environment name.
    name: String,
}

#[derive(Debug, Args)]
pub struct LinkLdapArgs {
    /// Environment name.
    name: String,

    /// Bind password written alongside the server URL.
    #[arg(long, env = "RIGPOOL_LDAP_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

pub async fn prepare(ctx: &CommandContext, args: PrepareArgs) -> Result<()> {
    let environments = ctx.environments()?;
    let name = environments
        .prepare(&args.name, &args.os, &args.branch, &args.features)
        .await?;
    let record = environments.get(&name).await?;
    print_json(&record)
}

pub async fn delete(ctx: &CommandContext, args: NameArgs) -> Result<()> {
    ctx.environments()?.delete(&args.name).await?;
    print_json(&json!({ "deleted": args.name }))
}

pub async fn cleanup(ctx: &CommandContext, args: NameArgs) -> Result<()> {
    let report = ctx
        .environments()?
        .cleanup(&args.name, &ctx.lifecycle())
        .await?;
    print_json(&report)
}

pub async fn members(ctx: &CommandContext, args: NameArgs) -> Result<()> {
    let members = ctx.environments()?.members(&args.name).await?;
    let rows: Vec<_> = members
        .iter()
        .map(|m| {
            json!({
                "name": m.name,
                "address": m.address,
                "state": MachineState::of(m).as_str(),
                "run_list": m.run_list,
            })
        })
        .collect();
    print_json(&rows)
}

pub async fn link_ldap(ctx: &CommandContext, args: LinkLdapArgs) -> Result<()> {
    let url = ctx
        .environments()?
        .link_directory_server(&args.name, args.password.as_deref())
        .await?;
    print_json(&json!({ "environment": args.name, "ldap_url": url }))
}
