//! CLI commands.

mod envs;
mod machines;
mod pool;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rigpool_clients::{HttpInventoryClient, HttpProvisioningClient, SshExec};
use rigpool_core::{
    EnvironmentManager, FeatureCatalog, MachineBackend, NodeLifecycleController, PoolAllocator,
    PoolConfig, PoolContext, ProvisionedBackend, RetrySearch, StaticBackend,
};
use rigpool_model::Credentials;
use tracing::debug;

use crate::config::{Backend, Config};

/// rigctl - allocate, prepare and reclaim machines from shared test pools.
#[derive(Debug, Parser)]
#[command(name = "rigctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Take machines from the pool for an environment.
    Allocate(pool::AllocateArgs),

    /// Configure network interfaces on base-installed pool machines.
    BringUp(pool::BringUpArgs),

    /// Grow the elastic pool to its target size.
    TopUp(pool::TopUpArgs),

    /// Create or refresh an environment.
    PrepareEnv(envs::PrepareArgs),

    /// Delete an environment.
    DeleteEnv(envs::NameArgs),

    /// Erase in-use members of an environment and free the rest.
    CleanupEnv(envs::NameArgs),

    /// List the machines in an environment.
    Members(envs::NameArgs),

    /// Point an environment at its directory server.
    LinkLdap(envs::LinkLdapArgs),

    /// Reboot, delete and release a machine.
    Erase(machines::EraseArgs),

    /// Reboot and release active models stuck in broker failure.
    RemoveStuck(machines::RemoveStuckArgs),
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self, config: Config) -> Result<()> {
        let ctx = CommandContext::new(config)?;

        match self.command {
            Commands::Allocate(args) => pool::allocate(&ctx, args).await,
            Commands::BringUp(args) => pool::bring_up(&ctx, args).await,
            Commands::TopUp(args) => pool::top_up(&ctx, args).await,
            Commands::PrepareEnv(args) => envs::prepare(&ctx, args).await,
            Commands::DeleteEnv(args) => envs::delete(&ctx, args).await,
            Commands::CleanupEnv(args) => envs::cleanup(&ctx, args).await,
            Commands::Members(args) => envs::members(&ctx, args).await,
            Commands::LinkLdap(args) => envs::link_ldap(&ctx, args).await,
            Commands::Erase(args) => machines::erase(&ctx, args).await,
            Commands::RemoveStuck(args) => machines::remove_stuck(&ctx, args).await,
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub pool: PoolContext,
    search: RetrySearch,
    backend: Arc<dyn MachineBackend>,
}

impl CommandContext {
    fn new(config: Config) -> Result<Self> {
        let inventory = HttpInventoryClient::new(config.inventory_url.clone())
            .context("failed to build inventory client")?;
        let provisioner = HttpProvisioningClient::new(config.provisioner_url.clone())
            .context("failed to build provisioner client")?;
        let pool = PoolContext::new(
            Arc::new(inventory),
            Arc::new(provisioner),
            Arc::new(SshExec::default()),
        );

        let backend: Arc<dyn MachineBackend> = match &config.backend {
            Backend::Provisioned => {
                Arc::new(ProvisionedBackend::new(Arc::clone(&pool.provisioner)))
            }
            Backend::Static { password } => {
                Arc::new(StaticBackend::new(Credentials::new(password.clone())))
            }
        };
        debug!(backend = backend.name(), "Machine backend selected");

        let search = RetrySearch::new(Arc::clone(&pool.inventory), config.search_policy());

        Ok(Self {
            config,
            pool,
            search,
            backend,
        })
    }

    pub fn allocator(&self) -> PoolAllocator {
        PoolAllocator::new(&self.pool, self.search.clone(), PoolConfig::default())
    }

    pub fn lifecycle(&self) -> NodeLifecycleController {
        NodeLifecycleController::new(
            self.pool.clone(),
            Arc::clone(&self.backend),
            self.config.lifecycle_config(),
        )
    }

    pub fn environments(&self) -> Result<EnvironmentManager> {
        let catalog = match &self.config.features_file {
            Some(path) => FeatureCatalog::load(path)
                .with_context(|| format!("failed to load feature catalog {}", path.display()))?,
            None => FeatureCatalog::default(),
        };
        Ok(EnvironmentManager::new(
            Arc::clone(&self.pool.inventory),
            self.search.clone(),
            catalog,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_features_keep_order() {
        let cli = Cli::try_parse_from([
            "rigctl",
            "prepare-env",
            "--name",
            "ci",
            "--os",
            "centos",
            "--branch",
            "grizzly",
            "--feature",
            "ha",
            "--feature",
            "ldap",
        ])
        .unwrap();

        match cli.command {
            Commands::PrepareEnv(args) => assert_eq!(args.features, vec!["ha", "ldap"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_allocate_requires_count() {
        assert!(Cli::try_parse_from(["rigctl", "allocate", "--os", "centos", "--env", "a"]).is_err());
    }
}
