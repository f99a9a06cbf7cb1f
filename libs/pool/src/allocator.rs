//! Pool allocation.
//!
//! Machines are taken from the pool in query-result order. A machine is
//! eligible for an environment when it is network-configured and either
//! free (default environment) or already a member of that environment.
//!
//! Allocation is all-or-nothing: candidates are collected before any
//! record is touched, so a request that cannot be satisfied leaves every
//! machine where it was. If a save fails partway, machines already moved
//! are put back on a best-effort basis.

use std::collections::HashSet;
use std::sync::Arc;

use rigpool_clients::{InstanceRequest, InventoryClient, ProvisioningClient};
use rigpool_model::{
    cloud_pool_machine_name, cloud_pool_name_pattern, Field, MachineRecord, MachineState,
    ProvisioningHandle, Query, NETWORK_INTERFACES_ROLE,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};
use crate::lifecycle::{CommandReport, NodeLifecycleController};
use crate::search::{RetrySearch, SearchOutcome};

/// Default lower bound for pool top-up.
pub const DEFAULT_MIN_POOL_SIZE: usize = 10;

/// Convergence runs performed during network bring-up.
pub const BRING_UP_CONVERGE_RUNS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Top-up never targets fewer machines than this.
    pub min_pool_size: usize,

    pub bring_up_runs: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            bring_up_runs: BRING_UP_CONVERGE_RUNS,
        }
    }
}

/// Per-machine bring-up results. One failing machine never aborts the
/// batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BringUpReport {
    pub os: String,
    pub machines: Vec<BringUpResult>,
}

impl BringUpReport {
    pub fn all_succeeded(&self) -> bool {
        self.machines.iter().all(|m| m.success)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BringUpResult {
    pub machine: String,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub converge: Option<CommandReport>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TopUpReport {
    pub os: String,
    pub existing: usize,
    pub target: usize,
    pub created: Vec<CreatedInstance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedInstance {
    pub name: String,
    pub handle: ProvisioningHandle,
}

pub struct PoolAllocator {
    inventory: Arc<dyn InventoryClient>,
    provisioner: Arc<dyn ProvisioningClient>,
    search: RetrySearch,
    config: PoolConfig,
}

impl PoolAllocator {
    pub fn new(ctx: &PoolContext, search: RetrySearch, config: PoolConfig) -> Self {
        Self {
            inventory: Arc::clone(&ctx.inventory),
            provisioner: Arc::clone(&ctx.provisioner),
            search,
            config,
        }
    }

    async fn pool_members(&self, query: &Query) -> PoolResult<Vec<MachineRecord>> {
        Ok(match self.search.outcome(query).await? {
            SearchOutcome::Found(records) => records,
            SearchOutcome::Exhausted { attempts } => {
                debug!(query = %query, attempts, "Pool search exhausted");
                Vec::new()
            }
        })
    }

    /// Take `count` machines of `os` for `environment` and return their names.
    ///
    /// Fails with `InsufficientCapacity` (and changes nothing) if fewer than
    /// `count` machines are eligible.
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        os: &str,
        environment: &str,
        count: usize,
    ) -> PoolResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.pool_members(&Query::pool(os)).await?;

        let mut seen = HashSet::new();
        let eligible: Vec<MachineRecord> = candidates
            .into_iter()
            .filter(|m| seen.insert(m.name.clone()))
            .filter(|m| is_eligible(m, environment))
            .collect();

        if eligible.len() < count {
            warn!(
                requested = count,
                available = eligible.len(),
                "Not enough machines available"
            );
            return Err(PoolError::InsufficientCapacity {
                requested: count,
                available: eligible.len(),
            });
        }

        let mut taken = Vec::with_capacity(count);
        let mut reassigned: Vec<(MachineRecord, String)> = Vec::new();
        for mut machine in eligible.into_iter().take(count) {
            if machine.environment != environment {
                let previous = std::mem::replace(&mut machine.environment, environment.to_string());
                if let Err(e) = self.inventory.save_machine(&machine).await {
                    warn!(
                        machine = %machine.name,
                        error = %e,
                        taken = ?taken,
                        "Allocation failed mid-pass, restoring reassigned machines"
                    );
                    self.restore(reassigned).await;
                    return Err(e.into());
                }
                reassigned.push((machine.clone(), previous));
            }
            info!(machine = %machine.name, environment = %environment, "Taking machine");
            taken.push(machine.name);
        }

        Ok(taken)
    }

    /// Best-effort undo of reassignments made before a failed save.
    async fn restore(&self, reassigned: Vec<(MachineRecord, String)>) {
        for (mut machine, previous) in reassigned {
            machine.environment = previous;
            match self.inventory.save_machine(&machine).await {
                Ok(()) => {
                    debug!(
                        machine = %machine.name,
                        environment = %machine.environment,
                        "Restored machine"
                    );
                }
                Err(e) => warn!(
                    machine = %machine.name,
                    environment = %machine.environment,
                    error = %e,
                    "Could not restore machine; it stays reassigned"
                ),
            }
        }
    }

    /// Move every pool machine still on the base install onto the network
    /// interfaces role and converge it.
    #[instrument(skip(self, lifecycle))]
    pub async fn interface_bring_up(
        &self,
        os: &str,
        lifecycle: &NodeLifecycleController,
    ) -> PoolResult<BringUpReport> {
        let mut report = BringUpReport {
            os: os.to_string(),
            machines: Vec::new(),
        };

        let pending = self
            .pool_members(&Query::pool(os))
            .await?
            .into_iter()
            .filter(MachineRecord::has_base_install);

        for mut machine in pending {
            machine.in_use = false;
            machine.run_list = vec![NETWORK_INTERFACES_ROLE.to_string()];

            if let Err(e) = self.inventory.save_machine(&machine).await {
                warn!(machine = %machine.name, error = %e, "Could not save bring-up role");
                report.machines.push(BringUpResult {
                    machine: machine.name,
                    success: false,
                    converge: None,
                    error: Some(e.to_string()),
                });
                continue;
            }

            info!(machine = %machine, "Running network interfaces");
            let result = match lifecycle.converge(&machine, self.config.bring_up_runs).await {
                Ok(converge) => {
                    if !converge.success {
                        for (i, run) in converge.runs.iter().enumerate() {
                            warn!(machine = %machine.name, run = i + 1, success = run.success, stderr = %run.stderr.trim(), "Convergence run");
                        }
                    }
                    BringUpResult {
                        machine: machine.name,
                        success: converge.success,
                        converge: Some(converge),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(machine = %machine.name, error = %e, "Convergence could not run");
                    BringUpResult {
                        machine: machine.name,
                        success: false,
                        converge: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.machines.push(result);
        }

        Ok(report)
    }

    /// Grow the elastic pool for `os` to `max(cluster_size, min_pool_size)`.
    #[instrument(skip(self))]
    pub async fn top_up(
        &self,
        os: &str,
        cluster_size: usize,
        image_tag: &str,
    ) -> PoolResult<TopUpReport> {
        let query = Query::new(Field::Name, cloud_pool_name_pattern(os));
        let existing = self.pool_members(&query).await?.len();
        let target = cluster_size.max(self.config.min_pool_size);

        let mut report = TopUpReport {
            os: os.to_string(),
            existing,
            target,
            created: Vec::new(),
        };
        if existing >= target {
            debug!(existing, target, "Pool already at target size");
            return Ok(report);
        }

        info!(existing, adding = target - existing, "Growing pool");
        for index in existing + 1..=target {
            let request = InstanceRequest {
                name: cloud_pool_machine_name(os, index),
                image_tag: image_tag.to_string(),
            };
            let handle = self.provisioner.create_instance(&request).await?;
            report.created.push(CreatedInstance {
                name: request.name,
                handle,
            });
        }

        Ok(report)
    }
}

/// Free and network-configured, or a network-configured member of the
/// target environment already.
fn is_eligible(machine: &MachineRecord, environment: &str) -> bool {
    MachineState::of(machine).is_allocatable()
        || (machine.environment == environment && machine.is_network_configured())
}
