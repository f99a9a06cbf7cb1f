//! Machine lifecycle control.
//!
//! The controller drives individual machines through remote operations:
//! running commands and configuration convergence, transferring files, and
//! the destructive erase path that returns a machine to the provisioner.
//!
//! # Erase handshake
//!
//! 1. Fetch credentials through the machine backend.
//! 2. Reboot the machine.
//! 3. If the reboot did not succeed, stop: nothing is deleted.
//! 4. Delete the inventory client and machine records.
//! 5. Release the machine through the backend.
//! 6. Wait the settle delay so later searches do not observe the machine
//!    mid-reclaim.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rigpool_clients::{ClientError, CommandOutput, RemoteTarget};
use rigpool_model::{MachineRecord, MachineState, ProvisioningHandle};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::backend::MachineBackend;
use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};

/// Default settle delay after reclaim and reboot-based operations.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(15);

/// Default configuration-convergence command.
pub const DEFAULT_CONVERGE_COMMAND: &str = "chef-client -l error";

/// Command that reboots a machine back into the provisioner.
pub const REBOOT_COMMAND: &str = "reboot 0";

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Remote user for commands and transfers.
    pub remote_user: String,

    /// Wait after a machine is reclaimed.
    pub settle_delay: Duration,

    /// Command that converges a machine's configuration.
    pub converge_command: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            remote_user: "root".to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            converge_command: DEFAULT_CONVERGE_COMMAND.to_string(),
        }
    }
}

/// Every attempt of a repeated remote command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub machine: String,
    pub command: String,
    /// True only if every attempt succeeded.
    pub success: bool,
    pub runs: Vec<CommandOutput>,
}

/// Outcome of a stuck-model scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StuckModelReport {
    pub inspected: usize,
    pub removed: Vec<ProvisioningHandle>,
    pub failed: Vec<StuckModelFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckModelFailure {
    pub handle: ProvisioningHandle,
    pub reason: String,
}

pub struct NodeLifecycleController {
    ctx: PoolContext,
    backend: Arc<dyn MachineBackend>,
    config: LifecycleConfig,
}

impl NodeLifecycleController {
    pub fn new(ctx: PoolContext, backend: Arc<dyn MachineBackend>, config: LifecycleConfig) -> Self {
        Self {
            ctx,
            backend,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Remote access target for a machine; credentials are fetched on demand.
    pub async fn target(&self, machine: &MachineRecord) -> PoolResult<RemoteTarget> {
        Ok(RemoteTarget {
            address: machine.address.clone(),
            user: self.config.remote_user.clone(),
            credentials: self.backend.credentials(machine).await?,
        })
    }

    /// Run a command `times` times, collecting every attempt.
    ///
    /// Failed attempts do not stop later ones; the report says whether all
    /// of them succeeded.
    #[instrument(skip(self, machine), fields(machine = %machine.name))]
    pub async fn run_command(
        &self,
        machine: &MachineRecord,
        command: &str,
        times: u32,
    ) -> PoolResult<CommandReport> {
        let target = self.target(machine).await?;
        let mut runs = Vec::with_capacity(times as usize);

        for attempt in 1..=times {
            let output = self.ctx.exec.run(&target, command).await?;
            if !output.success {
                debug!(attempt, exit_code = ?output.exit_code, "Remote command failed");
            }
            runs.push(output);
        }

        Ok(CommandReport {
            machine: machine.name.clone(),
            command: command.to_string(),
            success: runs.iter().all(|run| run.success),
            runs,
        })
    }

    /// Run the configuration-convergence command `times` times.
    pub async fn converge(&self, machine: &MachineRecord, times: u32) -> PoolResult<CommandReport> {
        let command = self.config.converge_command.clone();
        self.run_command(machine, &command, times).await
    }

    pub async fn copy_to(
        &self,
        machine: &MachineRecord,
        local: &Path,
        remote: &str,
    ) -> PoolResult<CommandOutput> {
        let target = self.target(machine).await?;
        let output = self.ctx.exec.copy_to(&target, local, remote).await?;
        transfer_result(machine, format!("copy {} to {remote}", local.display()), output)
    }

    pub async fn copy_from(
        &self,
        machine: &MachineRecord,
        remote: &str,
        local: &Path,
    ) -> PoolResult<CommandOutput> {
        let target = self.target(machine).await?;
        let output = self.ctx.exec.copy_from(&target, remote, local).await?;
        transfer_result(machine, format!("copy {remote} to {}", local.display()), output)
    }

    /// Reboot, delete and release a machine.
    ///
    /// Nothing is deleted unless the reboot succeeds; a machine that may
    /// still be reachable keeps its inventory and provisioning records.
    #[instrument(skip(self, machine), fields(machine = %machine.name, backend = self.backend.name()))]
    pub async fn erase(&self, machine: &MachineRecord) -> PoolResult<MachineState> {
        info!(
            address = %machine.address,
            from = %MachineState::of(machine),
            to = %MachineState::Reclaiming,
            "Erasing machine"
        );
        let target = self.target(machine).await?;

        match self.ctx.exec.run(&target, REBOOT_COMMAND).await {
            Ok(output) if output.success => {}
            Ok(output) => {
                warn!(exit_code = ?output.exit_code, "Reboot failed, leaving machine in place");
                return Err(PoolError::ReclaimFailed {
                    machine: machine.name.clone(),
                    reason: describe_failure(&output),
                });
            }
            Err(e) => {
                warn!(error = %e, "Reboot could not be issued, leaving machine in place");
                return Err(PoolError::ReclaimFailed {
                    machine: machine.name.clone(),
                    reason: e.to_string(),
                });
            }
        }

        tolerate_missing(self.ctx.inventory.delete_client(&machine.name).await, "client")?;
        tolerate_missing(
            self.ctx.inventory.delete_machine(&machine.name).await,
            "machine",
        )?;

        if let Err(e) = self.backend.reclaim(machine).await {
            let handle = machine
                .provisioning_handle
                .as_ref()
                .map_or_else(|| "none".to_string(), ToString::to_string);
            warn!(handle = %handle, error = %e, "Records deleted but release failed");
            return Err(PoolError::ReclaimFailed {
                machine: machine.name.clone(),
                reason: format!("records deleted but release of handle {handle} failed: {e}"),
            });
        }

        debug!(
            settle_secs = self.config.settle_delay.as_secs_f64(),
            "Waiting for provisioner to settle"
        );
        tokio::time::sleep(self.config.settle_delay).await;

        info!("Machine erased");
        Ok(MachineState::Removed)
    }

    /// Reboot and release every active model under `policy` that is stuck
    /// in a broker-failure state.
    ///
    /// Failures are reported per model and never abort the scan.
    #[instrument(skip(self))]
    pub async fn remove_stuck_models(&self, policy: &str) -> PoolResult<StuckModelReport> {
        let models = self.ctx.provisioner.active_models(policy).await?;
        let mut report = StuckModelReport {
            inspected: models.len(),
            ..StuckModelReport::default()
        };

        for model in models.into_iter().filter(|m| m.is_broker_failed()) {
            warn!(handle = %model.handle, state = %model.current_state, "Removing stuck active model");

            let Some(address) = model.address.clone() else {
                report.failed.push(StuckModelFailure {
                    handle: model.handle,
                    reason: "no address reported".to_string(),
                });
                continue;
            };

            let credentials = match self.ctx.provisioner.credentials(&model.handle).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(handle = %model.handle, error = %e, "Could not fetch credentials");
                    report.failed.push(StuckModelFailure {
                        handle: model.handle,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let target = RemoteTarget {
                address,
                user: self.config.remote_user.clone(),
                credentials,
            };

            let reason = match self.ctx.exec.run(&target, REBOOT_COMMAND).await {
                Ok(output) if output.success => None,
                Ok(output) => Some(describe_failure(&output)),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = reason {
                warn!(handle = %model.handle, reason = %reason, "Trouble rebooting stuck model");
                report.failed.push(StuckModelFailure {
                    handle: model.handle,
                    reason,
                });
                continue;
            }

            if let Err(e) = self.ctx.provisioner.release(&model.handle).await {
                warn!(handle = %model.handle, error = %e, "Could not release stuck model");
                report.failed.push(StuckModelFailure {
                    handle: model.handle,
                    reason: e.to_string(),
                });
                continue;
            }

            tokio::time::sleep(self.config.settle_delay).await;
            report.removed.push(model.handle);
        }

        info!(
            inspected = report.inspected,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Stuck model scan complete"
        );
        Ok(report)
    }
}

/// Treat an already-absent record as deleted.
fn tolerate_missing(result: Result<(), ClientError>, kind: &'static str) -> PoolResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(kind, "Record already absent");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn describe_failure(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    match output.exit_code {
        Some(code) if stderr.is_empty() => format!("exit code {code}"),
        Some(code) => format!("exit code {code}: {stderr}"),
        None if stderr.is_empty() => "terminated by signal".to_string(),
        None => format!("terminated by signal: {stderr}"),
    }
}

fn transfer_result(
    machine: &MachineRecord,
    command: String,
    output: CommandOutput,
) -> PoolResult<CommandOutput> {
    if output.success {
        Ok(output)
    } else {
        Err(PoolError::RemoteCommandFailed {
            machine: machine.name.clone(),
            command,
            detail: describe_failure(&output),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_failure() {
        assert_eq!(
            describe_failure(&CommandOutput::failed(255, "No route to host\n")),
            "exit code 255: No route to host"
        );
        assert_eq!(describe_failure(&CommandOutput::failed(1, "")), "exit code 1");
    }

    #[test]
    fn test_lifecycle_config_default() {
        let config = LifecycleConfig::default();
        assert_eq!(config.remote_user, "root");
        assert_eq!(config.settle_delay, Duration::from_secs(15));
        assert_eq!(config.converge_command, "chef-client -l error");
    }
}
