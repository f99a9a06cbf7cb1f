//! Deployments: allocated machines plus their deferred cleanup.
//!
//! A deployment owns its machines (teardown erases them) but only refers
//! to its environment by name.

use std::future::Future;

use rigpool_clients::InventoryClient;
use rigpool_model::MachineRecord;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cleanup::{CleanupReport, CleanupStack};
use crate::environment::MachineFailure;
use crate::error::{PoolError, PoolResult};
use crate::lifecycle::NodeLifecycleController;

#[derive(Debug)]
pub struct Deployment {
    name: String,
    environment: String,
    machines: Vec<MachineRecord>,
    cleanups: CleanupStack,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub deployment: String,
    pub environment: String,
    pub erased: Vec<String>,
    pub failed: Vec<MachineFailure>,
    pub cleanup: CleanupReport,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.cleanup.is_clean()
    }
}

impl Deployment {
    pub fn new(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
            machines: Vec::new(),
            cleanups: CleanupStack::new(),
        }
    }

    /// Load the records of freshly allocated machines, in allocation order.
    pub async fn from_allocation(
        name: impl Into<String>,
        environment: impl Into<String>,
        machine_names: &[String],
        inventory: &dyn InventoryClient,
    ) -> PoolResult<Self> {
        let mut deployment = Self::new(name, environment);
        for machine_name in machine_names {
            let record = inventory
                .get_machine(machine_name)
                .await?
                .ok_or_else(|| PoolError::not_found("machine", machine_name.clone()))?;
            deployment.add_machine(record);
        }
        Ok(deployment)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machines(&self) -> &[MachineRecord] {
        &self.machines
    }

    pub fn add_machine(&mut self, machine: MachineRecord) {
        self.machines.push(machine);
    }

    pub fn add_cleanup<F, Fut>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanups.register(label, action);
    }

    /// Erase every machine, then run the registered cleanup actions.
    ///
    /// Best-effort throughout: failures are reported, never returned.
    #[instrument(skip_all, fields(deployment = %self.name))]
    pub async fn teardown(mut self, lifecycle: &NodeLifecycleController) -> TeardownReport {
        let mut report = TeardownReport {
            deployment: self.name.clone(),
            environment: self.environment.clone(),
            ..TeardownReport::default()
        };

        for machine in std::mem::take(&mut self.machines) {
            match lifecycle.erase(&machine).await {
                Ok(_) => report.erased.push(machine.name),
                Err(e) => {
                    warn!(machine = %machine.name, error = %e, "Teardown erase failed");
                    report.failed.push(MachineFailure {
                        machine: machine.name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.cleanup = self.cleanups.run_all().await;

        info!(
            erased = report.erased.len(),
            failed = report.failed.len(),
            cleanup_failures = report.cleanup.failed.len(),
            "Deployment torn down"
        );
        report
    }
}
