//! Machine backends.
//!
//! How a machine's credentials are obtained and what "giving it back" means
//! depends on where the machine came from. The backend is chosen once, when
//! the lifecycle controller is built.

use std::sync::Arc;

use async_trait::async_trait;
use rigpool_clients::ProvisioningClient;
use rigpool_model::{Credentials, MachineRecord, ProvisioningHandle};
use tracing::debug;

use crate::error::{PoolError, PoolResult};

#[async_trait]
pub trait MachineBackend: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &'static str;

    /// Credentials for remote access to the machine.
    async fn credentials(&self, machine: &MachineRecord) -> PoolResult<Credentials>;

    /// Return the machine to whoever handed it out.
    async fn reclaim(&self, machine: &MachineRecord) -> PoolResult<()>;
}

/// Machines created by the provisioning service.
pub struct ProvisionedBackend {
    provisioner: Arc<dyn ProvisioningClient>,
}

impl ProvisionedBackend {
    pub fn new(provisioner: Arc<dyn ProvisioningClient>) -> Self {
        Self { provisioner }
    }
}

fn handle_of(machine: &MachineRecord) -> PoolResult<&ProvisioningHandle> {
    machine
        .provisioning_handle
        .as_ref()
        .ok_or_else(|| PoolError::not_found("provisioning handle", machine.name.clone()))
}

#[async_trait]
impl MachineBackend for ProvisionedBackend {
    fn name(&self) -> &'static str {
        "provisioned"
    }

    async fn credentials(&self, machine: &MachineRecord) -> PoolResult<Credentials> {
        let handle = handle_of(machine)?;
        Ok(self.provisioner.credentials(handle).await?)
    }

    async fn reclaim(&self, machine: &MachineRecord) -> PoolResult<()> {
        let handle = handle_of(machine)?;
        debug!(machine = %machine.name, handle = %handle, "Releasing provisioning handle");
        Ok(self.provisioner.release(handle).await?)
    }
}

/// Pre-existing hardware that shares one set of credentials and has no
/// provisioning record to release.
///
/// Machines carrying a provisioning handle are refused: erasing one would
/// delete its records while its handle stays active.
pub struct StaticBackend {
    credentials: Credentials,
}

impl StaticBackend {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    fn ensure_static(&self, machine: &MachineRecord) -> PoolResult<()> {
        match &machine.provisioning_handle {
            Some(handle) => Err(PoolError::BackendMismatch {
                machine: machine.name.clone(),
                handle: handle.to_string(),
                backend: self.name(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MachineBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn credentials(&self, machine: &MachineRecord) -> PoolResult<Credentials> {
        self.ensure_static(machine)?;
        Ok(self.credentials.clone())
    }

    async fn reclaim(&self, machine: &MachineRecord) -> PoolResult<()> {
        self.ensure_static(machine)?;
        debug!(machine = %machine.name, "Static machine, nothing to release");
        Ok(())
    }
}
