//! Collaborator handles shared by every component.

use std::sync::Arc;

use rigpool_clients::{InventoryClient, ProvisioningClient, RemoteExec};

/// Explicit replacement for a process-wide default connection: every
/// component receives the collaborators it talks to through this context.
#[derive(Clone)]
pub struct PoolContext {
    pub inventory: Arc<dyn InventoryClient>,
    pub provisioner: Arc<dyn ProvisioningClient>,
    pub exec: Arc<dyn RemoteExec>,
}

impl PoolContext {
    pub fn new(
        inventory: Arc<dyn InventoryClient>,
        provisioner: Arc<dyn ProvisioningClient>,
        exec: Arc<dyn RemoteExec>,
    ) -> Self {
        Self {
            inventory,
            provisioner,
            exec,
        }
    }
}
