//! Machine lifecycle states.
//!
//! ```text
//! Free --bring-up--> NetworkConfigured --allocate--> Allocated <--> InUse
//!   \_________________________|__________________________|_______/
//!                              erase: Reclaiming --> Removed
//! ```
//!
//! `Allocated <-> InUse` is toggled by the test harness, not by rigpool.

use std::fmt;

use crate::record::MachineRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineState {
    /// Default environment, network interfaces not configured yet.
    Free,
    /// Default environment, network interfaces configured.
    NetworkConfigured,
    /// Assigned to an environment, not in use.
    Allocated,
    /// Assigned to an environment and in use by a test run.
    InUse,
    /// Erasure in progress.
    Reclaiming,
    /// Deleted from inventory and released from provisioning.
    Removed,
}

impl MachineState {
    /// Derive the resting state of a machine from its inventory record.
    pub fn of(record: &MachineRecord) -> Self {
        if record.in_default_environment() {
            if record.is_network_configured() {
                Self::NetworkConfigured
            } else {
                Self::Free
            }
        } else if record.in_use {
            Self::InUse
        } else {
            Self::Allocated
        }
    }

    /// True if the allocator may hand this machine to an environment.
    pub fn is_allocatable(&self) -> bool {
        matches!(self, Self::NetworkConfigured)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::NetworkConfigured => "network_configured",
            Self::Allocated => "allocated",
            Self::InUse => "in_use",
            Self::Reclaiming => "reclaiming",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
