//! Shared data model for rigpool.
//!
//! This crate defines the records the pool controller reads from and writes
//! to the inventory service:
//!
//! - [`MachineRecord`]: a machine in the pool, validated at the boundary
//! - [`EnvironmentRecord`]: a named, attribute-bearing machine grouping
//! - [`Query`]: the conjunctive filter language used to search inventory
//! - [`MachineState`]: lifecycle state derived from a machine record
//!
//! # Invariants
//!
//! - A machine belongs to exactly one environment at any instant.
//! - A machine carries a provisioning handle iff it was created through the
//!   provisioning service.

pub mod environment;
pub mod error;
pub mod query;
pub mod record;
pub mod state;

pub use environment::EnvironmentRecord;
pub use error::ModelError;
pub use query::{Field, Pattern, Query, Term};
pub use record::{Credentials, MachineRecord, ProvisioningHandle, RawMachineRecord};
pub use state::MachineState;

/// Environment that free machines belong to.
pub const DEFAULT_ENVIRONMENT: &str = "_default";

/// Run-list entry carried by machines that only have the base install.
pub const BASE_INSTALL_ROLE: &str = "role[qa-base]";

/// Run-list entry marking a machine whose network interfaces are configured.
pub const NETWORK_INTERFACES_ROLE: &str = "recipe[network-interfaces]";

/// Attribute key that always mirrors an environment's branch tag.
pub const PACKAGE_COMPONENT_KEY: &str = "package_component";

/// Name pattern for pool machines of a given OS tag.
pub fn pool_name_pattern(os: &str) -> String {
    format!("qa-{os}-pool*")
}

/// Name pattern for elastically grown pool machines of an OS tag.
pub fn cloud_pool_name_pattern(os: &str) -> String {
    format!("qa-cloud-{os}-pool*")
}

/// Name for the `index`-th elastically grown pool machine of an OS tag.
pub fn cloud_pool_machine_name(os: &str, index: usize) -> String {
    format!("qa-cloud-{os}-pool{index}")
}
