//! External collaborators of the rigpool controller.
//!
//! The controller talks to three services, each behind a trait so the
//! lifecycle logic can run against real backends or in-memory fakes:
//!
//! - [`InventoryClient`]: system of record for machines and environments.
//!   Its search index is eventually consistent.
//! - [`ProvisioningClient`]: creates, credentials and releases instances.
//! - [`RemoteExec`]: runs commands on and copies files to/from machines.
//!
//! ## Modules
//!
//! - `inventory`: trait plus the HTTP implementation
//! - `provisioning`: trait plus the HTTP implementation
//! - `exec`: trait plus the SSH implementation
//! - `memory`: in-memory implementations that record every call

pub mod error;
pub mod exec;
pub mod inventory;
pub mod memory;
pub mod provisioning;

mod http;

pub use error::{ClientError, ClientResult};
pub use exec::{CommandOutput, RemoteExec, RemoteTarget, SshExec};
pub use inventory::{HttpInventoryClient, InventoryClient};
pub use memory::{ExecCall, MemoryInventory, MemoryProvisioner, ScriptedExec};
pub use provisioning::{ActiveModel, HttpProvisioningClient, InstanceRequest, ProvisioningClient};
