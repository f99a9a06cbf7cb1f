//! Pool allocation and machine lifecycle control.
//!
//! The components here coordinate two external services, an inventory
//! service (machine metadata, environment membership, run lists) and a
//! provisioning service (instances, credentials, release):
//!
//! - [`RetrySearch`]: inventory searches retried across index lag
//! - [`EnvironmentManager`]: environment creation, attribute merge, cleanup
//! - [`PoolAllocator`]: all-or-nothing machine allocation, bring-up, top-up
//! - [`NodeLifecycleController`]: remote commands and the erase handshake
//! - [`CleanupStack`] / [`Deployment`]: best-effort teardown
//!
//! # Invariants
//!
//! - Allocation never returns more machines than requested and never takes
//!   a machine owned by another environment.
//! - A failed allocation reassigns nothing.
//! - A machine's records are deleted only after a confirmed reboot.
//! - Execution is sequential; the only waits are search retries and the
//!   settle delay after reclaim.

pub mod allocator;
pub mod backend;
pub mod cleanup;
pub mod context;
pub mod deployment;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod search;

pub use allocator::{BringUpReport, BringUpResult, PoolAllocator, PoolConfig, TopUpReport};
pub use backend::{MachineBackend, ProvisionedBackend, StaticBackend};
pub use cleanup::{CleanupFailure, CleanupReport, CleanupStack};
pub use context::PoolContext;
pub use deployment::{Deployment, TeardownReport};
pub use environment::{
    environment_name, EnvironmentCleanupReport, EnvironmentManager, FeatureCatalog,
    MachineFailure,
};
pub use error::{PoolError, PoolResult};
pub use lifecycle::{
    CommandReport, LifecycleConfig, NodeLifecycleController, StuckModelFailure, StuckModelReport,
};
pub use search::{RetrySearch, SearchOutcome, SearchPolicy};
