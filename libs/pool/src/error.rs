//! Error taxonomy for pool operations.

use rigpool_clients::ClientError;
use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The index never returned results within the retry budget. This is
    /// indistinguishable from a query that legitimately matches nothing.
    #[error("inventory search '{query}' returned no results after {attempts} attempts")]
    SearchExhausted { query: String, attempts: u32 },

    #[error("insufficient capacity: requested {requested} machines, {available} eligible")]
    InsufficientCapacity { requested: usize, available: usize },

    /// The reboot step did not succeed; the machine was left in place.
    #[error("reclaim of {machine} failed: {reason}")]
    ReclaimFailed { machine: String, reason: String },

    /// The machine was created through the provisioning service but the
    /// configured backend cannot release it.
    #[error("{machine} has provisioning handle {handle}; the {backend} backend cannot manage it")]
    BackendMismatch {
        machine: String,
        handle: String,
        backend: &'static str,
    },

    #[error("remote command '{command}' failed on {machine}: {detail}")]
    RemoteCommandFailed {
        machine: String,
        command: String,
        detail: String,
    },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl PoolError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True for our own `NotFound` and for collaborator not-found errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Client(e) => e.is_not_found(),
            _ => false,
        }
    }
}
