//! Error types for the FleetGrid registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Compare-and-set failure: the instance was not in any of the
    /// expected states. The losing writer must re-read, not clobber.
    #[error("state conflict for {id}: expected one of {expected:?}, found {actual}")]
    Conflict {
        id: String,
        expected: Vec<crate::types::LifecycleState>,
        actual: crate::types::LifecycleState,
    },

    /// Desired capacity outside the `[min, max]` envelope.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Configuration invariant violation (e.g. `min > max`).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
