//! Launch-gate error types.

use thiserror::Error;

/// Result type alias for coordinator operations.
pub type HookOpResult<T> = Result<T, HookError>;

/// Errors from hold registration and resolution.
#[derive(Debug, Error)]
pub enum HookError {
    /// A hold already exists for this instance; an instance id appears
    /// in the pending table at most once concurrently.
    #[error("hold already registered for instance {0}")]
    DuplicateHold(String),

    /// Registry failure underneath the coordinator.
    #[error("registry error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}
