//! Provider error taxonomy.
//!
//! Transient failures (`Unavailable`, `RateLimited`, `Timeout`) are
//! retried with backoff; permanent ones (`InvalidSpec`, `NotFound`) are
//! surfaced immediately.

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors crossing the provider seam.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider API is temporarily unreachable or degraded.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider throttled the call.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The call did not complete within the caller-supplied timeout.
    #[error("provider call timed out after {0}ms")]
    Timeout(u64),

    /// The launch spec was rejected. Not retried.
    #[error("invalid launch spec: {0}")]
    InvalidSpec(String),

    /// The referenced instance does not exist at the provider. Not retried.
    #[error("instance not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Whether a retry can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Unavailable("503".into()).is_transient());
        assert!(ProviderError::RateLimited("throttle".into()).is_transient());
        assert!(ProviderError::Timeout(5000).is_transient());
        assert!(!ProviderError::InvalidSpec("bad ami".into()).is_transient());
        assert!(!ProviderError::NotFound("i-404".into()).is_transient());
    }
}
