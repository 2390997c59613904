//! Bounded retry with exponential backoff for provider calls.
//!
//! Every call through the provider seam is subject to a per-attempt
//! timeout and retried only while [`ProviderError::is_transient`] holds.
//! Exhaustion returns the last error to the caller, which surfaces it as
//! a lifecycle event — nothing fails silently.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};

/// Backoff and attempt limits for one class of provider call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the (doubling) backoff delay.
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Per-attempt timeout.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            max_attempts: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current: self.base_delay,
            max: self.max_delay,
        }
    }
}

/// Doubling backoff delays, capped at `max`.
struct ExponentialBackoff {
    current: Duration,
    max: Duration,
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }
}

/// Run `call` under `policy`, retrying transient failures.
///
/// `op` names the operation for log fields. The per-attempt timeout maps
/// to [`ProviderError::Timeout`], which is itself transient.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut call: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut delays = policy.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(
                policy.call_timeout.as_millis() as u64
            )),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(%op, attempt, "provider call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = delays.next().unwrap_or(policy.max_delay);
                warn!(
                    %op,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(%op, attempt, error = %e, "provider call failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "launch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProviderError>(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(4), "launch", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Unavailable("503".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> =
            with_retry(&RetryPolicy::immediate(3), "terminate", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Unavailable("still down".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> =
            with_retry(&RetryPolicy::immediate(5), "launch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::InvalidSpec("bad ami".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidSpec(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_transient_error() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 2,
            call_timeout: Duration::from_millis(10),
        };
        let result: ProviderResult<()> = with_retry(&policy, "launch", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 10,
            call_timeout: Duration::from_secs(1),
        };
        let delays: Vec<Duration> = policy.backoff().take(5).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(400),
                Duration::from_millis(400),
            ]
        );
    }
}
