//! Target set synchronization.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_provider::retry::with_retry;
use fleetgrid_provider::{DynTargetGroup, ProviderError, RetryPolicy};
use fleetgrid_state::{HealthStatus, InstanceId, LifecycleState, StateError, StateStore};

/// Errors from target set synchronization.
#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("registry error: {0}")]
    State(#[from] StateError),

    #[error("target group error: {0}")]
    Provider(#[from] ProviderError),
}

/// The add/remove delta issued by one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncDelta {
    pub registered: Vec<InstanceId>,
    pub deregistered: Vec<InstanceId>,
}

impl SyncDelta {
    pub fn is_noop(&self) -> bool {
        self.registered.is_empty() && self.deregistered.is_empty()
    }
}

/// Synchronizes the load balancer's target set with the registry.
pub struct TargetGroupRegistrar {
    state: StateStore,
    target_group: DynTargetGroup,
    retry: RetryPolicy,
}

impl TargetGroupRegistrar {
    pub fn new(state: StateStore, target_group: DynTargetGroup) -> Self {
        Self {
            state,
            target_group,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy (tests use an immediate one).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// One sync pass: compute and issue the minimal delta.
    ///
    /// Desired membership is `InService` and not `Unhealthy` — health
    /// starts `Unknown` and is only observable once the target is
    /// registered, so unknown-health instances are registered and the
    /// invariant is enforced on the unhealthy side. Removals go first so
    /// an unhealthy instance stops receiving traffic within one pass.
    pub async fn sync(&self) -> Result<SyncDelta, RegistrarError> {
        let desired: BTreeSet<InstanceId> = self
            .state
            .list_instances()?
            .into_iter()
            .filter(|r| {
                r.lifecycle == LifecycleState::InService
                    && r.health != HealthStatus::Unhealthy
            })
            .map(|r| r.id)
            .collect();

        let current: BTreeSet<InstanceId> = self
            .target_group
            .registered_targets()
            .await?
            .into_iter()
            .collect();

        let delta = SyncDelta {
            registered: desired.difference(&current).cloned().collect(),
            deregistered: current.difference(&desired).cloned().collect(),
        };

        if delta.is_noop() {
            return Ok(delta);
        }

        if !delta.deregistered.is_empty() {
            with_retry(&self.retry, "deregister_targets", || {
                self.target_group.deregister_targets(&delta.deregistered)
            })
            .await?;
            info!(count = delta.deregistered.len(), "targets deregistered");
        }

        if !delta.registered.is_empty() {
            with_retry(&self.retry, "register_targets", || {
                self.target_group.register_targets(&delta.registered)
            })
            .await?;
            info!(count = delta.registered.len(), "targets registered");
        }

        Ok(delta)
    }

    /// Run the sync loop until shutdown. A failed pass is logged and
    /// retried on the next tick; it never propagates to the scaler.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "target registrar started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sync().await {
                        Ok(delta) if !delta.is_noop() => {
                            debug!(
                                registered = delta.registered.len(),
                                deregistered = delta.deregistered.len(),
                                "target set synchronized"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "target sync failed, will retry next pass"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("target registrar shutting down");
                    break;
                }
            }
        }
    }
}
