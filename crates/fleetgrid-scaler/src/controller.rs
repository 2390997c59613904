//! Capacity reconciliation — desired vs. observed, converged per pass.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use fleetgrid_events::NotificationBus;
use fleetgrid_hooks::{HookError, LifecycleHookCoordinator};
use fleetgrid_provider::retry::with_retry;
use fleetgrid_provider::{DynProvider, LaunchSpec, ProviderError, RetryPolicy};
use fleetgrid_state::store::epoch_secs;
use fleetgrid_state::{
    EventCause, GroupConfig, HealthStatus, InstanceId, InstanceRecord, LifecycleState,
    StateError, StateStore, WarmPoolMembership,
};
use fleetgrid_warmpool::{WarmPoolError, WarmPoolManager};

/// Errors from capacity reconciliation.
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("registry error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("launch gate error: {0}")]
    Hook(#[from] HookError),

    #[error("warm pool error: {0}")]
    WarmPool(#[from] WarmPoolError),
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    /// Warm entries promoted onto the launch track.
    pub promoted: u32,
    /// Cold launches issued.
    pub launched: u32,
    /// Instances terminated (scale-in and abandoned cleanup).
    pub terminated: u32,
    /// Provider actions that exhausted their retries.
    pub failed: u32,
}

impl ReconcileOutcome {
    /// Whether the pass changed anything.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// The reconciliation loop: computes the capacity delta and issues the
/// minimal provider actions to converge, warm pool first.
pub struct ScalingController {
    state: StateStore,
    provider: DynProvider,
    warm_pool: Arc<WarmPoolManager>,
    hooks: Arc<LifecycleHookCoordinator>,
    bus: NotificationBus,
    launch_spec: LaunchSpec,
    retry: RetryPolicy,
    /// Bound on concurrent provider calls within one pass.
    provider_concurrency: usize,
    reconcile_now: Arc<Notify>,
}

impl ScalingController {
    pub fn new(
        state: StateStore,
        provider: DynProvider,
        warm_pool: Arc<WarmPoolManager>,
        hooks: Arc<LifecycleHookCoordinator>,
        bus: NotificationBus,
        launch_spec: LaunchSpec,
    ) -> Self {
        Self {
            state,
            provider,
            warm_pool,
            hooks,
            bus,
            launch_spec,
            retry: RetryPolicy::default(),
            provider_concurrency: 4,
            reconcile_now: Arc::new(Notify::new()),
        }
    }

    /// Override the provider retry policy (tests use an immediate one).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-pass provider call concurrency bound.
    pub fn with_provider_concurrency(mut self, limit: usize) -> Self {
        self.provider_concurrency = limit.max(1);
        self
    }

    /// Handle used to trigger an immediate reconciliation pass.
    pub fn reconcile_signal(&self) -> Arc<Notify> {
        self.reconcile_now.clone()
    }

    /// Update desired capacity through the validated group config path.
    ///
    /// A desired value outside `[min, max]` is rejected with
    /// `CapacityExceeded`, never clamped. On success the reconcile loop
    /// is nudged.
    pub fn set_desired_capacity(&self, desired: u32) -> Result<GroupConfig, ScalerError> {
        let mut group = self.state.get_group()?;
        group.desired_capacity = desired;
        self.state.put_group(&group)?;
        info!(desired, "desired capacity updated");
        self.reconcile_now.notify_one();
        Ok(group)
    }

    /// One reconciliation pass.
    ///
    /// `delta = desired - (in_service + pending_launch)`. Positive delta
    /// is satisfied by warm promotion first, then cold launches; negative
    /// delta terminates unhealthy-first, then oldest-first, never an
    /// instance inside an active hold. Abandoned instances are always
    /// swept into termination.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ScalerError> {
        let group = self.state.get_group()?;
        // The stored config is validated on write; this guards direct
        // constructions handed in by callers.
        group.validate()?;

        let mut outcome = ReconcileOutcome::default();
        self.sweep_abandoned(&mut outcome).await?;
        self.sweep_unhealthy(&mut outcome).await?;

        let counts = self.state.capacity_counts()?;
        let track = counts.in_service_track();
        let desired = group.desired_capacity;

        if desired > track {
            let delta = desired - track;
            debug!(desired, track, delta, "scaling out");

            let promoted = self.warm_pool.promote(delta)?;
            for id in &promoted {
                self.place_hold(id)?;
            }
            outcome.promoted = promoted.len() as u32;

            let remainder = delta - outcome.promoted;
            if remainder > 0 {
                self.launch_cold(remainder, &mut outcome).await?;
            }
        } else if desired < track {
            let excess = track - desired;
            debug!(desired, track, excess, "scaling in");
            self.scale_in(excess, &mut outcome).await?;
        }

        if !outcome.is_noop() {
            info!(
                promoted = outcome.promoted,
                launched = outcome.launched,
                terminated = outcome.terminated,
                failed = outcome.failed,
                "capacity reconciled"
            );
        }
        Ok(outcome)
    }

    /// Run the reconciliation loop until shutdown. Wakes on the interval
    /// or on an explicit nudge from [`Self::reconcile_signal`].
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "scaling controller started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile().await {
                        tracing::error!(error = %e, "reconciliation pass failed");
                    }
                }
                _ = self.reconcile_now.notified() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::error!(error = %e, "triggered reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scaling controller shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal ───────────────────────────────────────────────────

    /// Register the launch-gate hold for an instance entering `Launching`.
    fn place_hold(&self, id: &str) -> Result<(), ScalerError> {
        match self.hooks.register_hold(id) {
            Ok(_) => Ok(()),
            // A hold surviving from a previous pass keeps gating; fine.
            Err(HookError::DuplicateHold(_)) => {
                warn!(instance_id = %id, "hold already present, keeping existing deadline");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Issue `n` cold launches, bounded by the concurrency limit.
    async fn launch_cold(
        &self,
        n: u32,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ScalerError> {
        let semaphore = Arc::new(Semaphore::new(self.provider_concurrency));
        let mut set = JoinSet::new();

        for _ in 0..n {
            let semaphore = semaphore.clone();
            let provider = self.provider.clone();
            let spec = self.launch_spec.clone();
            let retry = self.retry.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                with_retry(&retry, "launch_instance", || provider.launch_instance(&spec))
                    .await
            });
        }

        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "launch task failed to run");
                    outcome.failed += 1;
                    continue;
                }
            };
            match result {
                Ok(id) => {
                    self.state
                        .put_instance(&InstanceRecord::new(id.clone(), epoch_secs()))?;
                    let (from, _) = self.state.transition_instance(
                        &id,
                        &[LifecycleState::Pending],
                        LifecycleState::Launching,
                        |_| {},
                    )?;
                    self.bus
                        .emit(&id, from, LifecycleState::Launching, EventCause::ScaleOut);
                    self.place_hold(&id)?;
                    outcome.launched += 1;
                }
                Err(e) => {
                    warn!(error = %e, "cold launch exhausted retries");
                    self.bus.emit_launch_failure();
                    outcome.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Terminate `n` instances, unhealthy first, then oldest.
    async fn scale_in(
        &self,
        n: u32,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ScalerError> {
        let mut candidates = Vec::new();
        for record in self.state.list_instances()? {
            let eligible = match record.lifecycle {
                LifecycleState::InService => true,
                // Launch-track instances are only eligible once their
                // hold is resolved; an active hold is never interrupted.
                LifecycleState::Launching => self.state.get_hold(&record.id)?.is_none(),
                _ => false,
            };
            if eligible {
                candidates.push(record);
            }
        }

        // Unhealthy first, then oldest launched (rolling-refresh bias).
        candidates.sort_by_key(|r| {
            (
                r.health != HealthStatus::Unhealthy,
                r.launched_at,
                r.id.clone(),
            )
        });

        let victims: Vec<InstanceId> = candidates
            .into_iter()
            .take(n as usize)
            .map(|r| r.id)
            .collect();
        self.terminate_batch(
            victims,
            &[LifecycleState::InService, LifecycleState::Launching],
            EventCause::ScaleIn,
            outcome,
        )
        .await
    }

    /// Debounced-unhealthy serving instances are terminated here, which
    /// frees their slot so the delta computation in the same pass
    /// launches the replacement. Terminate-before-relaunch keeps
    /// `in_service + pending_launch` inside the envelope even at max
    /// capacity.
    async fn sweep_unhealthy(
        &self,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ScalerError> {
        let unhealthy: Vec<InstanceId> = self
            .state
            .list_instances()?
            .into_iter()
            .filter(|r| {
                r.lifecycle == LifecycleState::InService
                    && r.health == HealthStatus::Unhealthy
            })
            .map(|r| r.id)
            .collect();
        if unhealthy.is_empty() {
            return Ok(());
        }
        info!(count = unhealthy.len(), "replacing unhealthy instances");
        self.terminate_batch(
            unhealthy,
            &[LifecycleState::InService],
            EventCause::HealthCheck,
            outcome,
        )
        .await
    }

    /// Abandoned instances are always terminated, never retried in place.
    async fn sweep_abandoned(
        &self,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ScalerError> {
        let abandoned: Vec<InstanceId> = self
            .state
            .list_instances()?
            .into_iter()
            .filter(|r| r.lifecycle == LifecycleState::Abandoned)
            .map(|r| r.id)
            .collect();
        if abandoned.is_empty() {
            return Ok(());
        }
        debug!(count = abandoned.len(), "terminating abandoned instances");
        self.terminate_batch(
            abandoned,
            &[LifecycleState::Abandoned],
            EventCause::HookAbandoned,
            outcome,
        )
        .await
    }

    /// Move each instance to `Terminating`, fan out provider calls under
    /// the concurrency bound, then record the per-instance result.
    async fn terminate_batch(
        &self,
        ids: Vec<InstanceId>,
        expected: &[LifecycleState],
        cause: EventCause,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ScalerError> {
        let mut accepted = Vec::new();
        for id in ids {
            match self.state.transition_instance(
                &id,
                expected,
                LifecycleState::Terminating,
                |r| r.warm_pool = WarmPoolMembership::None,
            ) {
                Ok((from, _)) => {
                    self.bus.emit(&id, from, LifecycleState::Terminating, cause);
                    accepted.push(id);
                }
                // Another writer moved it since we listed; skip.
                Err(StateError::Conflict { .. }) => {
                    debug!(instance_id = %id, "termination candidate changed state, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.provider_concurrency));
        let mut set = JoinSet::new();
        for id in accepted {
            let semaphore = semaphore.clone();
            let provider = self.provider.clone();
            let retry = self.retry.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result =
                    with_retry(&retry, "terminate_instance", || provider.terminate_instance(&id))
                        .await;
                (id, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "terminate task failed to run");
                    outcome.failed += 1;
                    continue;
                }
            };
            match result {
                // NotFound means the provider already forgot it — done.
                Ok(()) | Err(ProviderError::NotFound(_)) => {
                    let (from, _) = self.state.transition_instance(
                        &id,
                        &[LifecycleState::Terminating],
                        LifecycleState::Terminated,
                        |_| {},
                    )?;
                    self.bus.emit(&id, from, LifecycleState::Terminated, cause);
                    outcome.terminated += 1;
                }
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "terminate exhausted retries");
                    let (from, _) = self.state.transition_instance(
                        &id,
                        &[LifecycleState::Terminating],
                        LifecycleState::TerminateFailed,
                        |_| {},
                    )?;
                    self.bus.emit(
                        &id,
                        from,
                        LifecycleState::TerminateFailed,
                        EventCause::TerminateFailure,
                    );
                    outcome.failed += 1;
                }
            }
        }
        Ok(())
    }
}
