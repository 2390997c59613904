//! Warm pool reconciliation and promotion.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_events::NotificationBus;
use fleetgrid_provider::retry::with_retry;
use fleetgrid_provider::{DynProvider, LaunchSpec, ProviderError, RetryPolicy};
use fleetgrid_state::store::epoch_secs;
use fleetgrid_state::{
    EventCause, InstanceId, InstanceRecord, LifecycleState, StateError, StateStore,
    WarmPoolMembership,
};

/// Errors from warm pool reconciliation.
#[derive(Debug, Error)]
pub enum WarmPoolError {
    #[error("registry error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WarmPoolOutcome {
    /// Instances launched and parked.
    pub filled: u32,
    /// Parked instances terminated to meet a lowered target.
    pub shrunk: u32,
    /// Launch/terminate attempts that exhausted their retries.
    pub failed: u32,
}

/// Maintains the parked reserve at its configured target size.
pub struct WarmPoolManager {
    state: StateStore,
    provider: DynProvider,
    bus: NotificationBus,
    launch_spec: LaunchSpec,
    retry: RetryPolicy,
}

impl WarmPoolManager {
    pub fn new(
        state: StateStore,
        provider: DynProvider,
        bus: NotificationBus,
        launch_spec: LaunchSpec,
    ) -> Self {
        Self {
            state,
            provider,
            bus,
            launch_spec,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the provider retry policy (tests use an immediate one).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Drive the parked count toward the configured target.
    ///
    /// Independent of desired capacity: a scale-out that drains the pool
    /// is replenished here on the next pass. Idempotent — the delta is
    /// recomputed from the registry every time.
    pub async fn reconcile_warm_pool(&self) -> Result<WarmPoolOutcome, WarmPoolError> {
        let group = self.state.get_group()?;
        let target = group.warm_pool.target_size;
        let warm = self.state.capacity_counts()?.warm;
        let mut outcome = WarmPoolOutcome::default();

        if warm < target {
            let needed = target - warm;
            debug!(warm, target, needed, "filling warm pool");
            for _ in 0..needed {
                match self.launch_parked().await {
                    Ok(_) => outcome.filled += 1,
                    Err(e) => {
                        warn!(error = %e, "warm pool fill launch failed");
                        outcome.failed += 1;
                    }
                }
            }
        } else if warm > target {
            let excess = warm - target;
            debug!(warm, target, excess, "shrinking warm pool");
            // Oldest-parked first.
            for record in self.state.list_parked()?.into_iter().take(excess as usize) {
                match self.terminate_parked(&record.id).await {
                    Ok(()) => outcome.shrunk += 1,
                    Err(e) => {
                        warn!(instance_id = %record.id, error = %e, "warm pool shrink failed");
                        outcome.failed += 1;
                    }
                }
            }
        }

        if outcome != WarmPoolOutcome::default() {
            info!(
                filled = outcome.filled,
                shrunk = outcome.shrunk,
                failed = outcome.failed,
                "warm pool reconciled"
            );
        }
        Ok(outcome)
    }

    /// Hand up to `n` parked entries (oldest first) to the launching
    /// path. The caller registers the launch-gate hold for each.
    pub fn promote(&self, n: u32) -> Result<Vec<InstanceId>, WarmPoolError> {
        let mut promoted = Vec::new();
        for record in self.state.list_parked()?.into_iter().take(n as usize) {
            let (from, _) = self.state.transition_instance(
                &record.id,
                &[LifecycleState::Warmed],
                LifecycleState::Launching,
                |r| r.warm_pool = WarmPoolMembership::None,
            )?;
            self.bus
                .emit(&record.id, from, LifecycleState::Launching, EventCause::Promotion);
            promoted.push(record.id);
        }
        if !promoted.is_empty() {
            info!(count = promoted.len(), "warm instances promoted");
        }
        Ok(promoted)
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "warm pool manager started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_warm_pool().await {
                        tracing::error!(error = %e, "warm pool reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("warm pool manager shutting down");
                    break;
                }
            }
        }
    }

    /// Launch one instance and park it.
    async fn launch_parked(&self) -> Result<InstanceId, WarmPoolError> {
        let id = match with_retry(&self.retry, "warm_pool_launch", || {
            self.provider.launch_instance(&self.launch_spec)
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                // No provider id was ever assigned; surface the failed
                // request itself so alerting sees it.
                self.bus.emit_launch_failure();
                return Err(e.into());
            }
        };

        self.state
            .put_instance(&InstanceRecord::new(id.clone(), epoch_secs()))?;
        let (from, _) = self.state.transition_instance(
            &id,
            &[LifecycleState::Pending],
            LifecycleState::Warmed,
            |r| r.warm_pool = WarmPoolMembership::Parked,
        )?;
        self.bus
            .emit(&id, from, LifecycleState::Warmed, EventCause::WarmPoolFill);
        Ok(id)
    }

    /// Terminate one parked instance.
    async fn terminate_parked(&self, id: &InstanceId) -> Result<(), WarmPoolError> {
        let (from, _) = self.state.transition_instance(
            id,
            &[LifecycleState::Warmed],
            LifecycleState::Terminating,
            |r| r.warm_pool = WarmPoolMembership::None,
        )?;
        self.bus
            .emit(id, from, LifecycleState::Terminating, EventCause::WarmPoolShrink);

        match with_retry(&self.retry, "warm_pool_terminate", || {
            self.provider.terminate_instance(id)
        })
        .await
        {
            Ok(()) => {
                let (from, _) = self.state.transition_instance(
                    id,
                    &[LifecycleState::Terminating],
                    LifecycleState::Terminated,
                    |_| {},
                )?;
                self.bus
                    .emit(id, from, LifecycleState::Terminated, EventCause::WarmPoolShrink);
                Ok(())
            }
            Err(e) => {
                let (from, _) = self.state.transition_instance(
                    id,
                    &[LifecycleState::Terminating],
                    LifecycleState::TerminateFailed,
                    |_| {},
                )?;
                self.bus.emit(
                    id,
                    from,
                    LifecycleState::TerminateFailed,
                    EventCause::TerminateFailure,
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleetgrid_events::EventFilter;
    use fleetgrid_provider::sim::SimCloud;
    use fleetgrid_state::GroupConfig;

    fn manager_with(
        target: u32,
        max: u32,
    ) -> (WarmPoolManager, StateStore, Arc<SimCloud>, NotificationBus) {
        let store = StateStore::open_in_memory().unwrap();
        let mut config = GroupConfig::default();
        config.warm_pool.target_size = target;
        config.warm_pool.max_size = max;
        store.put_group(&config).unwrap();

        let sim = Arc::new(SimCloud::new());
        let bus = NotificationBus::new(64);
        let manager = WarmPoolManager::new(
            store.clone(),
            sim.clone(),
            bus.clone(),
            LaunchSpec::default(),
        )
        .with_retry_policy(RetryPolicy::immediate(2));
        (manager, store, sim, bus)
    }

    #[tokio::test]
    async fn fills_to_target() {
        let (manager, store, sim, _bus) = manager_with(2, 2);

        let outcome = manager.reconcile_warm_pool().await.unwrap();
        assert_eq!(outcome.filled, 2);
        assert_eq!(store.capacity_counts().unwrap().warm, 2);
        assert_eq!(sim.launch_calls(), 2);

        for record in store.list_parked().unwrap() {
            assert_eq!(record.lifecycle, LifecycleState::Warmed);
            assert_eq!(record.warm_pool, WarmPoolMembership::Parked);
        }
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (manager, _store, sim, _bus) = manager_with(2, 2);

        manager.reconcile_warm_pool().await.unwrap();
        let second = manager.reconcile_warm_pool().await.unwrap();

        assert_eq!(second, WarmPoolOutcome::default());
        assert_eq!(sim.launch_calls(), 2);
    }

    #[tokio::test]
    async fn shrinks_oldest_parked_first() {
        let (manager, store, sim, _bus) = manager_with(2, 2);
        manager.reconcile_warm_pool().await.unwrap();

        let parked = store.list_parked().unwrap();
        let oldest = parked[0].id.clone();

        // Lower the target to 1.
        let mut config = store.get_group().unwrap();
        config.warm_pool.target_size = 1;
        store.put_group(&config).unwrap();

        let outcome = manager.reconcile_warm_pool().await.unwrap();
        assert_eq!(outcome.shrunk, 1);
        assert_eq!(sim.terminate_calls(), 1);

        let oldest_record = store.get_instance(&oldest).unwrap().unwrap();
        assert_eq!(oldest_record.lifecycle, LifecycleState::Terminated);
        assert_eq!(store.capacity_counts().unwrap().warm, 1);
    }

    #[tokio::test]
    async fn promote_returns_oldest_first_and_clears_membership() {
        let (manager, store, _sim, _bus) = manager_with(2, 2);
        manager.reconcile_warm_pool().await.unwrap();
        let oldest = store.list_parked().unwrap()[0].id.clone();

        let promoted = manager.promote(1).unwrap();
        assert_eq!(promoted, vec![oldest.clone()]);

        let record = store.get_instance(&oldest).unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::Launching);
        assert_eq!(record.warm_pool, WarmPoolMembership::None);
        assert_eq!(store.capacity_counts().unwrap().warm, 1);
    }

    #[tokio::test]
    async fn promote_caps_at_available_entries() {
        let (manager, _store, _sim, _bus) = manager_with(1, 1);
        manager.reconcile_warm_pool().await.unwrap();

        let promoted = manager.promote(5).unwrap();
        assert_eq!(promoted.len(), 1);
        assert!(manager.promote(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn drained_pool_is_replenished_next_pass() {
        let (manager, store, _sim, _bus) = manager_with(1, 1);
        manager.reconcile_warm_pool().await.unwrap();
        manager.promote(1).unwrap();
        assert_eq!(store.capacity_counts().unwrap().warm, 0);

        let outcome = manager.reconcile_warm_pool().await.unwrap();
        assert_eq!(outcome.filled, 1);
        assert_eq!(store.capacity_counts().unwrap().warm, 1);
    }

    #[tokio::test]
    async fn fill_failure_publishes_launch_failed_event() {
        let (manager, store, sim, bus) = manager_with(1, 1);
        let mut sub = bus.subscribe(EventFilter::entering(LifecycleState::LaunchFailed));
        sim.fail_next_launches(10); // More than the retry policy allows.

        let outcome = manager.reconcile_warm_pool().await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(store.capacity_counts().unwrap().warm, 0);

        let event = sub.try_recv().unwrap().unwrap();
        assert_eq!(event.cause, EventCause::LaunchFailure);
    }

    #[tokio::test]
    async fn warm_events_are_published() {
        let (manager, _store, _sim, bus) = manager_with(1, 1);
        let mut sub = bus.subscribe(EventFilter::entering(LifecycleState::Warmed));

        manager.reconcile_warm_pool().await.unwrap();

        let event = sub.try_recv().unwrap().unwrap();
        assert_eq!(event.cause, EventCause::WarmPoolFill);
        assert_eq!(event.from_state, LifecycleState::Pending);
    }
}
