//! Hold coordinator — registers, extends, resolves, and expires holds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_events::NotificationBus;
use fleetgrid_state::store::epoch_millis;
use fleetgrid_state::{
    EventCause, HoldRecord, InstanceId, LifecycleState, StateStore, WarmPoolMembership,
};

use crate::error::{HookError, HookOpResult};

/// Transition a hook gates. Only `Launching` is wired into the
/// controller; `Terminating` gates are structurally identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleTransition {
    Launching,
    Terminating,
}

/// Outcome an instance (or the expiry path) reports for a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookResult {
    /// Bootstrap succeeded; proceed to `InService`.
    Continue,
    /// Bootstrap failed or never confirmed; the instance is abandoned
    /// and will be terminated.
    Abandon,
}

/// What happened to a completion/heartbeat signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    /// The signal resolved (or extended) the hold.
    Applied,
    /// The hold was already resolved — logged and reported, never fatal.
    Duplicate,
}

/// Named gate configuration bound to one transition type.
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub name: String,
    pub transition: LifecycleTransition,
    /// Applied exactly once on deadline expiry with no callback.
    pub default_result: HookResult,
    /// Hold lifetime, reset by each heartbeat.
    pub heartbeat_timeout: Duration,
    /// Cap on total hold duration across heartbeat extensions; a
    /// misbehaving instance cannot hold the gate open indefinitely.
    pub max_hold: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            name: "launch-gate".to_string(),
            transition: LifecycleTransition::Launching,
            default_result: HookResult::Abandon,
            heartbeat_timeout: Duration::from_secs(300),
            max_hold: Duration::from_secs(1200),
        }
    }
}

/// Gates the `Launching → InService` transition behind the bootstrap
/// handshake.
pub struct LifecycleHookCoordinator {
    state: StateStore,
    bus: NotificationBus,
    config: HookConfig,
}

impl LifecycleHookCoordinator {
    pub fn new(state: StateStore, bus: NotificationBus, config: HookConfig) -> Self {
        Self { state, bus, config }
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    /// Place a hold on an instance entering `Launching`.
    ///
    /// The scaler calls this right after the lifecycle transition; the
    /// instance's bootstrap must call back before `deadline`.
    pub fn register_hold(&self, instance_id: &str) -> HookOpResult<HoldRecord> {
        let now = epoch_millis();
        let hold = HoldRecord {
            instance_id: instance_id.to_string(),
            registered_at_ms: now,
            deadline_ms: now + self.config.heartbeat_timeout.as_millis() as u64,
        };
        if !self.state.insert_hold(&hold)? {
            return Err(HookError::DuplicateHold(instance_id.to_string()));
        }
        debug!(
            %instance_id,
            hook = %self.config.name,
            deadline_ms = hold.deadline_ms,
            "hold registered"
        );
        Ok(hold)
    }

    /// Apply an explicit completion signal.
    ///
    /// A signal for an unknown or already-resolved hold returns
    /// [`SignalOutcome::Duplicate`]. A signal that arrives after the
    /// deadline does not win the race retroactively: the hold resolves
    /// with the default result and the caller is told `Duplicate`.
    pub fn complete(
        &self,
        instance_id: &str,
        result: HookResult,
    ) -> HookOpResult<SignalOutcome> {
        let Some(hold) = self.state.take_hold(instance_id)? else {
            info!(%instance_id, "completion signal for resolved hold, ignoring");
            return Ok(SignalOutcome::Duplicate);
        };

        if epoch_millis() > hold.deadline_ms {
            warn!(
                %instance_id,
                deadline_ms = hold.deadline_ms,
                "completion signal arrived after deadline, applying default result"
            );
            self.resolve(instance_id, self.config.default_result, EventCause::HookExpired)?;
            return Ok(SignalOutcome::Duplicate);
        }

        let cause = match result {
            HookResult::Continue => EventCause::HookCompleted,
            HookResult::Abandon => EventCause::HookAbandoned,
        };
        self.resolve(instance_id, result, cause)?;
        Ok(SignalOutcome::Applied)
    }

    /// Extend a hold's deadline, bounded by the maximum total hold
    /// duration.
    pub fn heartbeat(&self, instance_id: &str) -> HookOpResult<SignalOutcome> {
        let Some(hold) = self.state.get_hold(instance_id)? else {
            info!(%instance_id, "heartbeat for resolved hold, ignoring");
            return Ok(SignalOutcome::Duplicate);
        };

        let now = epoch_millis();
        if now > hold.deadline_ms {
            // Expiry owns this hold; the next tick resolves it.
            return Ok(SignalOutcome::Duplicate);
        }

        let cap = hold.registered_at_ms + self.config.max_hold.as_millis() as u64;
        let extended = HoldRecord {
            deadline_ms: (now + self.config.heartbeat_timeout.as_millis() as u64).min(cap),
            ..hold
        };

        match self.state.update_hold(&extended) {
            Ok(()) => {
                debug!(
                    %instance_id,
                    deadline_ms = extended.deadline_ms,
                    "hold deadline extended"
                );
                Ok(SignalOutcome::Applied)
            }
            // Resolved between get and update — the signal lost the race.
            Err(fleetgrid_state::StateError::NotFound(_)) => Ok(SignalOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    /// Expire every hold whose deadline has passed, applying the default
    /// result exactly once per hold.
    ///
    /// Returns the instance ids that were expired on this pass.
    pub fn expire_due(&self) -> HookOpResult<Vec<InstanceId>> {
        let now = epoch_millis();
        let mut expired = Vec::new();

        for hold in self.state.list_holds()? {
            if hold.deadline_ms > now {
                continue;
            }
            // A racing completion signal may have taken the hold since
            // the list; only the taker resolves.
            if self.state.take_hold(&hold.instance_id)?.is_none() {
                continue;
            }
            warn!(
                instance_id = %hold.instance_id,
                hook = %self.config.name,
                default_result = ?self.config.default_result,
                "hold expired without completion signal"
            );
            self.resolve(
                &hold.instance_id,
                self.config.default_result,
                EventCause::HookExpired,
            )?;
            expired.push(hold.instance_id);
        }

        Ok(expired)
    }

    /// Reload controller state after a restart.
    ///
    /// Pending holds are already durable; this additionally re-registers
    /// a hold for any `Launching` instance that lost its hold to a crash
    /// between the transition and the insert. Returns
    /// `(pending, restored)` counts.
    pub fn recover(&self) -> HookOpResult<(usize, usize)> {
        let holds = self.state.list_holds()?;
        let mut restored = 0;

        for record in self.state.list_instances()? {
            if record.lifecycle == LifecycleState::Launching
                && self.state.get_hold(&record.id)?.is_none()
            {
                self.register_hold(&record.id)?;
                restored += 1;
            }
        }

        info!(
            pending = holds.len(),
            restored,
            hook = %self.config.name,
            "launch gate recovered"
        );
        Ok((holds.len(), restored))
    }

    /// Run the expiry loop until shutdown.
    pub async fn run(&self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = tick.as_millis() as u64,
            hook = %self.config.name,
            "launch gate expiry loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    match self.expire_due() {
                        Ok(expired) if !expired.is_empty() => {
                            info!(count = expired.len(), "holds expired");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "hold expiry pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("launch gate expiry loop shutting down");
                    break;
                }
            }
        }
    }

    /// Apply a resolution to the instance record and publish the event.
    fn resolve(
        &self,
        instance_id: &str,
        result: HookResult,
        cause: EventCause,
    ) -> HookOpResult<()> {
        let (to, membership) = match result {
            HookResult::Continue => (LifecycleState::InService, WarmPoolMembership::None),
            HookResult::Abandon => (LifecycleState::Abandoned, WarmPoolMembership::None),
        };

        let (from, _) = self.state.transition_instance(
            instance_id,
            &[LifecycleState::Launching],
            to,
            |r| r.warm_pool = membership,
        )?;
        self.bus.emit(instance_id, from, to, cause);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_events::EventFilter;
    use fleetgrid_state::InstanceRecord;

    fn launching_instance(store: &StateStore, id: &str) {
        let mut record = InstanceRecord::new(id.to_string(), 1000);
        record.lifecycle = LifecycleState::Launching;
        store.put_instance(&record).unwrap();
    }

    fn coordinator_with(
        heartbeat_timeout: Duration,
        max_hold: Duration,
    ) -> (LifecycleHookCoordinator, StateStore, NotificationBus) {
        let store = StateStore::open_in_memory().unwrap();
        let bus = NotificationBus::new(64);
        let config = HookConfig {
            heartbeat_timeout,
            max_hold,
            ..HookConfig::default()
        };
        (
            LifecycleHookCoordinator::new(store.clone(), bus.clone(), config),
            store,
            bus,
        )
    }

    #[tokio::test]
    async fn continue_before_deadline_reaches_in_service() {
        let (coordinator, store, bus) =
            coordinator_with(Duration::from_secs(300), Duration::from_secs(1200));
        launching_instance(&store, "i-001");
        let mut sub = bus.subscribe(EventFilter::entering(LifecycleState::InService));

        coordinator.register_hold("i-001").unwrap();
        let outcome = coordinator.complete("i-001", HookResult::Continue).unwrap();

        assert_eq!(outcome, SignalOutcome::Applied);
        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::InService);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.cause, EventCause::HookCompleted);
    }

    #[tokio::test]
    async fn explicit_abandon_resolves_to_abandoned() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_secs(300), Duration::from_secs(1200));
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        let outcome = coordinator.complete("i-001", HookResult::Abandon).unwrap();

        assert_eq!(outcome, SignalOutcome::Applied);
        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::Abandoned);
    }

    #[tokio::test]
    async fn duplicate_hold_registration_is_rejected() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_secs(300), Duration::from_secs(1200));
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        assert!(matches!(
            coordinator.register_hold("i-001"),
            Err(HookError::DuplicateHold(_))
        ));
    }

    #[tokio::test]
    async fn second_completion_is_duplicate() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_secs(300), Duration::from_secs(1200));
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        assert_eq!(
            coordinator.complete("i-001", HookResult::Continue).unwrap(),
            SignalOutcome::Applied
        );
        assert_eq!(
            coordinator.complete("i-001", HookResult::Continue).unwrap(),
            SignalOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn expiry_applies_abandon_default() {
        let (coordinator, store, bus) =
            coordinator_with(Duration::from_millis(20), Duration::from_millis(100));
        launching_instance(&store, "i-001");
        let mut sub = bus.subscribe(EventFilter::entering(LifecycleState::Abandoned));

        coordinator.register_hold("i-001").unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let expired = coordinator.expire_due().unwrap();
        assert_eq!(expired, vec!["i-001".to_string()]);

        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::Abandoned);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.cause, EventCause::HookExpired);
    }

    #[tokio::test]
    async fn late_continue_never_promotes_abandoned_instance() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_millis(20), Duration::from_millis(100));
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        coordinator.expire_due().unwrap();

        let outcome = coordinator.complete("i-001", HookResult::Continue).unwrap();
        assert_eq!(outcome, SignalOutcome::Duplicate);

        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::Abandoned);
    }

    #[tokio::test]
    async fn late_signal_beats_tick_but_still_applies_default() {
        // The deadline passed but the expiry tick hasn't run yet; the
        // signal takes the hold, the default result is applied anyway.
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_millis(20), Duration::from_millis(100));
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let outcome = coordinator.complete("i-001", HookResult::Continue).unwrap();
        assert_eq!(outcome, SignalOutcome::Duplicate);
        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::Abandoned);

        // The later tick finds nothing to expire.
        assert!(coordinator.expire_due().unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_extends_deadline() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_millis(50), Duration::from_secs(10));
        launching_instance(&store, "i-001");

        let hold = coordinator.register_hold("i-001").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            coordinator.heartbeat("i-001").unwrap(),
            SignalOutcome::Applied
        );
        let extended = store.get_hold("i-001").unwrap().unwrap();
        assert!(extended.deadline_ms > hold.deadline_ms);
    }

    #[tokio::test]
    async fn heartbeat_is_capped_by_max_hold() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_millis(50), Duration::from_millis(60));
        launching_instance(&store, "i-001");

        let hold = coordinator.register_hold("i-001").unwrap();
        coordinator.heartbeat("i-001").unwrap();

        let extended = store.get_hold("i-001").unwrap().unwrap();
        assert!(extended.deadline_ms <= hold.registered_at_ms + 60);
    }

    #[tokio::test]
    async fn heartbeat_after_resolution_is_duplicate() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_secs(300), Duration::from_secs(1200));
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        coordinator.complete("i-001", HookResult::Continue).unwrap();

        assert_eq!(
            coordinator.heartbeat("i-001").unwrap(),
            SignalOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn concurrent_completion_and_expiry_resolve_once() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_millis(20), Duration::from_millis(100));
        let coordinator = std::sync::Arc::new(coordinator);
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let a = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.complete("i-001", HookResult::Continue).unwrap() })
        };
        let b = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.expire_due().unwrap() })
        };
        let (signal, expired) = (a.await.unwrap(), b.await.unwrap());

        // Exactly one path resolved the hold.
        let signal_won = signal == SignalOutcome::Duplicate && expired.is_empty();
        let expiry_won = expired == vec!["i-001".to_string()];
        assert!(signal_won || expiry_won);

        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::Abandoned);
    }

    #[tokio::test]
    async fn fail_open_default_promotes_on_expiry() {
        let store = StateStore::open_in_memory().unwrap();
        let bus = NotificationBus::new(16);
        let config = HookConfig {
            default_result: HookResult::Continue,
            heartbeat_timeout: Duration::from_millis(20),
            max_hold: Duration::from_millis(100),
            ..HookConfig::default()
        };
        let coordinator = LifecycleHookCoordinator::new(store.clone(), bus, config);
        launching_instance(&store, "i-001");

        coordinator.register_hold("i-001").unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        coordinator.expire_due().unwrap();

        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::InService);
    }

    #[tokio::test]
    async fn recover_restores_hold_for_orphaned_launching_instance() {
        let (coordinator, store, _bus) =
            coordinator_with(Duration::from_secs(300), Duration::from_secs(1200));
        launching_instance(&store, "i-001"); // Launching, no hold.
        launching_instance(&store, "i-002");
        coordinator.register_hold("i-002").unwrap();

        let (pending, restored) = coordinator.recover().unwrap();
        assert_eq!(pending, 1);
        assert_eq!(restored, 1);
        assert!(store.get_hold("i-001").unwrap().is_some());
    }
}
