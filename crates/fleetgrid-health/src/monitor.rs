//! Health monitor — feeds observations into per-instance trackers and
//! records debounced changes in the registry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_provider::DynTargetGroup;
use fleetgrid_state::{HealthStatus, InstanceId, LifecycleState, StateResult, StateStore};

use crate::tracker::HealthTracker;

/// Polls target health and accepts pushed observations.
///
/// Writes only the `health` field of instance records; the registrar and
/// scaler act on what it records.
pub struct HealthMonitor {
    state: StateStore,
    target_group: DynTargetGroup,
    trackers: Mutex<HashMap<InstanceId, HealthTracker>>,
    unhealthy_threshold: u32,
}

impl HealthMonitor {
    pub fn new(state: StateStore, target_group: DynTargetGroup) -> Self {
        Self {
            state,
            target_group,
            trackers: Mutex::new(HashMap::new()),
            unhealthy_threshold: 2,
        }
    }

    /// Override the unhealthy debounce threshold.
    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    /// Feed one observation (push path).
    ///
    /// Returns the debounced status if it changed the registry record.
    /// Observations for instances the registry doesn't know (or that are
    /// no longer serving) are dropped.
    pub fn observe(
        &self,
        instance_id: &str,
        observed: HealthStatus,
    ) -> StateResult<Option<HealthStatus>> {
        let Some(record) = self.state.get_instance(instance_id)? else {
            debug!(%instance_id, "health observation for unknown instance, dropped");
            return Ok(None);
        };
        if record.lifecycle != LifecycleState::InService {
            return Ok(None);
        }

        let debounced = {
            let mut trackers = self.trackers.lock().unwrap();
            trackers
                .entry(instance_id.to_string())
                .or_insert_with(|| HealthTracker::with_thresholds(self.unhealthy_threshold, 1))
                .record(observed)
        };

        if debounced == record.health || debounced == HealthStatus::Unknown {
            return Ok(None);
        }

        self.state.update_health(instance_id, debounced)?;
        if debounced == HealthStatus::Unhealthy {
            warn!(
                %instance_id,
                "instance marked unhealthy, eligible for deregistration and replacement"
            );
        } else {
            info!(%instance_id, "instance recovered to healthy");
        }
        Ok(Some(debounced))
    }

    /// Pull a target-health snapshot and feed every entry (poll path).
    pub async fn poll_once(&self) -> StateResult<()> {
        let health = match self.target_group.describe_target_health().await {
            Ok(health) => health,
            Err(e) => {
                warn!(error = %e, "target health poll failed, keeping last known state");
                return Ok(());
            }
        };

        for (instance_id, status) in health {
            self.observe(&instance_id, status)?;
        }

        // Trackers for instances that left the registry can be dropped.
        self.prune_trackers()?;
        Ok(())
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            threshold = self.unhealthy_threshold,
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "health poll pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    fn prune_trackers(&self) -> StateResult<()> {
        let serving: std::collections::HashSet<InstanceId> = self
            .state
            .list_instances()?
            .into_iter()
            .filter(|r| r.lifecycle == LifecycleState::InService)
            .map(|r| r.id)
            .collect();
        self.trackers
            .lock()
            .unwrap()
            .retain(|id, _| serving.contains(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleetgrid_provider::sim::SimCloud;
    use fleetgrid_provider::TargetGroup;
    use fleetgrid_state::InstanceRecord;

    fn in_service_instance(store: &StateStore, id: &str) {
        let mut record = InstanceRecord::new(id.to_string(), 1000);
        record.lifecycle = LifecycleState::InService;
        record.health = HealthStatus::Healthy;
        store.put_instance(&record).unwrap();
    }

    fn monitor_with_sim() -> (HealthMonitor, StateStore, Arc<SimCloud>) {
        let store = StateStore::open_in_memory().unwrap();
        let sim = Arc::new(SimCloud::new());
        let monitor = HealthMonitor::new(store.clone(), sim.clone());
        (monitor, store, sim)
    }

    #[tokio::test]
    async fn one_unhealthy_observation_is_debounced() {
        let (monitor, store, _sim) = monitor_with_sim();
        in_service_instance(&store, "i-001");

        let changed = monitor.observe("i-001", HealthStatus::Unhealthy).unwrap();
        assert_eq!(changed, None);
        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn two_unhealthy_observations_mark_the_record() {
        let (monitor, store, _sim) = monitor_with_sim();
        in_service_instance(&store, "i-001");

        monitor.observe("i-001", HealthStatus::Unhealthy).unwrap();
        let changed = monitor.observe("i-001", HealthStatus::Unhealthy).unwrap();
        assert_eq!(changed, Some(HealthStatus::Unhealthy));

        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.health, HealthStatus::Unhealthy);
        // Lifecycle untouched — replacement is the scaler's call.
        assert_eq!(record.lifecycle, LifecycleState::InService);
    }

    #[tokio::test]
    async fn recovery_writes_healthy_back() {
        let (monitor, store, _sim) = monitor_with_sim();
        in_service_instance(&store, "i-001");

        monitor.observe("i-001", HealthStatus::Unhealthy).unwrap();
        monitor.observe("i-001", HealthStatus::Unhealthy).unwrap();
        let changed = monitor.observe("i-001", HealthStatus::Healthy).unwrap();
        assert_eq!(changed, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn observations_for_unknown_instances_are_dropped() {
        let (monitor, _store, _sim) = monitor_with_sim();
        assert_eq!(
            monitor.observe("i-404", HealthStatus::Unhealthy).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn observations_for_non_serving_instances_are_dropped() {
        let (monitor, store, _sim) = monitor_with_sim();
        store
            .put_instance(&InstanceRecord::new("i-001".to_string(), 1000))
            .unwrap(); // Pending

        assert_eq!(
            monitor.observe("i-001", HealthStatus::Unhealthy).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn poll_once_feeds_target_health() {
        let (monitor, store, sim) = monitor_with_sim();
        in_service_instance(&store, "i-001");
        sim.register_targets(&["i-001".to_string()]).await.unwrap();
        sim.set_target_health("i-001", HealthStatus::Unhealthy);

        monitor.poll_once().await.unwrap();
        monitor.poll_once().await.unwrap();

        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn poll_survives_target_group_outage() {
        let (monitor, store, sim) = monitor_with_sim();
        in_service_instance(&store, "i-001");
        sim.fail_next_registrations(0);

        // No registered targets at all — poll is a no-op, not an error.
        monitor.poll_once().await.unwrap();
        let record = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(record.health, HealthStatus::Healthy);
    }
}
