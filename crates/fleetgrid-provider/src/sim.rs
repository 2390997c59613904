//! SimCloud — in-memory provider and target group.
//!
//! Deterministic instance ids, injectable failures, and call counters so
//! tests can assert idempotence (a second reconcile pass issues zero
//! provider calls) without any network dependency. Also backs local
//! `fleetd` runs until a real cloud backend is wired in.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use fleetgrid_state::{HealthStatus, InstanceId};

use crate::error::{ProviderError, ProviderResult};
use crate::{CloudProvider, DescribedInstance, LaunchSpec, RemoteState, TargetGroup};

#[derive(Default)]
struct SimState {
    counter: u64,
    instances: HashMap<InstanceId, RemoteState>,
    registered: BTreeSet<InstanceId>,
    target_health: HashMap<InstanceId, HealthStatus>,
    fail_launches: u32,
    fail_terminates: u32,
    fail_registrations: u32,
    launch_calls: u32,
    terminate_calls: u32,
    register_calls: u32,
    deregister_calls: u32,
}

/// Simulated cloud: instances "boot" instantly, failures only happen when
/// injected.
#[derive(Default)]
pub struct SimCloud {
    state: Mutex<SimState>,
}

impl SimCloud {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Failure injection ──────────────────────────────────────────

    /// Fail the next `n` launch calls with `Unavailable`.
    pub fn fail_next_launches(&self, n: u32) {
        self.state.lock().unwrap().fail_launches = n;
    }

    /// Fail the next `n` terminate calls with `Unavailable`.
    pub fn fail_next_terminates(&self, n: u32) {
        self.state.lock().unwrap().fail_terminates = n;
    }

    /// Fail the next `n` register/deregister calls with `Unavailable`.
    pub fn fail_next_registrations(&self, n: u32) {
        self.state.lock().unwrap().fail_registrations = n;
    }

    /// Override the reported target health for an instance.
    pub fn set_target_health(&self, id: &str, status: HealthStatus) {
        self.state
            .lock()
            .unwrap()
            .target_health
            .insert(id.to_string(), status);
    }

    // ── Call counters ──────────────────────────────────────────────

    pub fn launch_calls(&self) -> u32 {
        self.state.lock().unwrap().launch_calls
    }

    pub fn terminate_calls(&self) -> u32 {
        self.state.lock().unwrap().terminate_calls
    }

    pub fn register_calls(&self) -> u32 {
        self.state.lock().unwrap().register_calls
    }

    pub fn deregister_calls(&self) -> u32 {
        self.state.lock().unwrap().deregister_calls
    }

    /// Ids of instances the provider considers running.
    pub fn running_instances(&self) -> Vec<InstanceId> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .iter()
            .filter(|(_, s)| **s == RemoteState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl CloudProvider for SimCloud {
    async fn launch_instance(&self, _spec: &LaunchSpec) -> ProviderResult<InstanceId> {
        let mut state = self.state.lock().unwrap();
        state.launch_calls += 1;
        if state.fail_launches > 0 {
            state.fail_launches -= 1;
            return Err(ProviderError::Unavailable("injected launch failure".into()));
        }
        state.counter += 1;
        let id = format!("i-{:06}", state.counter);
        state.instances.insert(id.clone(), RemoteState::Running);
        Ok(id)
    }

    async fn terminate_instance(&self, id: &InstanceId) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state.terminate_calls += 1;
        if state.fail_terminates > 0 {
            state.fail_terminates -= 1;
            return Err(ProviderError::Unavailable(
                "injected terminate failure".into(),
            ));
        }
        match state.instances.get_mut(id) {
            Some(remote) => {
                *remote = RemoteState::Terminated;
                Ok(())
            }
            None => Err(ProviderError::NotFound(id.clone())),
        }
    }

    async fn describe_instances(&self) -> ProviderResult<Vec<DescribedInstance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .iter()
            .map(|(id, s)| DescribedInstance {
                id: id.clone(),
                state: *s,
            })
            .collect())
    }
}

#[async_trait]
impl TargetGroup for SimCloud {
    async fn register_targets(&self, ids: &[InstanceId]) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state.register_calls += 1;
        if state.fail_registrations > 0 {
            state.fail_registrations -= 1;
            return Err(ProviderError::Unavailable(
                "injected registration failure".into(),
            ));
        }
        for id in ids {
            state.registered.insert(id.clone());
        }
        Ok(())
    }

    async fn deregister_targets(&self, ids: &[InstanceId]) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state.deregister_calls += 1;
        if state.fail_registrations > 0 {
            state.fail_registrations -= 1;
            return Err(ProviderError::Unavailable(
                "injected deregistration failure".into(),
            ));
        }
        for id in ids {
            state.registered.remove(id);
        }
        Ok(())
    }

    async fn describe_target_health(
        &self,
    ) -> ProviderResult<HashMap<InstanceId, HealthStatus>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .registered
            .iter()
            .map(|id| {
                let status = state
                    .target_health
                    .get(id)
                    .copied()
                    .unwrap_or(HealthStatus::Healthy);
                (id.clone(), status)
            })
            .collect())
    }

    async fn registered_targets(&self) -> ProviderResult<Vec<InstanceId>> {
        let state = self.state.lock().unwrap();
        Ok(state.registered.iter().cloned().collect())
    }
}
