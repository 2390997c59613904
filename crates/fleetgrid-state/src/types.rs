//! Domain types for the FleetGrid registry.
//!
//! These types represent the persisted state of the scaling group: instance
//! records, group capacity configuration, launch-gate holds, and the
//! lifecycle events published on every transition. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Opaque, provider-assigned instance identifier. Never reused.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a single compute instance.
///
/// An instance holds exactly one state at any time. Terminated ids are
/// never resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Launch requested, provider has confirmed, bootstrap not yet gated.
    Pending,
    /// Behind the launch gate, waiting for the bootstrap handshake.
    Launching,
    /// Serving traffic (subject to health).
    InService,
    /// Parked in the warm pool, not serving.
    Warmed,
    /// Termination requested at the provider.
    Terminating,
    /// Provider confirmed termination. Terminal.
    Terminated,
    /// Launch gate expired or bootstrap reported failure. Always terminated,
    /// never retried in place.
    Abandoned,
    /// Launch retries exhausted. Terminal.
    LaunchFailed,
    /// Terminate retries exhausted. Surfaced for alerting, not retried.
    TerminateFailed,
}

impl LifecycleState {
    /// Stable string form, used in event dedupe keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Launching => "launching",
            Self::InService => "in_service",
            Self::Warmed => "warmed",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Abandoned => "abandoned",
            Self::LaunchFailed => "launch_failed",
            Self::TerminateFailed => "terminate_failed",
        }
    }

    /// States with no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::LaunchFailed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warm-pool membership of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WarmPoolMembership {
    /// Not part of the warm pool.
    #[default]
    None,
    /// Parked in the pool, awaiting promotion.
    Parked,
    /// Being handed from the pool to the in-service launch path.
    Promoting,
}

/// Health status as recorded by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// State a warm-pool instance is parked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParkedState {
    #[default]
    Stopped,
    Running,
    Hibernated,
}

/// Registry record for one compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub lifecycle: LifecycleState,
    pub warm_pool: WarmPoolMembership,
    pub health: HealthStatus,
    /// Unix timestamp (seconds) when the provider confirmed the launch.
    pub launched_at: u64,
    /// Unix timestamp (seconds) of the last lifecycle transition.
    pub last_transition_at: u64,
}

impl InstanceRecord {
    /// A freshly launched instance: `Pending`, no pool membership,
    /// health unknown.
    pub fn new(id: InstanceId, now: u64) -> Self {
        Self {
            id,
            lifecycle: LifecycleState::Pending,
            warm_pool: WarmPoolMembership::None,
            health: HealthStatus::Unknown,
            launched_at: now,
            last_transition_at: now,
        }
    }

    /// Whether this instance counts toward in-service-track capacity:
    /// launched or launching toward service, not parked or promoting.
    pub fn is_pending_launch(&self) -> bool {
        matches!(
            self.lifecycle,
            LifecycleState::Pending | LifecycleState::Launching
        ) && self.warm_pool == WarmPoolMembership::None
    }

    /// Whether this instance is a parked warm-pool entry.
    pub fn is_parked(&self) -> bool {
        self.lifecycle == LifecycleState::Warmed
            && self.warm_pool == WarmPoolMembership::Parked
    }
}

// ── Group configuration ───────────────────────────────────────────

/// Warm-pool sizing and park state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarmPoolConfig {
    /// Number of parked instances to maintain.
    pub target_size: u32,
    /// Hard cap on parked instances.
    pub max_size: u32,
    /// State instances are parked in.
    pub parked_state: ParkedState,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            target_size: 1,
            max_size: 1,
            parked_state: ParkedState::Running,
        }
    }
}

/// Desired/min/max capacity envelope for the scaling group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    pub min_capacity: u32,
    pub desired_capacity: u32,
    pub max_capacity: u32,
    pub warm_pool: WarmPoolConfig,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            min_capacity: 3,
            desired_capacity: 3,
            max_capacity: 6,
            warm_pool: WarmPoolConfig::default(),
        }
    }
}

impl GroupConfig {
    /// Check the capacity envelope. Violations are rejected at the
    /// boundary, never silently clamped.
    pub fn validate(&self) -> Result<(), crate::error::StateError> {
        use crate::error::StateError;

        if self.min_capacity > self.max_capacity {
            return Err(StateError::InvalidConfig(format!(
                "min_capacity {} exceeds max_capacity {}",
                self.min_capacity, self.max_capacity
            )));
        }
        if self.desired_capacity < self.min_capacity
            || self.desired_capacity > self.max_capacity
        {
            return Err(StateError::CapacityExceeded(format!(
                "desired_capacity {} outside [{}, {}]",
                self.desired_capacity, self.min_capacity, self.max_capacity
            )));
        }
        if self.warm_pool.target_size > self.warm_pool.max_size {
            return Err(StateError::InvalidConfig(format!(
                "warm pool target_size {} exceeds max_size {}",
                self.warm_pool.target_size, self.warm_pool.max_size
            )));
        }
        Ok(())
    }
}

// ── Launch-gate holds ─────────────────────────────────────────────

/// A pending hold placed on an instance entering `Launching`.
///
/// Persisted so that holds survive controller restarts; recovered holds
/// whose deadline passed while the controller was down expire on the
/// first coordinator tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoldRecord {
    pub instance_id: InstanceId,
    /// Unix timestamp (milliseconds) when the hold was registered.
    pub registered_at_ms: u64,
    /// Unix timestamp (milliseconds) when the hold expires.
    pub deadline_ms: u64,
}

// ── Lifecycle events ──────────────────────────────────────────────

/// The actor/reason behind a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCause {
    ScaleOut,
    ScaleIn,
    HookCompleted,
    HookAbandoned,
    HookExpired,
    HealthCheck,
    WarmPoolFill,
    WarmPoolShrink,
    Promotion,
    LaunchFailure,
    TerminateFailure,
}

/// Immutable record published on every state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub instance_id: InstanceId,
    pub from_state: LifecycleState,
    pub to_state: LifecycleState,
    /// Unix timestamp (milliseconds) when the transition was recorded.
    pub timestamp_ms: u64,
    pub cause: EventCause,
}

impl LifecycleEvent {
    /// Identity under at-least-once delivery: subscribers observing a
    /// duplicate `{instance, to_state}` pair must treat it as already seen.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.instance_id, self.to_state.as_str())
    }
}
