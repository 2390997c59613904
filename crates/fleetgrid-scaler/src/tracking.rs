//! Target tracking — proposes desired capacity from observed utilization.
//!
//! Mirrors a CPU target-tracking policy: when the average utilization
//! drifts past the target (with headroom), propose a proportionally
//! scaled instance count, clamped to the group envelope and rate-limited
//! by cooldown windows. The tracker only proposes; applying the proposal
//! goes through the validated group-config path.

use std::time::Duration;

use tracing::debug;

use fleetgrid_state::store::epoch_secs;
use fleetgrid_state::GroupConfig;

/// A capacity proposal for the scaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackDecision {
    /// Set desired capacity to this value.
    ScaleTo(u32),
    /// Utilization is near target, or a cooldown is active.
    NoChange,
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Utilization target (e.g. 50.0 for 50% average CPU).
    pub target_value: f64,
    /// Cooldown after a scale-up proposal.
    pub scale_up_window: Duration,
    /// Cooldown after a scale-down proposal.
    pub scale_down_window: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            target_value: 50.0,
            scale_up_window: Duration::from_secs(60),
            scale_down_window: Duration::from_secs(300),
        }
    }
}

/// Evaluates utilization observations against the target.
pub struct TargetTracker {
    config: TrackingConfig,
    last_scale_up: u64,
    last_scale_down: u64,
}

impl TargetTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            last_scale_up: 0,
            last_scale_down: 0,
        }
    }

    /// Evaluate one utilization observation.
    ///
    /// `observed` is the group-wide average of the tracked metric;
    /// `group` supplies the current desired capacity and the envelope.
    pub fn evaluate(&mut self, observed: f64, group: &GroupConfig) -> TrackDecision {
        let target = self.config.target_value;
        let current = group.desired_capacity;
        let now = epoch_secs();

        // Scale up: observed exceeds target with 10% headroom.
        if observed > target * 1.1
            && now - self.last_scale_up >= self.config.scale_up_window.as_secs()
        {
            let ratio = observed / target;
            let proposed = ((current as f64) * ratio).ceil() as u32;
            let clamped = proposed.min(group.max_capacity);

            if clamped > current {
                self.last_scale_up = now;
                debug!(
                    from = current,
                    to = clamped,
                    observed,
                    target,
                    "target tracker proposing scale up"
                );
                return TrackDecision::ScaleTo(clamped);
            }
        }

        // Scale down: observed is well below target.
        if observed < target * 0.5
            && current > group.min_capacity
            && now - self.last_scale_down >= self.config.scale_down_window.as_secs()
        {
            let ratio = observed / target;
            let proposed = ((current as f64) * ratio).ceil().max(1.0) as u32;
            let clamped = proposed.max(group.min_capacity);

            if clamped < current {
                self.last_scale_down = now;
                debug!(
                    from = current,
                    to = clamped,
                    observed,
                    target,
                    "target tracker proposing scale down"
                );
                return TrackDecision::ScaleTo(clamped);
            }
        }

        TrackDecision::NoChange
    }
}
