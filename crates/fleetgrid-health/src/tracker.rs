//! Debouncing tracker for a single instance's health observations.

use tracing::{debug, warn};

use fleetgrid_state::HealthStatus;

/// Tracks consecutive observations and flips status only past the
/// configured thresholds, so a single flapping probe doesn't trigger
/// deregistration and replacement.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_unhealthy: u32,
    consecutive_healthy: u32,
    /// Unhealthy observations needed before flipping to `Unhealthy`.
    unhealthy_threshold: u32,
    /// Healthy observations needed to recover.
    healthy_threshold: u32,
}

impl HealthTracker {
    /// Default debounce: two consecutive unhealthy observations mark an
    /// instance unhealthy, one healthy observation recovers it.
    pub fn new() -> Self {
        Self::with_thresholds(2, 1)
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_unhealthy: 0,
            consecutive_healthy: 0,
            unhealthy_threshold,
            healthy_threshold,
        }
    }

    /// Record an observation and return the (possibly unchanged) status.
    pub fn record(&mut self, observed: HealthStatus) -> HealthStatus {
        match observed {
            HealthStatus::Healthy => {
                self.consecutive_unhealthy = 0;
                self.consecutive_healthy += 1;
                if self.consecutive_healthy >= self.healthy_threshold {
                    if self.status != HealthStatus::Healthy {
                        debug!(
                            observations = self.consecutive_healthy,
                            "instance recovered to healthy"
                        );
                    }
                    self.status = HealthStatus::Healthy;
                }
            }
            HealthStatus::Unhealthy => {
                self.consecutive_healthy = 0;
                self.consecutive_unhealthy += 1;
                if self.consecutive_unhealthy >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            observations = self.consecutive_unhealthy,
                            threshold = self.unhealthy_threshold,
                            "instance debounced to unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
            // An unknown observation (target mid-registration) resets
            // neither counter and never changes status.
            HealthStatus::Unknown => {}
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_unhealthy(&self) -> u32 {
        self.consecutive_unhealthy
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
