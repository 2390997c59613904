//! Logging sink — the default notification consumer.
//!
//! Subscribes to every lifecycle event and logs it with structured
//! fields, so alerting on transitions (including retry-exhaustion
//! failures) works out of the box by tailing the daemon's output.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleetgrid_state::LifecycleState;

use crate::bus::{BusError, EventFilter, NotificationBus};

/// Spawn a task that logs every event until `shutdown` flips.
pub fn spawn_log_sink(
    bus: &NotificationBus,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut sub = bus.subscribe(EventFilter::all());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = sub.recv() => match result {
                    Ok(event) => {
                        let failure = matches!(
                            event.to_state,
                            LifecycleState::LaunchFailed
                                | LifecycleState::TerminateFailed
                                | LifecycleState::Abandoned
                        );
                        if failure {
                            warn!(
                                instance_id = %event.instance_id,
                                from = %event.from_state,
                                to = %event.to_state,
                                cause = ?event.cause,
                                "instance lifecycle failure"
                            );
                        } else {
                            info!(
                                instance_id = %event.instance_id,
                                from = %event.from_state,
                                to = %event.to_state,
                                cause = ?event.cause,
                                "instance lifecycle transition"
                            );
                        }
                    }
                    Err(BusError::Lagged(n)) => {
                        warn!(dropped = n, "log sink lagged behind event bus");
                    }
                    Err(BusError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}
