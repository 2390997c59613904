//! Broadcast bus for lifecycle events.

use std::collections::HashSet;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use fleetgrid_state::store::epoch_millis;
use fleetgrid_state::{EventCause, InstanceId, LifecycleEvent, LifecycleState};

/// Errors observed by a subscriber.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    /// The bus (all publishers) has been dropped.
    #[error("notification bus closed")]
    Closed,

    /// The subscriber fell behind and `{0}` events were discarded.
    /// The subscriber should re-read the registry to catch up.
    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),
}

/// Subscription filter: `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub instance_id: Option<InstanceId>,
    pub to_state: Option<LifecycleState>,
}

impl EventFilter {
    /// Match all events.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match events for one instance.
    pub fn for_instance(id: impl Into<InstanceId>) -> Self {
        Self {
            instance_id: Some(id.into()),
            to_state: None,
        }
    }

    /// Match events entering one state.
    pub fn entering(state: LifecycleState) -> Self {
        Self {
            instance_id: None,
            to_state: Some(state),
        }
    }

    fn matches(&self, event: &LifecycleEvent) -> bool {
        if let Some(ref id) = self.instance_id
            && *id != event.instance_id
        {
            return false;
        }
        if let Some(state) = self.to_state
            && state != event.to_state
        {
            return false;
        }
        true
    }
}

/// Publishes lifecycle events to all current subscribers.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl NotificationBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an already-built event.
    ///
    /// A bus with no subscribers is not an error — the registry remains
    /// the source of truth; events are a notification channel.
    pub fn publish(&self, event: LifecycleEvent) {
        debug!(
            instance_id = %event.instance_id,
            from = %event.from_state,
            to = %event.to_state,
            cause = ?event.cause,
            "lifecycle event"
        );
        let _ = self.tx.send(event);
    }

    /// Build, publish, and return a transition event stamped with the
    /// current time.
    pub fn emit(
        &self,
        instance_id: &str,
        from_state: LifecycleState,
        to_state: LifecycleState,
        cause: EventCause,
    ) -> LifecycleEvent {
        let event = LifecycleEvent {
            instance_id: instance_id.to_string(),
            from_state,
            to_state,
            timestamp_ms: epoch_millis(),
            cause,
        };
        self.publish(event.clone());
        event
    }

    /// Publish a failure event for a launch request that exhausted its
    /// retries before the provider ever assigned an id.
    pub fn emit_launch_failure(&self) -> LifecycleEvent {
        let now = epoch_millis();
        let event = LifecycleEvent {
            instance_id: format!("unassigned-{now}"),
            from_state: LifecycleState::Pending,
            to_state: LifecycleState::LaunchFailed,
            timestamp_ms: now,
            cause: EventCause::LaunchFailure,
        };
        self.publish(event.clone());
        event
    }

    /// Subscribe with a filter. Events published before this call are not
    /// replayed.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A filtered event stream.
pub struct Subscription {
    rx: broadcast::Receiver<LifecycleEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Receive the next matching event.
    ///
    /// Lag is reported, not swallowed: the caller decides whether to
    /// re-read the registry.
    pub async fn recv(&mut self) -> Result<LifecycleEvent, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(BusError::Lagged(n));
                }
            }
        }
    }

    /// Non-blocking receive; `Ok(None)` when no event is queued.
    pub fn try_recv(&mut self) -> Result<Option<LifecycleEvent>, BusError> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusError::Closed),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Err(BusError::Lagged(n));
                }
            }
        }
    }
}

/// Dedupe helper for at-least-once consumers: tracks
/// `{instance_id, to_state}` identities already seen.
#[derive(Debug, Default)]
pub struct SeenEvents {
    keys: HashSet<String>,
}

impl SeenEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event. Returns `true` if it was new, `false` for a
    /// duplicate delivery.
    pub fn insert(&mut self, event: &LifecycleEvent) -> bool {
        self.keys.insert(event.dedupe_key())
    }
}
