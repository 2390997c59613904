//! fleetgrid-events — the notification bus.
//!
//! Broadcast fan-out of [`LifecycleEvent`]s to any number of subscribers
//! (alerting, logging, tests). Delivery is at-least-once from a consumer's
//! point of view: a slow subscriber that overruns its buffer is told how
//! many events it lost (and is expected to re-read the registry), and
//! duplicates are legal — consumers dedupe by
//! [`LifecycleEvent::dedupe_key`]. Events for one instance arrive in
//! transition order because every transition has a single writer; no
//! ordering is promised across instances.

pub mod bus;
pub mod sink;

pub use bus::{BusError, EventFilter, NotificationBus, SeenEvents, Subscription};
pub use sink::spawn_log_sink;
