//! fleetgrid-health — debounced instance health tracking.
//!
//! Consumes target-health observations (polled from the load balancer or
//! pushed in) and records debounced status changes in the registry. Two
//! consecutive unhealthy observations flip an instance to `Unhealthy`;
//! a single healthy one recovers it. The monitor only ever writes health
//! status — deregistration is the registrar's job and replacement is the
//! scaler's; it never terminates instances.

pub mod monitor;
pub mod tracker;

pub use monitor::HealthMonitor;
pub use tracker::HealthTracker;
