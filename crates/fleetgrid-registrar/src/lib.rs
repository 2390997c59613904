//! fleetgrid-registrar — keeps the traffic target set consistent with
//! the registry.
//!
//! Computes the set of instances that should receive traffic (serving
//! and not unhealthy), diffs it against what the load balancer reports
//! as registered, and issues the minimal add/remove delta. Registrar
//! failures are retried and never block capacity reconciliation —
//! registration lag is tolerated, capacity correctness is not.

pub mod registrar;

pub use registrar::{RegistrarError, SyncDelta, TargetGroupRegistrar};
