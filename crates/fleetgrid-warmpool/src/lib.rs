//! fleetgrid-warmpool — the pre-provisioned reserve.
//!
//! Keeps a buffer of instances launched ahead of demand and parked out of
//! service, so a scale-out can promote a booted instance instead of paying
//! cold-launch latency. The pool reconciles toward its own target size
//! independently of desired capacity; promotion hands entries to the
//! scaler's launching path, which still runs the bootstrap handshake —
//! warming shortens boot time, it never bypasses the gate.

pub mod manager;

pub use manager::{WarmPoolError, WarmPoolManager, WarmPoolOutcome};
