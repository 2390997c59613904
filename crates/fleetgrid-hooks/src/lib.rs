//! fleetgrid-hooks — the bootstrap launch gate.
//!
//! A newly launched instance sits in `Launching` behind a hold until its
//! bootstrap calls back with a completion signal, sends heartbeats to buy
//! time, or the hold deadline expires and the hook's default result is
//! applied. The default is `Abandon` (fail-closed): an instance that never
//! confirms a successful bootstrap must not receive traffic.
//!
//! Completion signals, heartbeats, and deadline expiry race; a hold
//! resolves exactly once. The pending-hold table in the registry is the
//! arbiter — whoever atomically takes the hold applies the resolution,
//! every later signal observes [`SignalOutcome::Duplicate`] and is
//! reported, not errored.

pub mod coordinator;
pub mod error;

pub use coordinator::{
    HookConfig, HookResult, LifecycleHookCoordinator, LifecycleTransition, SignalOutcome,
};
pub use error::{HookError, HookOpResult};
