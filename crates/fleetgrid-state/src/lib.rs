//! fleetgrid-state — the instance registry.
//!
//! Durable, single-source-of-truth record of every instance the controller
//! knows about: lifecycle state, warm-pool membership, health, and the
//! pending launch-gate holds. Backed by redb with JSON-serialized values;
//! an in-memory backend is available for tests.
//!
//! All lifecycle mutations go through [`StateStore::transition_instance`],
//! a compare-and-set against the instance's current state. Concurrent
//! writers that lose the race get [`StateError::Conflict`] and must re-read
//! rather than clobber.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{CapacityCounts, StateStore};
pub use types::*;
