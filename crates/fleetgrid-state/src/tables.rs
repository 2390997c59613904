//! redb table definitions for the FleetGrid registry.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Instances and holds are keyed by instance id; the group
//! configuration is a single row under a fixed key.

use redb::TableDefinition;

/// Instance records keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Pending launch-gate holds keyed by `{instance_id}`.
pub const HOLDS: TableDefinition<&str, &[u8]> = TableDefinition::new("holds");

/// Scaling group configuration, single row under [`GROUP_KEY`].
pub const GROUP: TableDefinition<&str, &[u8]> = TableDefinition::new("group");

/// Key of the single group configuration row.
pub const GROUP_KEY: &str = "config";
