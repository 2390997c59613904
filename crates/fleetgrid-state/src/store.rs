//! StateStore — redb-backed registry for the scaling group.
//!
//! Provides typed CRUD over instance records, launch-gate holds, and the
//! group configuration. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Lifecycle mutations are compare-and-set: [`StateStore::transition_instance`]
//! applies a transition only if the instance is currently in one of the
//! expected states, inside a single write transaction.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Capacity counters derived from a registry scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapacityCounts {
    /// Instances currently serving (`InService`).
    pub in_service: u32,
    /// Instances on the in-service launch track (`Pending`/`Launching`,
    /// not pool members).
    pub pending_launch: u32,
    /// Parked warm-pool entries.
    pub warm: u32,
}

impl CapacityCounts {
    /// Instances that count against `desired_capacity`.
    pub fn in_service_track(&self) -> u32 {
        self.in_service + self.pending_launch
    }
}

/// Thread-safe registry backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory registry opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(HOLDS).map_err(map_err!(Table))?;
        txn.open_table(GROUP).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or overwrite an instance record.
    ///
    /// Used when the provider confirms a launch; subsequent mutations
    /// should go through [`Self::transition_instance`].
    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %record.id, state = %record.lifecycle, "instance recorded");
        Ok(())
    }

    /// Get an instance by id.
    pub fn get_instance(&self, id: &str) -> StateResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all instance records.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Apply a lifecycle transition if the instance is in one of the
    /// expected states.
    ///
    /// The whole read-check-write runs in a single write transaction.
    /// `mutate` can adjust membership/health alongside the transition;
    /// `last_transition_at` is stamped by the store. Returns the prior
    /// state and the updated record.
    pub fn transition_instance(
        &self,
        id: &str,
        expected: &[LifecycleState],
        to: LifecycleState,
        mutate: impl FnOnce(&mut InstanceRecord),
    ) -> StateResult<(LifecycleState, InstanceRecord)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        let from;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut record: InstanceRecord = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(id.to_string())),
            };

            if !expected.contains(&record.lifecycle) {
                return Err(StateError::Conflict {
                    id: id.to_string(),
                    expected: expected.to_vec(),
                    actual: record.lifecycle,
                });
            }

            from = record.lifecycle;
            record.lifecycle = to;
            record.last_transition_at = epoch_secs();
            mutate(&mut record);

            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            updated = record;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, %from, to = %updated.lifecycle, "instance transition");
        Ok((from, updated))
    }

    /// Update an instance's health status without a lifecycle transition.
    ///
    /// Returns the prior status and the updated record.
    pub fn update_health(
        &self,
        id: &str,
        health: HealthStatus,
    ) -> StateResult<(HealthStatus, InstanceRecord)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        let prior;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut record: InstanceRecord = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(id.to_string())),
            };

            prior = record.health;
            record.health = health;

            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            updated = record;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((prior, updated))
    }

    /// Capacity counters in one registry scan.
    pub fn capacity_counts(&self) -> StateResult<CapacityCounts> {
        let mut counts = CapacityCounts::default();
        for record in self.list_instances()? {
            if record.lifecycle == LifecycleState::InService {
                counts.in_service += 1;
            } else if record.is_pending_launch() {
                counts.pending_launch += 1;
            } else if record.is_parked() {
                counts.warm += 1;
            }
        }
        Ok(counts)
    }

    /// Parked warm-pool entries, oldest-parked first.
    pub fn list_parked(&self) -> StateResult<Vec<InstanceRecord>> {
        let mut parked: Vec<InstanceRecord> = self
            .list_instances()?
            .into_iter()
            .filter(InstanceRecord::is_parked)
            .collect();
        parked.sort_by_key(|r| (r.last_transition_at, r.id.clone()));
        Ok(parked)
    }

    // ── Group configuration ────────────────────────────────────────

    /// Get the group configuration, falling back to defaults if none
    /// has been stored yet.
    pub fn get_group(&self) -> StateResult<GroupConfig> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUP).map_err(map_err!(Table))?;
        match table.get(GROUP_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let config: GroupConfig =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(config)
            }
            None => Ok(GroupConfig::default()),
        }
    }

    /// Store the group configuration after validating the envelope.
    pub fn put_group(&self, config: &GroupConfig) -> StateResult<()> {
        config.validate()?;
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUP).map_err(map_err!(Table))?;
            table
                .insert(GROUP_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            desired = config.desired_capacity,
            min = config.min_capacity,
            max = config.max_capacity,
            "group configuration stored"
        );
        Ok(())
    }

    // ── Launch-gate holds ──────────────────────────────────────────

    /// Insert a hold. Returns `false` if one already exists for the
    /// instance (an instance id appears at most once concurrently).
    pub fn insert_hold(&self, hold: &HoldRecord) -> StateResult<bool> {
        let value = serde_json::to_vec(hold).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(HOLDS).map_err(map_err!(Table))?;
            let exists = table
                .get(hold.instance_id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                inserted = false;
            } else {
                table
                    .insert(hold.instance_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                inserted = true;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(inserted)
    }

    /// Overwrite an existing hold (heartbeat deadline extension).
    /// Errors with `NotFound` if the hold was already resolved.
    pub fn update_hold(&self, hold: &HoldRecord) -> StateResult<()> {
        let value = serde_json::to_vec(hold).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HOLDS).map_err(map_err!(Table))?;
            if table
                .get(hold.instance_id.as_str())
                .map_err(map_err!(Read))?
                .is_none()
            {
                return Err(StateError::NotFound(hold.instance_id.clone()));
            }
            table
                .insert(hold.instance_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a pending hold by instance id.
    pub fn get_hold(&self, id: &str) -> StateResult<Option<HoldRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOLDS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let hold: HoldRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(hold))
            }
            None => Ok(None),
        }
    }

    /// Atomically remove and return a hold.
    ///
    /// Exactly one caller observes `Some` for a given hold; this is the
    /// first-writer-wins primitive behind exactly-once hold resolution.
    pub fn take_hold(&self, id: &str) -> StateResult<Option<HoldRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let taken;
        {
            let mut table = txn.open_table(HOLDS).map_err(map_err!(Table))?;
            taken = match table.remove(id).map_err(map_err!(Write))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(taken)
    }

    /// List all pending holds.
    pub fn list_holds(&self) -> StateResult<Vec<HoldRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOLDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let hold: HoldRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(hold);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, now: u64) -> InstanceRecord {
        InstanceRecord::new(id.to_string(), now)
    }

    #[test]
    fn put_and_get_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = record("i-001", 1000);
        store.put_instance(&rec).unwrap();

        let loaded = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(store.get_instance("i-404").unwrap().is_none());
    }

    #[test]
    fn transition_happy_path() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&record("i-001", 1000)).unwrap();

        let (from, updated) = store
            .transition_instance(
                "i-001",
                &[LifecycleState::Pending],
                LifecycleState::Launching,
                |_| {},
            )
            .unwrap();
        assert_eq!(from, LifecycleState::Pending);
        assert_eq!(updated.lifecycle, LifecycleState::Launching);
    }

    #[test]
    fn transition_rejects_unexpected_state() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&record("i-001", 1000)).unwrap();

        let result = store.transition_instance(
            "i-001",
            &[LifecycleState::Launching],
            LifecycleState::InService,
            |_| {},
        );
        assert!(matches!(result, Err(StateError::Conflict { .. })));

        // The record was not touched.
        let loaded = store.get_instance("i-001").unwrap().unwrap();
        assert_eq!(loaded.lifecycle, LifecycleState::Pending);
    }

    #[test]
    fn transition_missing_instance_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.transition_instance(
            "i-404",
            &[LifecycleState::Pending],
            LifecycleState::Launching,
            |_| {},
        );
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    #[test]
    fn transition_mutate_adjusts_membership() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&record("i-001", 1000)).unwrap();

        let (_, updated) = store
            .transition_instance(
                "i-001",
                &[LifecycleState::Pending],
                LifecycleState::Warmed,
                |r| r.warm_pool = WarmPoolMembership::Parked,
            )
            .unwrap();
        assert!(updated.is_parked());
    }

    #[test]
    fn update_health_keeps_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&record("i-001", 1000)).unwrap();

        let (prior, updated) = store
            .update_health("i-001", HealthStatus::Unhealthy)
            .unwrap();
        assert_eq!(prior, HealthStatus::Unknown);
        assert_eq!(updated.health, HealthStatus::Unhealthy);
        assert_eq!(updated.lifecycle, LifecycleState::Pending);
    }

    #[test]
    fn capacity_counts_classify_states() {
        let store = StateStore::open_in_memory().unwrap();

        let mut serving = record("i-001", 1000);
        serving.lifecycle = LifecycleState::InService;
        store.put_instance(&serving).unwrap();

        store.put_instance(&record("i-002", 1000)).unwrap(); // pending

        let mut parked = record("i-003", 1000);
        parked.lifecycle = LifecycleState::Warmed;
        parked.warm_pool = WarmPoolMembership::Parked;
        store.put_instance(&parked).unwrap();

        let mut gone = record("i-004", 1000);
        gone.lifecycle = LifecycleState::Terminated;
        store.put_instance(&gone).unwrap();

        let counts = store.capacity_counts().unwrap();
        assert_eq!(counts.in_service, 1);
        assert_eq!(counts.pending_launch, 1);
        assert_eq!(counts.warm, 1);
        assert_eq!(counts.in_service_track(), 2);
    }

    #[test]
    fn list_parked_orders_oldest_first() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, parked_at) in [("i-b", 2000), ("i-a", 1000), ("i-c", 3000)] {
            let mut rec = record(id, parked_at);
            rec.lifecycle = LifecycleState::Warmed;
            rec.warm_pool = WarmPoolMembership::Parked;
            rec.last_transition_at = parked_at;
            store.put_instance(&rec).unwrap();
        }

        let parked = store.list_parked().unwrap();
        let ids: Vec<&str> = parked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["i-a", "i-b", "i-c"]);
    }

    #[test]
    fn group_defaults_until_stored() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.get_group().unwrap(), GroupConfig::default());

        let config = GroupConfig {
            desired_capacity: 4,
            ..GroupConfig::default()
        };
        store.put_group(&config).unwrap();
        assert_eq!(store.get_group().unwrap(), config);
    }

    #[test]
    fn put_group_rejects_invalid_envelope() {
        let store = StateStore::open_in_memory().unwrap();
        let config = GroupConfig {
            desired_capacity: 10,
            ..GroupConfig::default()
        };
        assert!(matches!(
            store.put_group(&config),
            Err(StateError::CapacityExceeded(_))
        ));
        // Nothing stored.
        assert_eq!(store.get_group().unwrap(), GroupConfig::default());
    }

    #[test]
    fn hold_insert_is_exclusive() {
        let store = StateStore::open_in_memory().unwrap();
        let hold = HoldRecord {
            instance_id: "i-001".to_string(),
            registered_at_ms: 1000,
            deadline_ms: 2000,
        };
        assert!(store.insert_hold(&hold).unwrap());
        assert!(!store.insert_hold(&hold).unwrap());
    }

    #[test]
    fn take_hold_returns_exactly_once() {
        let store = StateStore::open_in_memory().unwrap();
        let hold = HoldRecord {
            instance_id: "i-001".to_string(),
            registered_at_ms: 1000,
            deadline_ms: 2000,
        };
        store.insert_hold(&hold).unwrap();

        assert_eq!(store.take_hold("i-001").unwrap(), Some(hold));
        assert_eq!(store.take_hold("i-001").unwrap(), None);
    }

    #[test]
    fn update_hold_requires_pending_hold() {
        let store = StateStore::open_in_memory().unwrap();
        let hold = HoldRecord {
            instance_id: "i-001".to_string(),
            registered_at_ms: 1000,
            deadline_ms: 2000,
        };
        assert!(matches!(
            store.update_hold(&hold),
            Err(StateError::NotFound(_))
        ));

        store.insert_hold(&hold).unwrap();
        let extended = HoldRecord {
            deadline_ms: 3000,
            ..hold
        };
        store.update_hold(&extended).unwrap();
        assert_eq!(store.get_hold("i-001").unwrap().unwrap().deadline_ms, 3000);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_instance(&record("i-001", 1000)).unwrap();
            store
                .insert_hold(&HoldRecord {
                    instance_id: "i-001".to_string(),
                    registered_at_ms: 1000,
                    deadline_ms: 2000,
                })
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_instance("i-001").unwrap().is_some());
        assert_eq!(store.list_holds().unwrap().len(), 1);
    }
}
