//! StateStore — redb-backed state persistence for rudder.
//!
//! Provides typed operations over the desired state, the instance set,
//! utilization samples, the active rollout plan, and status flags. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

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

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DESIRED).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(SAMPLES).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT).map_err(map_err!(Table))?;
        txn.open_table(STATUS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Desired state ──────────────────────────────────────────────

    /// Store the desired state (singleton).
    pub fn put_desired(&self, desired: &DesiredState) -> StateResult<()> {
        let value = serde_json::to_vec(desired).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DESIRED).map_err(map_err!(Table))?;
            table
                .insert(DESIRED_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            replicas = desired.desired_replicas,
            template = %desired.template,
            "desired state stored"
        );
        Ok(())
    }

    /// Get the desired state, or an error if none has been admitted yet.
    pub fn get_desired(&self) -> StateResult<DesiredState> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DESIRED).map_err(map_err!(Table))?;
        match table.get(DESIRED_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(StateError::NotFound("desired state".to_string())),
        }
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
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
        Ok(())
    }

    /// Get an instance record by id.
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

    /// List all instance records, oldest first (creation order, then id).
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
        results.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(results)
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "instance deleted");
        Ok(existed)
    }

    // ── Utilization samples ────────────────────────────────────────

    /// Append a utilization sample. Samples taken within the same second
    /// take the next free sequence slot instead of overwriting.
    pub fn append_sample(&self, sample: &UtilizationSample) -> StateResult<()> {
        let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
            let mut seq = 0u32;
            let key = loop {
                let key = sample.table_key(seq);
                if table.get(key.as_str()).map_err(map_err!(Read))?.is_none() {
                    break key;
                }
                seq += 1;
            };
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List samples taken at or after the given epoch, in time order.
    pub fn list_samples_since(&self, epoch: u64) -> StateResult<Vec<UtilizationSample>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let sample: UtilizationSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if sample.at >= epoch {
                results.push(sample);
            }
        }
        Ok(results)
    }

    /// Drop samples older than the given epoch. Returns number removed.
    pub fn prune_samples_before(&self, epoch: u64) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, value) = entry.ok()?;
                    let sample: UtilizationSample =
                        serde_json::from_slice(value.value()).ok()?;
                    (sample.at < epoch).then(|| key.value().to_string())
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Rollout plan ───────────────────────────────────────────────

    /// Store the active rollout plan (singleton).
    pub fn put_rollout_plan(&self, plan: &RolloutPlan) -> StateResult<()> {
        let value = serde_json::to_vec(plan).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUT).map_err(map_err!(Table))?;
            table
                .insert(ROLLOUT_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            old = %plan.old_template,
            new = %plan.new_template,
            "rollout plan stored"
        );
        Ok(())
    }

    /// Get the active rollout plan, if any.
    pub fn get_rollout_plan(&self) -> StateResult<Option<RolloutPlan>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUT).map_err(map_err!(Table))?;
        match table.get(ROLLOUT_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let plan: RolloutPlan =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }

    /// Discard the active rollout plan. Returns true if one existed.
    pub fn clear_rollout_plan(&self) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROLLOUT).map_err(map_err!(Table))?;
            existed = table.remove(ROLLOUT_KEY).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Status flags ───────────────────────────────────────────────

    /// Store the degraded-status flags (singleton).
    pub fn put_status(&self, flags: &StatusFlags) -> StateResult<()> {
        let value = serde_json::to_vec(flags).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATUS).map_err(map_err!(Table))?;
            table
                .insert(STATUS_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the status flags. A store that has never been flagged is healthy.
    pub fn get_status(&self) -> StateResult<StatusFlags> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATUS).map_err(map_err!(Table))?;
        match table.get(STATUS_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Ok(StatusFlags::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_desired() -> DesiredState {
        DesiredState {
            replicas_min: 2,
            replicas_max: 5,
            target_cpu_percent: 70.0,
            desired_replicas: 2,
            template: "v1".to_string(),
            rollout: RolloutSettings::default(),
            probe: ProbeSettings::default(),
            updated_at: 1000,
        }
    }

    fn test_instance(id: &str, created_at: u64) -> InstanceRecord {
        InstanceRecord::pending(id, "v1", "127.0.0.1:20001", created_at)
    }

    // ── Desired state ──────────────────────────────────────────────

    #[test]
    fn desired_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let desired = test_desired();

        store.put_desired(&desired).unwrap();
        assert_eq!(store.get_desired().unwrap(), desired);
    }

    #[test]
    fn desired_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_desired(),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn desired_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut desired = test_desired();
        store.put_desired(&desired).unwrap();

        desired.desired_replicas = 4;
        desired.updated_at = 2000;
        store.put_desired(&desired).unwrap();

        let got = store.get_desired().unwrap();
        assert_eq!(got.desired_replicas, 4);
        assert_eq!(got.updated_at, 2000);
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn instance_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("i-0", 1000);

        store.put_instance(&inst).unwrap();
        assert_eq!(store.get_instance("i-0").unwrap(), Some(inst));
    }

    #[test]
    fn instances_list_oldest_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i-b", 3000)).unwrap();
        store.put_instance(&test_instance("i-a", 1000)).unwrap();
        store.put_instance(&test_instance("i-c", 2000)).unwrap();

        let ids: Vec<_> = store
            .list_instances()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["i-a", "i-c", "i-b"]);
    }

    #[test]
    fn instance_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i-0", 1000)).unwrap();

        assert!(store.delete_instance("i-0").unwrap());
        assert!(!store.delete_instance("i-0").unwrap());
        assert!(store.get_instance("i-0").unwrap().is_none());
    }

    // ── Samples ────────────────────────────────────────────────────

    #[test]
    fn samples_list_since_and_prune() {
        let store = StateStore::open_in_memory().unwrap();
        for at in [100u64, 160, 220] {
            store
                .append_sample(&UtilizationSample { at, cpu_percent: 50.0 })
                .unwrap();
        }

        let recent = store.list_samples_since(160).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].at, 160);

        let pruned = store.prune_samples_before(160).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.list_samples_since(0).unwrap().len(), 2);
    }

    #[test]
    fn same_second_samples_are_both_kept() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_sample(&UtilizationSample { at: 100, cpu_percent: 40.0 })
            .unwrap();
        store
            .append_sample(&UtilizationSample { at: 100, cpu_percent: 60.0 })
            .unwrap();

        let samples = store.list_samples_since(0).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].cpu_percent, 40.0);
        assert_eq!(samples[1].cpu_percent, 60.0);
    }

    // ── Rollout plan ───────────────────────────────────────────────

    #[test]
    fn rollout_plan_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_rollout_plan().unwrap().is_none());

        let plan = RolloutPlan {
            old_template: "v1".to_string(),
            new_template: "v2".to_string(),
            max_surge: 1,
            max_unavailable: 0,
            started_at: 1000,
            deadline_secs: 600,
        };
        store.put_rollout_plan(&plan).unwrap();
        assert_eq!(store.get_rollout_plan().unwrap(), Some(plan));

        assert!(store.clear_rollout_plan().unwrap());
        assert!(!store.clear_rollout_plan().unwrap());
        assert!(store.get_rollout_plan().unwrap().is_none());
    }

    // ── Status flags ───────────────────────────────────────────────

    #[test]
    fn status_defaults_to_healthy() {
        let store = StateStore::open_in_memory().unwrap();
        let flags = store.get_status().unwrap();
        assert!(!flags.degraded);
        assert!(flags.reason.is_none());
    }

    #[test]
    fn status_degraded_and_recovered() {
        let store = StateStore::open_in_memory().unwrap();

        store
            .put_status(&StatusFlags::degraded("scheduler unreachable", 1000))
            .unwrap();
        let flags = store.get_status().unwrap();
        assert!(flags.degraded);
        assert_eq!(flags.reason.as_deref(), Some("scheduler unreachable"));

        store.put_status(&StatusFlags::healthy(2000)).unwrap();
        assert!(!store.get_status().unwrap().degraded);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_desired(&test_desired()).unwrap();
            store.put_instance(&test_instance("i-0", 1000)).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_desired().unwrap().replicas_max, 5);
        assert!(store.get_instance("i-0").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_samples_since(0).unwrap().is_empty());
        assert!(!store.delete_instance("nope").unwrap());
        assert_eq!(store.prune_samples_before(u64::MAX).unwrap(), 0);
    }
}
