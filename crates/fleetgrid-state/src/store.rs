//! StateStore — redb-backed persistence of local service snapshots.
//!
//! Every transition of a locally owned service writes its latest snapshot
//! here; deletion removes it. Records that survive a daemon restart belong
//! to services whose processes are gone, and are pruned at boot.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;
use uuid::Uuid;

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

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace the snapshot of a service.
    pub fn put_snapshot(&self, snapshot: &ServiceSnapshot) -> StateResult<()> {
        let key = snapshot.unique_id().to_string();
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, lifecycle = %snapshot.lifecycle, "snapshot stored");
        Ok(())
    }

    pub fn get_snapshot(&self, unique_id: &Uuid) -> StateResult<Option<ServiceSnapshot>> {
        let key = unique_id.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: ServiceSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub fn list_snapshots(&self) -> StateResult<Vec<ServiceSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: ServiceSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(snapshot);
        }
        Ok(results)
    }

    /// Delete a snapshot. Returns true if it existed.
    pub fn delete_snapshot(&self, unique_id: &Uuid) -> StateResult<bool> {
        let key = unique_id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "snapshot deleted");
        Ok(existed)
    }

    /// Remove every stored snapshot, returning what was removed.
    pub fn prune(&self) -> StateResult<Vec<ServiceSnapshot>> {
        let leftovers = self.list_snapshots()?;
        if leftovers.is_empty() {
            return Ok(leftovers);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            for snapshot in &leftovers {
                let key = snapshot.unique_id().to_string();
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = leftovers.len(), "stale snapshots pruned");
        Ok(leftovers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_snapshot(task: &str, index: u32, lifecycle: LifecycleState) -> ServiceSnapshot {
        let id = ServiceId::new(task, index, "node-1", "JVM");
        let config = ServiceConfiguration::new(id, 30000 + index as u16, 512, vec!["sleep".into()]);
        ServiceSnapshot {
            creation_time: now_millis(),
            sequence: 1,
            address: HostAndPort::new("127.0.0.1", config.port),
            connect_address: HostAndPort::new("127.0.0.1", config.port),
            lifecycle,
            process: ProcessSnapshot::empty(),
            properties: Properties::new(),
            configuration: config,
        }
    }

    #[test]
    fn snapshot_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let snap = test_snapshot("Lobby", 1, LifecycleState::Prepared);
        store.put_snapshot(&snap).unwrap();

        let loaded = store.get_snapshot(&snap.unique_id()).unwrap();
        assert_eq!(loaded, Some(snap));
    }

    #[test]
    fn snapshot_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_snapshot(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn snapshot_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut snap = test_snapshot("Lobby", 1, LifecycleState::Prepared);
        store.put_snapshot(&snap).unwrap();

        snap.lifecycle = LifecycleState::Running;
        snap.sequence = 2;
        store.put_snapshot(&snap).unwrap();

        let all = store.list_snapshots().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].lifecycle, LifecycleState::Running);
    }

    #[test]
    fn snapshot_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let snap = test_snapshot("Lobby", 1, LifecycleState::Stopped);
        store.put_snapshot(&snap).unwrap();

        assert!(store.delete_snapshot(&snap.unique_id()).unwrap());
        assert!(!store.delete_snapshot(&snap.unique_id()).unwrap());
        assert!(store.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn prune_returns_and_clears_leftovers() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&test_snapshot("Lobby", 1, LifecycleState::Running)).unwrap();
        store.put_snapshot(&test_snapshot("Lobby", 2, LifecycleState::Prepared)).unwrap();

        let pruned = store.prune().unwrap();
        assert_eq!(pruned.len(), 2);
        assert!(store.list_snapshots().unwrap().is_empty());
        assert!(store.prune().unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");
        let snap = test_snapshot("Proxy", 1, LifecycleState::Running);

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_snapshot(&snap).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let loaded = store.get_snapshot(&snap.unique_id()).unwrap();
        assert_eq!(loaded.unwrap().name(), "Proxy-1");
    }
}
