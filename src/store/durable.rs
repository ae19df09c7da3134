//! ACID-durable storage adapter backed by redb.
//!
//! Every entity lives in one table under `"{kind}/{id}"` string keys with
//! JSON values. Survives crashes and process restarts.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};

use crate::error::StoreError;

use super::{EntityKind, StorageAdapter, StoreResult};

/// Entity table (namespaced string keys → JSON bytes).
const ENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");

fn redb_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

/// ACID-durable store using redb.
///
/// All writes go through transactions. Reads use MVCC snapshots.
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    /// Open or create the database file at `path`, creating parent directories.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io { source: e })?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", path.display()),
        })?;

        // Create the table up front so read transactions can always open it.
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        txn.open_table(ENTITY_TABLE)
            .map_err(redb_err("open_table"))?;
        txn.commit().map_err(redb_err("commit"))?;

        tracing::debug!(path = %path.display(), "durable store opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Check if an entity exists.
    pub fn contains(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        self.get_raw(kind, id).map(|v| v.is_some())
    }
}

impl StorageAdapter for DurableStore {
    fn put_raw(&self, kind: EntityKind, id: &str, value: &[u8]) -> StoreResult<()> {
        let key = kind.key(id);
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn
                .open_table(ENTITY_TABLE)
                .map_err(redb_err("open_table"))?;
            table
                .insert(key.as_str(), value)
                .map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    fn get_raw(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = kind.key(id);
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn
            .open_table(ENTITY_TABLE)
            .map_err(redb_err("open_table"))?;
        let result = table.get(key.as_str()).map_err(redb_err("get"))?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    fn delete_raw(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        let key = kind.key(id);
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let existed = {
            let mut table = txn
                .open_table(ENTITY_TABLE)
                .map_err(redb_err("open_table"))?;
            let result = table.remove(key.as_str()).map_err(redb_err("remove"))?;
            result.is_some()
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok(existed)
    }

    fn list_ids(&self, kind: EntityKind) -> StoreResult<Vec<String>> {
        let prefix = format!("{}/", kind.prefix());
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn
            .open_table(ENTITY_TABLE)
            .map_err(redb_err("open_table"))?;

        let mut ids = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(redb_err("range"))? {
            let (key, _) = entry.map_err(redb_err("range"))?;
            let key = key.value();
            match key.strip_prefix(prefix.as_str()) {
                Some(id) => ids.push(id.to_string()),
                None => break,
            }
        }
        Ok(ids)
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::AgentDefinition;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> DurableStore {
        DurableStore::open(&dir.path().join("sria.redb")).unwrap()
    }

    #[test]
    fn put_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.put_raw(EntityKind::Agent, "hello", b"world").unwrap();
        assert_eq!(
            store.get_raw(EntityKind::Agent, "hello").unwrap(),
            Some(b"world".to_vec())
        );
        assert!(store.contains(EntityKind::Agent, "hello").unwrap());
        assert!(!store.contains(EntityKind::Team, "hello").unwrap());

        assert!(store.delete_raw(EntityKind::Agent, "hello").unwrap());
        assert_eq!(store.get_raw(EntityKind::Agent, "hello").unwrap(), None);
    }

    #[test]
    fn fresh_store_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.load_agents().unwrap().is_empty());
        assert!(store.load_agent("missing").unwrap().is_none());
        assert!(!store.delete_agent("missing").unwrap());
    }

    #[test]
    fn list_is_scoped_to_kind() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put_raw(EntityKind::Agent, "b", b"1").unwrap();
        store.put_raw(EntityKind::Agent, "a", b"1").unwrap();
        store.put_raw(EntityKind::Beacon, "a/x", b"1").unwrap();
        store.put_raw(EntityKind::SriaState, "a", b"1").unwrap();
        assert_eq!(store.list_ids(EntityKind::Agent).unwrap(), vec!["a", "b"]);
        assert_eq!(store.list_ids(EntityKind::Beacon).unwrap(), vec!["a/x"]);
        assert!(store.list_ids(EntityKind::Team).unwrap().is_empty());
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store
                .save_agent(&AgentDefinition::new("agent_p", "P", vec![2, 7]))
                .unwrap();
        }
        let store = open(&dir);
        let def = store.load_agent("agent_p").unwrap().unwrap();
        assert_eq!(def.body_primes, vec![2, 7]);
    }

    #[test]
    fn corrupt_value_is_a_serialization_error() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.put_raw(EntityKind::Agent, "bad", b"not json").unwrap();
        assert!(matches!(
            store.load_agent("bad"),
            Err(StoreError::Serialization { .. })
        ));
    }
}
