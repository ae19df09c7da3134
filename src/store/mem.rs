//! In-memory storage adapter backed by DashMap. All data is lost on process exit.

use dashmap::DashMap;

use super::{EntityKind, StorageAdapter, StoreResult};

/// Concurrent process-local store using a sharded hashmap.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<(EntityKind, String), Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all kinds.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StorageAdapter for MemoryStore {
    fn put_raw(&self, kind: EntityKind, id: &str, value: &[u8]) -> StoreResult<()> {
        self.data.insert((kind, id.to_string()), value.to_vec());
        Ok(())
    }

    fn get_raw(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .data
            .get(&(kind, id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    fn delete_raw(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        Ok(self.data.remove(&(kind, id.to_string())).is_some())
    }

    fn list_ids(&self, kind: EntityKind) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
