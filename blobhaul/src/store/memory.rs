//! In-memory durable-store implementation.

use parking_lot::Mutex;
use std::collections::HashMap;

use super::{DurableStore, StoreError};
use crate::transfer::{TransferId, TransferRecord};

/// Map-backed store; "durable" only for the lifetime of the process.
///
/// Useful for tests and for embedders that handle durability elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<TransferId, TransferRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the store, e.g. to simulate state left over from a
    /// previous process.
    pub fn with_records(records: impl IntoIterator<Item = TransferRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.id(), r)).collect();
        Self {
            records: Mutex::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Collects `id` plus all descendants reachable through child-id lists.
fn subtree(map: &HashMap<TransferId, TransferRecord>, id: TransferId) -> Vec<TransferId> {
    let mut out = Vec::new();
    let mut stack = vec![id];
    while let Some(next) = stack.pop() {
        if let Some(record) = map.get(&next) {
            out.push(next);
            stack.extend(record.children().iter().copied());
        }
    }
    out
}

impl DurableStore for MemoryStore {
    fn fetch_roots(&self) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.is_root())
            .cloned()
            .collect())
    }

    fn fetch_children(&self, parent: TransferId) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.parent() == Some(parent))
            .cloned()
            .collect())
    }

    fn fetch_all(&self) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn save(&self, records: &[TransferRecord]) -> Result<(), StoreError> {
        let mut map = self.records.lock();
        for record in records {
            map.insert(record.id(), record.clone());
        }
        Ok(())
    }

    fn delete(&self, id: TransferId) -> Result<(), StoreError> {
        let mut map = self.records.lock();
        for tid in subtree(&map, id) {
            map.remove(&tid);
        }
        Ok(())
    }
}
