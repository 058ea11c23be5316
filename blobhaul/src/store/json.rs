//! File-backed durable store using a single JSON document.
//!
//! Every mutation rewrites the whole file through a write-temp-then-rename
//! sequence, so a crash mid-write leaves the previous generation intact.
//! Fine for the entity counts this engine deals in (transfers, not objects).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{DurableStore, StoreError};
use crate::transfer::{TransferId, TransferRecord};

/// JSON-file-backed store.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<TransferId, TransferRecord>>,
}

impl JsonFileStore {
    /// Opens (or creates) the store at `path`, loading any existing records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => {
                let list: Vec<TransferRecord> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|r| (r.id(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &HashMap<TransferId, TransferRecord>) -> Result<(), StoreError> {
        let list: Vec<&TransferRecord> = map.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

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

impl DurableStore for JsonFileStore {
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
        self.persist(&map)
    }

    fn delete(&self, id: TransferId) -> Result<(), StoreError> {
        let mut map = self.records.lock();
        for tid in subtree(&map, id) {
            map.remove(&tid);
        }
        self.persist(&map)
    }
}
