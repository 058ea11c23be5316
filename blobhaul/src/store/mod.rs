//! Durable persistence contract.
//!
//! The durable store is the system of record for transfer entities; the
//! manager's in-memory index is a cache over it. The engine only needs a
//! handful of primitives: fetch roots (entities with no parent), fetch the
//! children of a composite, fetch everything (for the load-time corruption
//! scan), save a batch, and delete with cascade.
//!
//! Two implementations ship: [`MemoryStore`] for tests and embedding, and
//! [`JsonFileStore`] for real on-disk durability.

mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use thiserror::Error;

use crate::transfer::{TransferId, TransferRecord};

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no record for transfer {0}")]
    Missing(TransferId),
}

/// Key-value/object persistence for transfer entities.
///
/// Writes must preserve per-entity ordering: a `save` observed by a later
/// `fetch` never yields state older than an earlier completed `save` of the
/// same entity.
pub trait DurableStore: Send + Sync {
    /// All root entities: blob/multi records with no parent. Block records
    /// are never returned here.
    fn fetch_roots(&self) -> Result<Vec<TransferRecord>, StoreError>;

    /// Direct children of `parent`, in no particular order (the parent's own
    /// child-id list carries the ordering).
    fn fetch_children(&self, parent: TransferId) -> Result<Vec<TransferRecord>, StoreError>;

    /// Every persisted record; used by the load-time corruption scan.
    fn fetch_all(&self) -> Result<Vec<TransferRecord>, StoreError>;

    /// Persists a batch of records, inserting or overwriting by id.
    fn save(&self, records: &[TransferRecord]) -> Result<(), StoreError>;

    /// Deletes `id` and cascades to its whole subtree. Deleting an unknown
    /// id is a no-op.
    fn delete(&self, id: TransferId) -> Result<(), StoreError>;
}
