//! Transfer entities and the in-memory index.
//!
//! The data model is a closed tagged variant over the three entity kinds:
//!
//! - [`BlockTransfer`]: one contiguous byte range of one object (leaf)
//! - [`BlobTransfer`]: one object's full transfer, composed of blocks
//! - [`MultiBlobTransfer`]: several blob transfers submitted as one batch
//!
//! Ownership is arena + index: [`TransferIndex`] owns every record keyed by
//! id; composites hold ordered child-id vectors and children point back to
//! their parent by id only, so there are no reference cycles. The durable
//! store is the system of record; the index is a cache that reconciles with
//! it on load and flushes changes on save.

mod state;

pub use state::TransferState;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::client::RestorationId;

/// Range end marking a download block whose real extent is unknown until the
/// initial metadata probe completes.
pub const UNKNOWN_RANGE_END: u64 = u64::MAX;

/// Stable identifier for a transfer entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generates a fresh random id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a blob transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    Upload,
    Download,
}

/// One contiguous byte range of one object.
///
/// Every block has exactly one parent blob; a persisted block whose parent
/// record is missing is store corruption, detected at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTransfer {
    pub id: TransferId,
    pub parent: TransferId,
    /// Opaque identifier used by the storage protocol to address this chunk.
    pub block_id: String,
    pub start_range: u64,
    /// Exclusive end offset; [`UNKNOWN_RANGE_END`] for a download placeholder.
    pub end_range: u64,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub last_error: Option<String>,
}

impl BlockTransfer {
    /// Creates a block covering `start..end` of the parent blob.
    pub fn new(parent: TransferId, block_id: impl Into<String>, start: u64, end: u64) -> Self {
        debug_assert!(start < end, "block range must be non-empty");
        Self {
            id: TransferId::new(),
            parent,
            block_id: block_id.into(),
            start_range: start,
            end_range: end,
            state: TransferState::Pending,
            bytes_transferred: 0,
            last_error: None,
        }
    }

    /// Creates the single pre-probe placeholder block for a download.
    ///
    /// The object size is unknown until the first network round trip, so the
    /// placeholder spans an unknown range; the probe rewrites it.
    pub fn placeholder(parent: TransferId) -> Self {
        Self::new(parent, "probe", 0, UNKNOWN_RANGE_END)
    }

    /// Length of the byte range, or `None` while the range is unknown.
    pub fn range_len(&self) -> Option<u64> {
        (self.end_range != UNKNOWN_RANGE_END).then(|| self.end_range - self.start_range)
    }
}

/// One object's full transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobTransfer {
    pub id: TransferId,
    /// Owning multi-blob transfer, or `None` for roots.
    pub parent: Option<TransferId>,
    pub restoration_id: RestorationId,
    pub transfer_type: TransferType,
    pub source: String,
    pub destination: String,
    /// Aggregate size; 0 for downloads until the probe reports it.
    pub total_bytes_to_transfer: u64,
    pub bytes_transferred: u64,
    /// Count of child blocks; 0 until chunking is decided.
    pub total_blocks: usize,
    /// For downloads, whether the metadata/size probe has run.
    pub initial_call_complete: bool,
    /// Child block ids; insertion order is execution order.
    pub blocks: Vec<TransferId>,
    pub state: TransferState,
    pub last_error: Option<String>,
}

impl BlobTransfer {
    pub fn new(
        restoration_id: RestorationId,
        transfer_type: TransferType,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id: TransferId::new(),
            parent: None,
            restoration_id,
            transfer_type,
            source: source.into(),
            destination: destination.into(),
            total_bytes_to_transfer: 0,
            bytes_transferred: 0,
            total_blocks: 0,
            initial_call_complete: false,
            blocks: Vec::new(),
            state: TransferState::Pending,
            last_error: None,
        }
    }
}

/// A group of blob transfers submitted together (e.g. a directory upload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiBlobTransfer {
    pub id: TransferId,
    pub restoration_id: RestorationId,
    /// Child blob ids, in submission order.
    pub blobs: Vec<TransferId>,
    pub state: TransferState,
}

impl MultiBlobTransfer {
    pub fn new(restoration_id: RestorationId) -> Self {
        Self {
            id: TransferId::new(),
            restoration_id,
            blobs: Vec::new(),
            state: TransferState::Pending,
        }
    }
}

/// Closed variant over the three transfer kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TransferRecord {
    Block(BlockTransfer),
    Blob(BlobTransfer),
    Multi(MultiBlobTransfer),
}

impl TransferRecord {
    pub fn id(&self) -> TransferId {
        match self {
            Self::Block(b) => b.id,
            Self::Blob(b) => b.id,
            Self::Multi(m) => m.id,
        }
    }

    pub fn state(&self) -> TransferState {
        match self {
            Self::Block(b) => b.state,
            Self::Blob(b) => b.state,
            Self::Multi(m) => m.state,
        }
    }

    pub fn set_state(&mut self, state: TransferState) {
        match self {
            Self::Block(b) => b.state = state,
            Self::Blob(b) => b.state = state,
            Self::Multi(m) => m.state = state,
        }
    }

    /// Owning composite, or `None` for roots. Blocks always have a parent.
    pub fn parent(&self) -> Option<TransferId> {
        match self {
            Self::Block(b) => Some(b.parent),
            Self::Blob(b) => b.parent,
            Self::Multi(_) => None,
        }
    }

    /// Roots are the entities the manager indexes at top level; blocks are
    /// never roots.
    pub fn is_root(&self) -> bool {
        self.parent().is_none() && !matches!(self, Self::Block(_))
    }

    /// Ordered child ids for composites; empty for blocks.
    pub fn children(&self) -> &[TransferId] {
        match self {
            Self::Block(_) => &[],
            Self::Blob(b) => &b.blocks,
            Self::Multi(m) => &m.blobs,
        }
    }
}

/// In-memory arena of transfer records.
#[derive(Debug, Default)]
pub struct TransferIndex {
    records: HashMap<TransferId, TransferRecord>,
}

impl TransferIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: TransferRecord) {
        self.records.insert(record.id(), record);
    }

    pub fn get(&self, id: TransferId) -> Option<&TransferRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut TransferRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &TransferRecord> {
        self.records.values()
    }

    pub fn block(&self, id: TransferId) -> Option<&BlockTransfer> {
        match self.records.get(&id) {
            Some(TransferRecord::Block(b)) => Some(b),
            _ => None,
        }
    }

    pub fn block_mut(&mut self, id: TransferId) -> Option<&mut BlockTransfer> {
        match self.records.get_mut(&id) {
            Some(TransferRecord::Block(b)) => Some(b),
            _ => None,
        }
    }

    pub fn blob(&self, id: TransferId) -> Option<&BlobTransfer> {
        match self.records.get(&id) {
            Some(TransferRecord::Blob(b)) => Some(b),
            _ => None,
        }
    }

    pub fn blob_mut(&mut self, id: TransferId) -> Option<&mut BlobTransfer> {
        match self.records.get_mut(&id) {
            Some(TransferRecord::Blob(b)) => Some(b),
            _ => None,
        }
    }

    pub fn multi(&self, id: TransferId) -> Option<&MultiBlobTransfer> {
        match self.records.get(&id) {
            Some(TransferRecord::Multi(m)) => Some(m),
            _ => None,
        }
    }

    pub fn multi_mut(&mut self, id: TransferId) -> Option<&mut MultiBlobTransfer> {
        match self.records.get_mut(&id) {
            Some(TransferRecord::Multi(m)) => Some(m),
            _ => None,
        }
    }

    /// Ids of all root records (blobs/multis with no parent).
    pub fn roots(&self) -> Vec<TransferId> {
        self.records
            .values()
            .filter(|r| r.is_root())
            .map(|r| r.id())
            .collect()
    }

    /// Ids of `id` plus every descendant, parents before children.
    pub fn subtree(&self, id: TransferId) -> Vec<TransferId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(record) = self.records.get(&next) {
                out.push(next);
                stack.extend(record.children().iter().copied());
            }
        }
        out
    }

    /// Removes `id` and its whole subtree, returning the removed records.
    pub fn remove_cascade(&mut self, id: TransferId) -> Vec<TransferRecord> {
        self.subtree(id)
            .into_iter()
            .filter_map(|tid| self.records.remove(&tid))
            .collect()
    }

    /// Effective progress of a blob: the clamped sum of its blocks'
    /// transferred bytes, paired with the known total.
    ///
    /// Returns `(bytes_transferred, total_bytes_to_transfer)`.
    pub fn blob_progress(&self, id: TransferId) -> Option<(u64, u64)> {
        let blob = self.blob(id)?;
        let sum: u64 = blob
            .blocks
            .iter()
            .filter_map(|bid| self.block(*bid))
            .map(|b| b.bytes_transferred)
            .sum();
        let total = blob.total_bytes_to_transfer;
        let bytes = if total > 0 { sum.min(total) } else { sum };
        Some((bytes, total))
    }

    /// Aggregate progress of a multi-blob transfer over its children.
    pub fn multi_progress(&self, id: TransferId) -> Option<(u64, u64)> {
        let multi = self.multi(id)?;
        let mut bytes = 0;
        let mut total = 0;
        for bid in &multi.blobs {
            if let Some((b, t)) = self.blob_progress(*bid) {
                bytes += b;
                total += t;
            }
        }
        Some((bytes, total))
    }
}
