//! Per-blob wire helpers: the boundary to the byte-range transfer layer.
//!
//! The engine never issues network calls itself. Each blob transfer holds a
//! live [`BlobUploader`] or [`BlobDownloader`] (reconstructed from persisted
//! state after a restart) and the queue's operations call into it. Helpers
//! must be cancelable mid-flight and must report partial progress in their
//! [`BlockOutcome`] even when they fail.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};

/// One entry of an upload block plan: an opaque protocol-level block id and
/// the byte range it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlanEntry {
    pub block_id: String,
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

impl BlockPlanEntry {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Splits `total_bytes` into fixed-size block plan entries with a short tail.
///
/// Block ids are zero-padded ordinals; the storage protocol treats them as
/// opaque strings, it only requires them to be unique within one blob.
pub fn plan_blocks(total_bytes: u64, block_size: u64) -> Vec<BlockPlanEntry> {
    assert!(block_size > 0, "block size must be nonzero");
    let mut plan = Vec::new();
    let mut start = 0;
    let mut ordinal = 0u32;
    while start < total_bytes {
        let end = (start + block_size).min(total_bytes);
        plan.push(BlockPlanEntry {
            block_id: format!("{ordinal:08}"),
            start,
            end,
        });
        start = end;
        ordinal += 1;
    }
    plan
}

/// Result of the initial download probe.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    /// Total object size learned from the metadata round trip.
    pub total_bytes: u64,
    /// Bytes of the first chunk, written during the probe itself.
    pub first_chunk_bytes: u64,
    /// Block plan for the remainder of the object (everything after the
    /// first chunk). Empty when the whole object fit in the first chunk.
    pub remaining_plan: Vec<BlockPlanEntry>,
}

/// Outcome of one block or finishing call.
///
/// Carries transferred bytes even on failure or cancellation so partial
/// progress is never lost.
#[derive(Debug)]
pub struct BlockOutcome {
    pub bytes_transferred: u64,
    pub error: Option<TransferError>,
}

impl BlockOutcome {
    pub fn success(bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            error: None,
        }
    }

    pub fn failure(bytes_transferred: u64, error: TransferError) -> Self {
        Self {
            bytes_transferred,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Upload helper for one blob.
pub trait BlobUploader: Send + Sync {
    /// Enumerates the block id/range pairs for the source data.
    ///
    /// Uploads know their full plan upfront; this is what drives the
    /// upload/download asymmetry in graph construction.
    fn block_plan(&self) -> Result<Vec<BlockPlanEntry>>;

    /// Transfers one block. Must abort promptly when `cancel` fires and
    /// still resolve, reporting whatever was transferred.
    fn put_block<'a>(
        &'a self,
        block_id: &'a str,
        start: u64,
        end: u64,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, BlockOutcome>;

    /// Commits the full block list; the finishing step for uploads.
    fn commit_block_list<'a>(&'a self, block_ids: Vec<String>) -> BoxFuture<'a, BlockOutcome>;

    /// Seeds progress counters after reconnection so work resumes from the
    /// correct byte offset rather than from zero.
    fn seed_progress(&self, bytes_transferred: u64, total_bytes: u64);
}

/// Download helper for one blob.
pub trait BlobDownloader: Send + Sync {
    /// Probes object size/metadata and writes the first chunk.
    fn probe<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<ProbeInfo>>;

    /// Transfers one byte range.
    fn get_range<'a>(
        &'a self,
        start: u64,
        end: u64,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, BlockOutcome>;

    /// Final assembly/verification; the finishing step for downloads.
    fn finalize<'a>(&'a self) -> BoxFuture<'a, BlockOutcome>;

    /// Seeds progress counters after reconnection.
    fn seed_progress(&self, bytes_transferred: u64, total_bytes: u64);
}

/// Live helper attached to a blob transfer; not persisted.
#[derive(Clone)]
pub enum BlobOperator {
    Upload(Arc<dyn BlobUploader>),
    Download(Arc<dyn BlobDownloader>),
}

impl BlobOperator {
    pub fn seed_progress(&self, bytes_transferred: u64, total_bytes: u64) {
        match self {
            Self::Upload(u) => u.seed_progress(bytes_transferred, total_bytes),
            Self::Download(d) => d.seed_progress(bytes_transferred, total_bytes),
        }
    }
}

impl std::fmt::Debug for BlobOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload(_) => f.write_str("BlobOperator::Upload"),
            Self::Download(_) => f.write_str("BlobOperator::Download"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_splits_with_short_tail() {
        let plan = plan_blocks(10, 4);
        assert_eq!(plan.len(), 3);
        assert_eq!((plan[0].start, plan[0].end), (0, 4));
        assert_eq!((plan[1].start, plan[1].end), (4, 8));
        assert_eq!((plan[2].start, plan[2].end), (8, 10));
        assert_eq!(plan[2].len(), 2);
    }

    #[test]
    fn plan_for_empty_object_is_empty() {
        assert!(plan_blocks(0, 4).is_empty());
    }

    #[test]
    fn plan_block_ids_are_unique_and_ordered() {
        let plan = plan_blocks(100, 10);
        let ids: Vec<_> = plan.iter().map(|e| e.block_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids.len(), sorted.len());
        assert_eq!(ids[0], "00000000");
    }

    #[test]
    fn exact_multiple_has_no_tail() {
        let plan = plan_blocks(8, 4);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|e| e.len() == 4));
    }

    #[test]
    fn outcome_success_and_failure() {
        assert!(BlockOutcome::success(42).is_success());
        let failed = BlockOutcome::failure(10, TransferError::Network("reset".into()));
        assert!(!failed.is_success());
        assert_eq!(failed.bytes_transferred, 10);
    }
}
