//! Builds the operation graph for one blob transfer.
//!
//! Uploads know their whole block plan upfront: every pending block becomes
//! one operation, plus a block-list commit that depends on all of them. A
//! download starts with only the size probe; once the probe settles the blob
//! is re-planned, so the second pass emits its range operations plus a
//! finalize step that depends on them.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::client::{BlobDownloader, BlobOperator, BlobUploader};
use crate::queue::{Operation, OperationKind, OperationResult, QueuedOperation};
use crate::transfer::{BlobTransfer, TransferIndex, TransferId, TransferState};

/// The queued operations for one blob, plus the block ids they activate.
#[derive(Debug)]
pub(crate) struct OperationPlan {
    pub operations: Vec<QueuedOperation>,
    /// Blocks with an operation in this plan; the manager marks them
    /// in-progress when it submits the batch.
    pub activated_blocks: Vec<TransferId>,
}

impl OperationPlan {
    fn empty() -> Self {
        Self {
            operations: Vec::new(),
            activated_blocks: Vec::new(),
        }
    }
}

/// Plans the operations needed to drive `blob` forward from its current
/// persisted state. Completed blocks get no operation; the finishing step
/// depends only on the operations actually emitted.
pub(crate) fn build_operations(
    index: &TransferIndex,
    blob: &BlobTransfer,
    operator: &BlobOperator,
) -> OperationPlan {
    match operator {
        BlobOperator::Upload(uploader) => plan_upload(index, blob, uploader),
        BlobOperator::Download(downloader) => plan_download(index, blob, downloader),
    }
}

fn plan_upload(
    index: &TransferIndex,
    blob: &BlobTransfer,
    uploader: &Arc<dyn BlobUploader>,
) -> OperationPlan {
    let mut plan = OperationPlan::empty();
    let mut block_op_ids = Vec::new();

    for block_id in &blob.blocks {
        let Some(block) = index.block(*block_id) else {
            continue;
        };
        if block.state != TransferState::Pending {
            continue;
        }
        let op = QueuedOperation::new(Arc::new(BlockUploadOperation {
            blob: blob.id,
            block: block.id,
            protocol_block_id: block.block_id.clone(),
            start: block.start_range,
            end: block.end_range,
            uploader: Arc::clone(uploader),
        }));
        block_op_ids.push(op.id());
        plan.activated_blocks.push(block.id);
        plan.operations.push(op);
    }

    // The commit names every block of the blob, including ones completed in
    // an earlier session, in insertion order.
    let all_block_ids: Vec<String> = blob
        .blocks
        .iter()
        .filter_map(|bid| index.block(*bid))
        .map(|b| b.block_id.clone())
        .collect();
    plan.operations.push(
        QueuedOperation::new(Arc::new(CommitBlockListOperation {
            blob: blob.id,
            block_ids: all_block_ids,
            uploader: Arc::clone(uploader),
        }))
        .depends_on(block_op_ids),
    );
    plan
}

fn plan_download(
    index: &TransferIndex,
    blob: &BlobTransfer,
    downloader: &Arc<dyn BlobDownloader>,
) -> OperationPlan {
    let mut plan = OperationPlan::empty();

    if !blob.initial_call_complete {
        // Size unknown: the only thing we can do is probe. The placeholder
        // block is rewritten when the probe settles.
        let Some(placeholder) = blob.blocks.first().and_then(|bid| index.block(*bid)) else {
            return plan;
        };
        plan.activated_blocks.push(placeholder.id);
        plan.operations.push(QueuedOperation::new(Arc::new(
            InitialDownloadOperation {
                blob: blob.id,
                block: placeholder.id,
                downloader: Arc::clone(downloader),
            },
        )));
        return plan;
    }

    let mut block_op_ids = Vec::new();
    for block_id in &blob.blocks {
        let Some(block) = index.block(*block_id) else {
            continue;
        };
        if block.state != TransferState::Pending {
            continue;
        }
        let op = QueuedOperation::new(Arc::new(BlockDownloadOperation {
            blob: blob.id,
            block: block.id,
            start: block.start_range,
            end: block.end_range,
            downloader: Arc::clone(downloader),
        }));
        block_op_ids.push(op.id());
        plan.activated_blocks.push(block.id);
        plan.operations.push(op);
    }

    plan.operations.push(
        QueuedOperation::new(Arc::new(FinalizeDownloadOperation {
            blob: blob.id,
            downloader: Arc::clone(downloader),
        }))
        .depends_on(block_op_ids),
    );
    plan
}

// ============================================================================
// Upload operations
// ============================================================================

struct BlockUploadOperation {
    blob: TransferId,
    block: TransferId,
    protocol_block_id: String,
    start: u64,
    end: u64,
    uploader: Arc<dyn BlobUploader>,
}

impl Operation for BlockUploadOperation {
    fn name(&self) -> &str {
        "PutBlock"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Block
    }

    fn transfer(&self) -> TransferId {
        self.block
    }

    fn group(&self) -> TransferId {
        self.blob
    }

    fn execute<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, OperationResult> {
        Box::pin(async move {
            let outcome = self
                .uploader
                .put_block(&self.protocol_block_id, self.start, self.end, cancel)
                .await;
            match outcome.error {
                Some(error) => OperationResult::failure(outcome.bytes_transferred, error),
                None => OperationResult::success(outcome.bytes_transferred),
            }
        })
    }
}

struct CommitBlockListOperation {
    blob: TransferId,
    block_ids: Vec<String>,
    uploader: Arc<dyn BlobUploader>,
}

impl Operation for CommitBlockListOperation {
    fn name(&self) -> &str {
        "CommitBlockList"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Finish
    }

    fn transfer(&self) -> TransferId {
        self.blob
    }

    fn group(&self) -> TransferId {
        self.blob
    }

    fn execute<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, OperationResult> {
        Box::pin(async move {
            let outcome = self.uploader.commit_block_list(self.block_ids.clone()).await;
            match outcome.error {
                Some(error) => OperationResult::failure(outcome.bytes_transferred, error),
                None => OperationResult::success(outcome.bytes_transferred),
            }
        })
    }
}

// ============================================================================
// Download operations
// ============================================================================

struct InitialDownloadOperation {
    blob: TransferId,
    /// Placeholder block the probe's first chunk is recorded on.
    block: TransferId,
    downloader: Arc<dyn BlobDownloader>,
}

impl Operation for InitialDownloadOperation {
    fn name(&self) -> &str {
        "InitialDownload"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Initial
    }

    fn transfer(&self) -> TransferId {
        self.block
    }

    fn group(&self) -> TransferId {
        self.blob
    }

    fn execute<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, OperationResult> {
        Box::pin(async move {
            match self.downloader.probe(cancel).await {
                Ok(info) => OperationResult::success(info.first_chunk_bytes).with_probe(info),
                Err(error) => OperationResult::failure(0, error),
            }
        })
    }
}

struct BlockDownloadOperation {
    blob: TransferId,
    block: TransferId,
    start: u64,
    end: u64,
    downloader: Arc<dyn BlobDownloader>,
}

impl Operation for BlockDownloadOperation {
    fn name(&self) -> &str {
        "GetRange"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Block
    }

    fn transfer(&self) -> TransferId {
        self.block
    }

    fn group(&self) -> TransferId {
        self.blob
    }

    fn execute<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, OperationResult> {
        Box::pin(async move {
            let outcome = self.downloader.get_range(self.start, self.end, cancel).await;
            match outcome.error {
                Some(error) => OperationResult::failure(outcome.bytes_transferred, error),
                None => OperationResult::success(outcome.bytes_transferred),
            }
        })
    }
}

struct FinalizeDownloadOperation {
    blob: TransferId,
    downloader: Arc<dyn BlobDownloader>,
}

impl Operation for FinalizeDownloadOperation {
    fn name(&self) -> &str {
        "FinalizeDownload"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Finish
    }

    fn transfer(&self) -> TransferId {
        self.blob
    }

    fn group(&self) -> TransferId {
        self.blob
    }

    fn execute<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, OperationResult> {
        Box::pin(async move {
            let outcome = self.downloader.finalize().await;
            match outcome.error {
                Some(error) => OperationResult::failure(outcome.bytes_transferred, error),
                None => OperationResult::success(outcome.bytes_transferred),
            }
        })
    }
}
