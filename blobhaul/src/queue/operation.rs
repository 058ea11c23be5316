//! Operation trait and completion types.
//!
//! An operation is one executable network action owned by a transfer entity:
//! a block upload/download, the initial download probe, or a finishing step.
//! Operations declare dependency edges at submission time; the scheduler in
//! [`super::scheduler`] dispatches a node only once every edge settled
//! successfully.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::client::ProbeInfo;
use crate::error::TransferError;
use crate::transfer::TransferId;

/// Global sequence counter; ids double as submission order.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifier of one queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Allocates the next id in submission order.
    pub(crate) fn next() -> Self {
        Self(SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// What role an operation plays in its transfer's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// One block's byte-range transfer.
    Block,
    /// The download metadata/size probe (writes the first chunk).
    Initial,
    /// The finishing step: block-list commit or final assembly.
    Finish,
}

/// How an operation settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Succeeded,
    Failed,
    Canceled,
    /// Never dispatched because a dependency failed or was canceled.
    Skipped,
}

impl OperationOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// What an operation's `execute` reports back.
#[derive(Debug, Default)]
pub struct OperationResult {
    /// Bytes moved by this call, including partial progress before a
    /// failure or cancellation.
    pub bytes_transferred: u64,
    pub error: Option<TransferError>,
    /// Set by the initial download probe only.
    pub probe: Option<ProbeInfo>,
}

impl OperationResult {
    pub fn success(bytes_transferred: u64) -> Self {
        Self {
            bytes_transferred,
            ..Default::default()
        }
    }

    pub fn failure(bytes_transferred: u64, error: TransferError) -> Self {
        Self {
            bytes_transferred,
            error: Some(error),
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: ProbeInfo) -> Self {
        self.probe = Some(probe);
        self
    }
}

/// Completion notification delivered to the queue's event sink.
///
/// Every settled operation produces exactly one event, including canceled
/// and skipped ones, so transfer bookkeeping stays consistent.
#[derive(Debug)]
pub struct OperationEvent {
    pub operation: OperationId,
    /// Entity this operation's progress belongs to (a block or blob id).
    pub transfer: TransferId,
    /// Owning blob transfer, the unit of bulk cancellation.
    pub group: TransferId,
    pub kind: OperationKind,
    pub outcome: OperationOutcome,
    pub bytes_transferred: u64,
    pub error: Option<String>,
    pub probe: Option<ProbeInfo>,
}

/// An executable unit wrapping one transfer entity's network action.
pub trait Operation: Send + Sync + 'static {
    /// Short name for logging ("PutBlock", "CommitBlockList", ...).
    fn name(&self) -> &str;

    fn kind(&self) -> OperationKind;

    /// Entity the outcome should be recorded on.
    fn transfer(&self) -> TransferId;

    /// Owning blob transfer; `cancel_group` cancels by this id.
    fn group(&self) -> TransferId;

    /// Runs the network action. Must observe `cancel` and resolve promptly
    /// after it fires, reporting any partial progress.
    fn execute<'a>(&'a self, cancel: &'a CancellationToken)
        -> BoxFuture<'a, OperationResult>;
}

/// An operation plus its dependency edges, ready for submission.
///
/// Edges may only reference operations from the same or an earlier
/// submission.
pub struct QueuedOperation {
    pub(crate) id: OperationId,
    pub(crate) operation: Arc<dyn Operation>,
    pub(crate) dependencies: Vec<OperationId>,
}

impl QueuedOperation {
    pub fn new(operation: Arc<dyn Operation>) -> Self {
        Self {
            id: OperationId::next(),
            operation,
            dependencies: Vec::new(),
        }
    }

    /// Adds dependency edges; this operation will not dispatch until every
    /// one of them has settled successfully.
    pub fn depends_on(mut self, ids: impl IntoIterator<Item = OperationId>) -> Self {
        self.dependencies.extend(ids);
        self
    }

    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("name", &self.operation.name())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
