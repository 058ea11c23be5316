//! Transfer manager: the engine's public control surface.
//!
//! The manager owns the in-memory [`TransferIndex`], the operation queue,
//! the client registry and the durable store. Control methods (add, pause,
//! resume, cancel, remove) mutate entity state under the index lock, persist
//! the affected records, and only then touch the queue or fire observer
//! notifications — observers and queue callbacks may re-enter the manager,
//! so nothing user-visible runs while a lock is held.
//!
//! Completion flows back through the queue's event sink: the sink holds a
//! weak reference to the manager internals, so a dropped manager simply
//! stops consuming events instead of being kept alive by its own queue.
//!
//! Lock order is `index` before `operators`; the registry and store have
//! their own independent locks and are only taken as leaves.

mod graph;
mod observer;

pub use observer::{TransferObserver, TransferProgress};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::client::{BlobOperator, ClientRegistry, RestorationId, StorageClient};
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, TransferError};
use crate::queue::{
    EventSink, OperationEvent, OperationKind, OperationOutcome, OperationQueue, QueuedOperation,
};
use crate::store::DurableStore;
use crate::transfer::{
    BlobTransfer, BlockTransfer, MultiBlobTransfer, TransferId, TransferIndex, TransferRecord,
    TransferState, TransferType,
};

use graph::build_operations;

/// A pending observer notification, fired after all locks are released.
struct Note {
    id: TransferId,
    state: TransferState,
    progress: Option<TransferProgress>,
}

/// Resumable multi-part transfer engine.
///
/// Cheap to clone; all clones drive the same engine. Must be created inside
/// a tokio runtime.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    weak: Weak<ManagerInner>,
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    registry: ClientRegistry,
    queue: OperationQueue,
    index: Mutex<TransferIndex>,
    /// Live wire helpers per blob; never persisted, rebuilt on resume.
    operators: Mutex<HashMap<TransferId, BlobOperator>>,
    observer: Mutex<Option<Arc<dyn TransferObserver>>>,
    monitor: Arc<dyn ConnectivityMonitor>,
    started: AtomicBool,
}

impl TransferManager {
    /// Creates a manager over `store`, reacting to `monitor` transitions.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        monitor: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let sink_weak = weak.clone();
            let sink: EventSink = Arc::new(move |event| {
                if let Some(inner) = sink_weak.upgrade() {
                    inner.handle_event(event);
                }
            });
            ManagerInner {
                weak: weak.clone(),
                queue: OperationQueue::new(config.max_concurrency, sink),
                config,
                store,
                registry: ClientRegistry::new(),
                index: Mutex::new(TransferIndex::new()),
                operators: Mutex::new(HashMap::new()),
                observer: Mutex::new(None),
                monitor,
                started: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    // ========================================================================
    // Clients and observers
    // ========================================================================

    /// Registers a storage client under `id`; held weakly.
    pub fn register_client(
        &self,
        id: RestorationId,
        client: &Arc<dyn StorageClient>,
    ) -> Result<()> {
        self.inner.registry.register(id, client)
    }

    pub fn unregister_client(&self, id: &RestorationId) {
        self.inner.registry.unregister(id);
    }

    /// Live client registered under `id`, or `None` once the owner released
    /// it.
    pub fn client(&self, id: &RestorationId) -> Option<Arc<dyn StorageClient>> {
        self.inner.registry.lookup(id)
    }

    pub fn set_observer(&self, observer: Arc<dyn TransferObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.inner.observer.lock() = None;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Loads persisted transfers and begins reacting to connectivity.
    ///
    /// Idempotent. Transfers load as paused; nothing runs until resumed,
    /// either explicitly or by a connectivity-restored transition.
    pub fn start_managing(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.inner.load_context() {
            // A failed start must stay retryable once the store is repaired.
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if self.inner.config.pause_on_connectivity_loss {
            let weak = self.inner.weak.clone();
            self.inner.monitor.start_listening(Arc::new(move |reach| {
                let Some(inner) = weak.upgrade() else { return };
                if reach.is_reachable() {
                    info!("connectivity restored; resuming transfers");
                    inner.resume_all(None);
                } else {
                    info!("connectivity lost; pausing transfers");
                    inner.pause_all();
                }
            }));
        }
        info!("transfer manager started");
        Ok(())
    }

    /// Pauses everything, flushes state, and stops connectivity handling.
    pub fn stop_managing(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.monitor.stop_listening();
        self.inner.pause_all();
        info!("transfer manager stopped");
    }

    // ========================================================================
    // Submitting work
    // ========================================================================

    /// Registers and starts a single-object upload.
    pub fn add_upload(
        &self,
        restoration_id: RestorationId,
        source: &str,
        destination: &str,
    ) -> Result<TransferId> {
        let (blob, blocks, operator) =
            self.inner.plan_blob(&restoration_id, TransferType::Upload, source, destination)?;
        self.inner.admit(vec![(blob, blocks, operator)], None)
    }

    /// Registers and starts a single-object download.
    ///
    /// The object size is unknown until the first network round trip, so the
    /// blob starts with one placeholder block that the probe rewrites.
    pub fn add_download(
        &self,
        restoration_id: RestorationId,
        source: &str,
        destination: &str,
    ) -> Result<TransferId> {
        let (blob, blocks, operator) =
            self.inner.plan_blob(&restoration_id, TransferType::Download, source, destination)?;
        self.inner.admit(vec![(blob, blocks, operator)], None)
    }

    /// Registers a batch of transfers under one multi-blob parent.
    ///
    /// All blobs are planned before anything is admitted; a planning failure
    /// for any member rejects the whole batch.
    pub fn add_batch(
        &self,
        restoration_id: RestorationId,
        transfer_type: TransferType,
        items: impl IntoIterator<Item = (String, String)>,
    ) -> Result<TransferId> {
        let mut multi = MultiBlobTransfer::new(restoration_id.clone());
        let mut planned = Vec::new();
        for (source, destination) in items {
            let (mut blob, blocks, operator) =
                self.inner
                    .plan_blob(&restoration_id, transfer_type, &source, &destination)?;
            blob.parent = Some(multi.id);
            multi.blobs.push(blob.id);
            planned.push((blob, blocks, operator));
        }
        self.inner.admit(planned, Some(multi))
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Pauses a blob or multi-blob transfer; progress is preserved.
    pub fn pause(&self, id: TransferId) -> Result<()> {
        self.inner.pause(id)
    }

    /// Pauses every active transfer.
    pub fn pause_all(&self) {
        self.inner.pause_all();
    }

    /// Resumes a paused or failed transfer from recorded progress.
    ///
    /// Re-attaches a wire helper first; if no live client is registered for
    /// the transfer's restoration id, the transfer is forced to `failed` and
    /// the error is returned.
    pub fn resume(&self, id: TransferId) -> Result<()> {
        self.inner.resume(id)
    }

    /// Resumes every resumable transfer, optionally only those owned by one
    /// restoration id. Per-transfer reconnection failures are reported on
    /// the transfer, not retried.
    pub fn resume_all(&self, restoration_id: Option<&RestorationId>) {
        self.inner.resume_all(restoration_id);
    }

    /// Cancels a transfer; terminal, but the record remains until removed.
    pub fn cancel(&self, id: TransferId) -> Result<()> {
        self.inner.cancel(id)
    }

    /// Cancels a transfer and deletes its records from the durable store.
    pub fn remove(&self, id: TransferId) -> Result<()> {
        self.inner.remove(id)
    }

    /// Removes every known transfer.
    pub fn remove_all(&self) -> Result<()> {
        let roots = self.inner.index.lock().roots();
        for id in roots {
            self.inner.remove(id)?;
        }
        Ok(())
    }

    /// Rebuilds the wire helper for a blob (or every blob of a multi)
    /// without resuming it.
    pub fn reconnect(&self, id: TransferId) -> Result<()> {
        self.inner.reconnect(id)
    }

    /// Changes the queue's concurrency cap at runtime.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.inner.queue.set_max_concurrency(max_concurrency);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn transfer_state(&self, id: TransferId) -> Option<TransferState> {
        self.inner.index.lock().get(id).map(|r| r.state())
    }

    pub fn progress(&self, id: TransferId) -> Option<TransferProgress> {
        let index = self.inner.index.lock();
        progress_of(&index, id)
    }

    /// Last recorded error message for a blob or block, if any.
    pub fn last_error(&self, id: TransferId) -> Option<String> {
        let index = self.inner.index.lock();
        match index.get(id)? {
            TransferRecord::Block(b) => b.last_error.clone(),
            TransferRecord::Blob(b) => b.last_error.clone(),
            TransferRecord::Multi(_) => None,
        }
    }

    /// Ids of all root transfers (blobs and multi-blobs).
    pub fn roots(&self) -> Vec<TransferId> {
        self.inner.index.lock().roots()
    }

    /// True when no operation is queued or running.
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_idle()
    }

    /// Resolves once the queue drains.
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await;
    }
}

/// Progress snapshot for any entity kind.
fn progress_of(index: &TransferIndex, id: TransferId) -> Option<TransferProgress> {
    match index.get(id)? {
        TransferRecord::Block(b) => Some(TransferProgress::new(
            b.bytes_transferred,
            b.range_len().unwrap_or(0),
        )),
        TransferRecord::Blob(_) => index
            .blob_progress(id)
            .map(|(bytes, total)| TransferProgress::new(bytes, total)),
        TransferRecord::Multi(_) => index
            .multi_progress(id)
            .map(|(bytes, total)| TransferProgress::new(bytes, total)),
    }
}

impl ManagerInner {
    // ========================================================================
    // Planning and admission
    // ========================================================================

    /// Builds the blob record, its block records, and the wire helper for a
    /// new transfer. Nothing is admitted yet.
    fn plan_blob(
        &self,
        restoration_id: &RestorationId,
        transfer_type: TransferType,
        source: &str,
        destination: &str,
    ) -> Result<(BlobTransfer, Vec<BlockTransfer>, BlobOperator)> {
        let client = self
            .registry
            .lookup(restoration_id)
            .ok_or_else(|| TransferError::MissingClient(restoration_id.clone()))?;
        let mut blob = BlobTransfer::new(restoration_id.clone(), transfer_type, source, destination);
        let mut blocks = Vec::new();

        let operator = match transfer_type {
            TransferType::Upload => {
                let uploader = client.make_uploader(source, destination)?;
                let plan = uploader.block_plan()?;
                blob.total_bytes_to_transfer = plan.iter().map(|e| e.len()).sum();
                for entry in &plan {
                    let block =
                        BlockTransfer::new(blob.id, entry.block_id.clone(), entry.start, entry.end);
                    blob.blocks.push(block.id);
                    blocks.push(block);
                }
                blob.total_blocks = blocks.len();
                // Uploads know everything upfront; no probe needed.
                blob.initial_call_complete = true;
                BlobOperator::Upload(uploader)
            }
            TransferType::Download => {
                let downloader = client.make_downloader(source, destination)?;
                let placeholder = BlockTransfer::placeholder(blob.id);
                blob.blocks.push(placeholder.id);
                blob.total_blocks = 1;
                blocks.push(placeholder);
                BlobOperator::Download(downloader)
            }
        };
        Ok((blob, blocks, operator))
    }

    /// Inserts planned transfers into the index, persists them, and queues
    /// their first wave of operations. Returns the root id.
    fn admit(
        &self,
        planned: Vec<(BlobTransfer, Vec<BlockTransfer>, BlobOperator)>,
        multi: Option<MultiBlobTransfer>,
    ) -> Result<TransferId> {
        let root = multi
            .as_ref()
            .map(|m| m.id)
            .or_else(|| planned.first().map(|(b, _, _)| b.id))
            .ok_or(TransferError::Client("empty batch".into()))?;

        let mut notes = Vec::new();
        let mut operations = Vec::new();
        {
            let mut index = self.index.lock();
            let mut records = Vec::new();
            let mut blob_ids = Vec::new();
            for (blob, blocks, operator) in planned {
                blob_ids.push(blob.id);
                self.operators.lock().insert(blob.id, operator);
                for block in blocks {
                    records.push(TransferRecord::Block(block));
                }
                records.push(TransferRecord::Blob(blob));
            }
            if let Some(m) = multi {
                records.push(TransferRecord::Multi(m));
            }
            // Persist the initial shape before anything can run; a store
            // failure here rejects the submission outright.
            self.store.save(&records)?;
            for record in records {
                index.insert(record);
            }
            for blob_id in blob_ids {
                operations.extend(self.queue_blob_locked(&mut index, blob_id, &mut notes));
            }
        }
        debug!(root = %root, ops = operations.len(), "admitted transfer");
        self.queue.add_batch(operations);
        self.notify(notes);
        Ok(root)
    }

    /// Plans and activates the next wave of operations for a blob. Call with
    /// the index lock held; returns the operations for submission after the
    /// lock is dropped.
    fn queue_blob_locked(
        &self,
        index: &mut TransferIndex,
        blob_id: TransferId,
        notes: &mut Vec<Note>,
    ) -> Vec<QueuedOperation> {
        let Some(operator) = self.operators.lock().get(&blob_id).cloned() else {
            warn!(blob = %blob_id, "no wire helper attached; not queueing");
            return Vec::new();
        };
        let Some(blob) = index.blob(blob_id) else {
            return Vec::new();
        };
        let plan = build_operations(index, blob, &operator);

        for bid in &plan.activated_blocks {
            if let Some(block) = index.block_mut(*bid) {
                if block.state.can_transition(TransferState::InProgress) {
                    block.state = TransferState::InProgress;
                }
            }
        }
        let mut parent = None;
        if let Some(blob) = index.blob_mut(blob_id) {
            if blob.state.can_transition(TransferState::InProgress) {
                blob.state = TransferState::InProgress;
            }
            parent = blob.parent;
        }
        if let Some((bytes, total)) = index.blob_progress(blob_id) {
            if let Some(blob) = index.blob_mut(blob_id) {
                blob.bytes_transferred = bytes;
                notes.push(Note {
                    id: blob_id,
                    state: blob.state,
                    progress: Some(TransferProgress::new(bytes, total)),
                });
            }
        }
        if let Some(pid) = parent {
            if let Some(m) = index.multi_mut(pid) {
                if m.state.can_transition(TransferState::InProgress) {
                    m.state = TransferState::InProgress;
                    notes.push(Note {
                        id: pid,
                        state: TransferState::InProgress,
                        progress: None,
                    });
                }
            }
            self.persist_ids(index, &[pid]);
        }
        self.persist_subtree(index, blob_id);
        plan.operations
    }

    // ========================================================================
    // Queue event handling
    // ========================================================================

    fn handle_event(&self, event: OperationEvent) {
        let mut notes = Vec::new();
        let mut requeue = Vec::new();
        {
            let mut index = self.index.lock();
            match event.kind {
                OperationKind::Block => self.apply_block(&mut index, &event, &mut notes),
                OperationKind::Initial => {
                    self.apply_initial(&mut index, &event, &mut notes, &mut requeue)
                }
                OperationKind::Finish => self.apply_finish(&mut index, &event, &mut notes),
            }
        }
        if !requeue.is_empty() {
            self.queue.add_batch(requeue);
        }
        self.notify(notes);
    }

    fn apply_block(
        &self,
        index: &mut TransferIndex,
        event: &OperationEvent,
        notes: &mut Vec<Note>,
    ) {
        let Some(block) = index.block_mut(event.transfer) else {
            // Settled after removal; nothing to record.
            return;
        };
        // Partial progress is never discarded, whatever the outcome.
        block.bytes_transferred = block.bytes_transferred.max(event.bytes_transferred);
        if block.state.is_active() {
            match event.outcome {
                OperationOutcome::Succeeded => {
                    block.state = TransferState::Completed;
                    block.last_error = None;
                }
                OperationOutcome::Failed => {
                    block.state = TransferState::Failed;
                    block.last_error = event.error.clone();
                }
                // Pause/cancel already set the state before the operation
                // resolved; leave it alone.
                OperationOutcome::Canceled | OperationOutcome::Skipped => {}
            }
        }

        let blob_id = event.group;
        if let Some((bytes, total)) = index.blob_progress(blob_id) {
            if let Some(blob) = index.blob_mut(blob_id) {
                blob.bytes_transferred = bytes;
                if event.outcome == OperationOutcome::Failed && blob.state.is_active() {
                    // The blob's state flips when its finishing step skips;
                    // record the first cause now.
                    if blob.last_error.is_none() {
                        blob.last_error = event.error.clone();
                    }
                }
                if blob.state.is_active() {
                    notes.push(Note {
                        id: blob_id,
                        state: blob.state,
                        progress: Some(TransferProgress::new(bytes, total)),
                    });
                }
            }
        }
        self.persist_ids(index, &[event.transfer, blob_id]);
    }

    fn apply_initial(
        &self,
        index: &mut TransferIndex,
        event: &OperationEvent,
        notes: &mut Vec<Note>,
        requeue: &mut Vec<QueuedOperation>,
    ) {
        let blob_id = event.group;
        match event.outcome {
            OperationOutcome::Succeeded => {
                let Some(probe) = event.probe.clone() else {
                    warn!(blob = %blob_id, "probe settled without metadata; ignoring");
                    return;
                };
                debug!(
                    blob = %blob_id,
                    total = probe.total_bytes,
                    first_chunk = probe.first_chunk_bytes,
                    remaining = probe.remaining_plan.len(),
                    "probe complete; re-planning download"
                );

                if let Some(block) = index.block_mut(event.transfer) {
                    block.end_range = probe.first_chunk_bytes;
                    block.bytes_transferred = probe.first_chunk_bytes;
                    // The first chunk is on disk regardless of any pause
                    // that raced the probe.
                    block.state = TransferState::Completed;
                    block.last_error = None;
                }

                let mut new_blocks = Vec::new();
                for entry in &probe.remaining_plan {
                    new_blocks.push(BlockTransfer::new(
                        blob_id,
                        entry.block_id.clone(),
                        entry.start,
                        entry.end,
                    ));
                }
                let Some(blob) = index.blob_mut(blob_id) else {
                    return;
                };
                blob.total_bytes_to_transfer = probe.total_bytes;
                blob.initial_call_complete = true;
                for block in &new_blocks {
                    blob.blocks.push(block.id);
                }
                blob.total_blocks = blob.blocks.len();
                let active = blob.state.is_active();
                for block in new_blocks {
                    index.insert(TransferRecord::Block(block));
                }
                if let Some((bytes, _)) = index.blob_progress(blob_id) {
                    if let Some(blob) = index.blob_mut(blob_id) {
                        blob.bytes_transferred = bytes;
                    }
                }
                if active {
                    requeue.extend(self.queue_blob_locked(index, blob_id, notes));
                } else {
                    // Paused mid-probe: keep the results, run nothing.
                    self.persist_subtree(index, blob_id);
                }
            }
            OperationOutcome::Failed => {
                if let Some(block) = index.block_mut(event.transfer) {
                    if block.state.is_active() {
                        block.state = TransferState::Failed;
                        block.last_error = event.error.clone();
                    }
                }
                self.fail_blob(index, blob_id, event.error.clone(), notes);
                self.persist_subtree(index, blob_id);
            }
            OperationOutcome::Canceled | OperationOutcome::Skipped => {}
        }
    }

    fn apply_finish(
        &self,
        index: &mut TransferIndex,
        event: &OperationEvent,
        notes: &mut Vec<Note>,
    ) {
        let blob_id = event.transfer;
        match event.outcome {
            OperationOutcome::Succeeded => {
                let mut parent = None;
                if let Some(blob) = index.blob_mut(blob_id) {
                    if blob.state.is_active() {
                        blob.state = TransferState::Completed;
                        blob.last_error = None;
                        parent = blob.parent;
                        let total = blob.total_bytes_to_transfer;
                        blob.bytes_transferred = total;
                        notes.push(Note {
                            id: blob_id,
                            state: TransferState::Completed,
                            progress: Some(TransferProgress::new(total, total)),
                        });
                        info!(blob = %blob_id, bytes = total, "transfer completed");
                    }
                }
                // The wire helper is done; let the embedder's resources go.
                self.operators.lock().remove(&blob_id);
                if let Some(pid) = parent {
                    self.refresh_multi(index, pid, notes);
                }
                self.persist_subtree(index, blob_id);
            }
            OperationOutcome::Failed => {
                self.fail_blob(index, blob_id, event.error.clone(), notes);
                self.persist_ids(index, &[blob_id]);
            }
            OperationOutcome::Skipped => {
                // Only fails the blob if it is still trying to run; a skip
                // caused by pause/cancel is not a failure.
                self.fail_blob(
                    index,
                    blob_id,
                    Some(TransferError::IncompleteBlockSet.to_string()),
                    notes,
                );
                self.persist_ids(index, &[blob_id]);
            }
            OperationOutcome::Canceled => {}
        }
    }

    /// Forces an active blob to `failed`, keeping recorded progress.
    fn fail_blob(
        &self,
        index: &mut TransferIndex,
        blob_id: TransferId,
        error: Option<String>,
        notes: &mut Vec<Note>,
    ) {
        let mut parent = None;
        if let Some(blob) = index.blob_mut(blob_id) {
            if !blob.state.is_active() {
                return;
            }
            blob.state = TransferState::Failed;
            if blob.last_error.is_none() {
                blob.last_error = error.clone();
            }
            parent = blob.parent;
            warn!(blob = %blob_id, error = ?blob.last_error, "transfer failed");
        }
        if let Some((bytes, total)) = index.blob_progress(blob_id) {
            notes.push(Note {
                id: blob_id,
                state: TransferState::Failed,
                progress: Some(TransferProgress::new(bytes, total)),
            });
        }
        if let Some(pid) = parent {
            self.refresh_multi(index, pid, notes);
        }
    }

    /// Re-derives a multi-blob transfer's state once no child is active.
    fn refresh_multi(
        &self,
        index: &mut TransferIndex,
        multi_id: TransferId,
        notes: &mut Vec<Note>,
    ) {
        let Some(multi) = index.multi(multi_id) else {
            return;
        };
        let states: Vec<TransferState> = multi
            .blobs
            .iter()
            .filter_map(|bid| index.blob(*bid))
            .map(|b| b.state)
            .collect();
        if states.iter().any(|s| s.is_active()) {
            return;
        }
        let next = if states.iter().all(|s| *s == TransferState::Completed) {
            TransferState::Completed
        } else if states.iter().any(|s| *s == TransferState::Failed) {
            TransferState::Failed
        } else if states.iter().all(|s| *s == TransferState::Canceled) {
            TransferState::Canceled
        } else {
            return;
        };
        if let Some(multi) = index.multi_mut(multi_id) {
            if multi.state != next {
                multi.state = next;
                let progress = index
                    .multi_progress(multi_id)
                    .map(|(b, t)| TransferProgress::new(b, t));
                notes.push(Note {
                    id: multi_id,
                    state: next,
                    progress,
                });
                self.persist_ids(index, &[multi_id]);
            }
        }
    }

    // ========================================================================
    // Control paths
    // ========================================================================

    fn pause(&self, id: TransferId) -> Result<()> {
        let mut notes = Vec::new();
        let groups;
        {
            let mut index = self.index.lock();
            match index.get(id) {
                None => return Err(TransferError::UnknownTransfer(id)),
                Some(TransferRecord::Block(_)) => {
                    return Err(TransferError::UnknownTransfer(id));
                }
                Some(_) => {}
            }
            groups = self.pause_tree_locked(&mut index, id, &mut notes);
        }
        for blob_id in groups {
            self.queue.cancel_group(blob_id);
        }
        self.notify(notes);
        Ok(())
    }

    fn pause_all(&self) {
        let mut notes = Vec::new();
        let mut groups = Vec::new();
        {
            let mut index = self.index.lock();
            for root in index.roots() {
                groups.extend(self.pause_tree_locked(&mut index, root, &mut notes));
            }
        }
        for blob_id in groups {
            self.queue.cancel_group(blob_id);
        }
        self.notify(notes);
    }

    /// Marks every active record under `root` paused and persists the
    /// subtree. Returns the blob ids whose queued operations must be
    /// canceled once the lock drops.
    fn pause_tree_locked(
        &self,
        index: &mut TransferIndex,
        root: TransferId,
        notes: &mut Vec<Note>,
    ) -> Vec<TransferId> {
        let ids = index.subtree(root);
        let mut groups = Vec::new();
        let mut changed = Vec::new();
        for id in &ids {
            let Some(record) = index.get_mut(*id) else {
                continue;
            };
            let is_blob = matches!(record, TransferRecord::Blob(_));
            if record.state().is_active() {
                record.set_state(TransferState::Paused);
                if is_blob {
                    groups.push(*id);
                }
                if !matches!(record, TransferRecord::Block(_)) {
                    changed.push(*id);
                }
            }
        }
        for id in changed {
            notes.push(Note {
                id,
                state: TransferState::Paused,
                progress: progress_of(index, id),
            });
        }
        self.persist_ids(index, &ids);
        groups
    }

    fn resume(&self, id: TransferId) -> Result<()> {
        let mut notes = Vec::new();
        let mut operations = Vec::new();
        let result;
        {
            let mut index = self.index.lock();
            result = match index.get(id) {
                None | Some(TransferRecord::Block(_)) => {
                    Err(TransferError::UnknownTransfer(id))
                }
                Some(TransferRecord::Blob(_)) => {
                    self.resume_blob_locked(&mut index, id, &mut notes, &mut operations)
                }
                Some(TransferRecord::Multi(m)) => {
                    let children = m.blobs.clone();
                    let mut first_err = None;
                    for blob_id in children {
                        if let Err(e) = self.resume_blob_locked(
                            &mut index,
                            blob_id,
                            &mut notes,
                            &mut operations,
                        ) {
                            first_err.get_or_insert(e);
                        }
                    }
                    match first_err {
                        Some(e) => Err(e),
                        None => Ok(()),
                    }
                }
            };
        }
        self.queue.add_batch(operations);
        self.notify(notes);
        result
    }

    fn resume_all(&self, restoration_id: Option<&RestorationId>) {
        let mut notes = Vec::new();
        let mut operations = Vec::new();
        {
            let mut index = self.index.lock();
            let roots = index.roots();
            for root in roots {
                let blob_ids: Vec<TransferId> = match index.get(root) {
                    Some(TransferRecord::Blob(b)) => {
                        if restoration_id.is_some_and(|rid| *rid != b.restoration_id) {
                            continue;
                        }
                        vec![root]
                    }
                    Some(TransferRecord::Multi(m)) => {
                        if restoration_id.is_some_and(|rid| *rid != m.restoration_id) {
                            continue;
                        }
                        m.blobs.clone()
                    }
                    _ => continue,
                };
                for blob_id in blob_ids {
                    if let Err(e) =
                        self.resume_blob_locked(&mut index, blob_id, &mut notes, &mut operations)
                    {
                        // Reported on the transfer itself; not retried here.
                        warn!(blob = %blob_id, error = %e, "resume failed");
                    }
                }
            }
        }
        self.queue.add_batch(operations);
        self.notify(notes);
    }

    /// Resumes one resumable blob. No-op for blobs in any other state.
    fn resume_blob_locked(
        &self,
        index: &mut TransferIndex,
        blob_id: TransferId,
        notes: &mut Vec<Note>,
        operations: &mut Vec<QueuedOperation>,
    ) -> Result<()> {
        let Some(blob) = index.blob(blob_id) else {
            return Err(TransferError::UnknownTransfer(blob_id));
        };
        if !blob.state.is_resumable() {
            return Ok(());
        }
        let block_ids = blob.blocks.clone();

        if let Err(e) = self.ensure_operator_locked(index, blob_id) {
            if let Some(blob) = index.blob_mut(blob_id) {
                blob.state = TransferState::Failed;
                blob.last_error = Some(e.to_string());
            }
            notes.push(Note {
                id: blob_id,
                state: TransferState::Failed,
                progress: progress_of(index, blob_id),
            });
            self.persist_ids(index, &[blob_id]);
            return Err(e);
        }

        for bid in block_ids {
            if let Some(block) = index.block_mut(bid) {
                if block.state.is_resumable() {
                    block.state = TransferState::Pending;
                    block.last_error = None;
                }
            }
        }
        if let Some(blob) = index.blob_mut(blob_id) {
            blob.state = TransferState::Pending;
            blob.last_error = None;
        }
        operations.extend(self.queue_blob_locked(index, blob_id, notes));
        Ok(())
    }

    /// Returns the live wire helper for a blob, rebuilding it from the
    /// client registry if this process has never had one (i.e. after a
    /// restart). The rebuilt helper is seeded with recorded progress so work
    /// restarts from the right offset.
    fn ensure_operator_locked(
        &self,
        index: &TransferIndex,
        blob_id: TransferId,
    ) -> Result<BlobOperator> {
        if let Some(operator) = self.operators.lock().get(&blob_id) {
            return Ok(operator.clone());
        }
        let blob = index
            .blob(blob_id)
            .ok_or(TransferError::UnknownTransfer(blob_id))?;
        let client = self
            .registry
            .lookup(&blob.restoration_id)
            .ok_or_else(|| TransferError::MissingClient(blob.restoration_id.clone()))?;
        let operator = match blob.transfer_type {
            TransferType::Upload => {
                BlobOperator::Upload(client.make_uploader(&blob.source, &blob.destination)?)
            }
            TransferType::Download => {
                BlobOperator::Download(client.make_downloader(&blob.source, &blob.destination)?)
            }
        };
        operator.seed_progress(blob.bytes_transferred, blob.total_bytes_to_transfer);
        debug!(blob = %blob_id, endpoint = client.endpoint(), "reattached wire helper");
        self.operators.lock().insert(blob_id, operator.clone());
        Ok(operator)
    }

    fn reconnect(&self, id: TransferId) -> Result<()> {
        let index = self.index.lock();
        let blob_ids: Vec<TransferId> = match index.get(id) {
            Some(TransferRecord::Blob(_)) => vec![id],
            Some(TransferRecord::Multi(m)) => m.blobs.clone(),
            _ => return Err(TransferError::UnknownTransfer(id)),
        };
        for blob_id in blob_ids {
            self.ensure_operator_locked(&index, blob_id)?;
        }
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<()> {
        let mut notes = Vec::new();
        let mut groups = Vec::new();
        {
            let mut index = self.index.lock();
            match index.get(id) {
                None | Some(TransferRecord::Block(_)) => {
                    return Err(TransferError::UnknownTransfer(id));
                }
                Some(_) => {}
            }
            let ids = index.subtree(id);
            for tid in &ids {
                let Some(record) = index.get_mut(*tid) else {
                    continue;
                };
                let state = record.state();
                if state.is_active() || state == TransferState::Paused {
                    record.set_state(TransferState::Canceled);
                    if !matches!(record, TransferRecord::Block(_)) {
                        notes.push(Note {
                            id: *tid,
                            state: TransferState::Canceled,
                            progress: None,
                        });
                    }
                }
                if matches!(record, TransferRecord::Blob(_)) {
                    groups.push(*tid);
                    self.operators.lock().remove(tid);
                }
            }
            self.persist_ids(&index, &ids);
        }
        for blob_id in groups {
            self.queue.cancel_group(blob_id);
        }
        self.notify(notes);
        Ok(())
    }

    fn remove(&self, id: TransferId) -> Result<()> {
        let mut notes = Vec::new();
        let mut groups = Vec::new();
        {
            let mut index = self.index.lock();
            let removed = index.remove_cascade(id);
            if removed.is_empty() {
                return Err(TransferError::UnknownTransfer(id));
            }
            self.store.delete(id)?;
            for record in &removed {
                if matches!(record, TransferRecord::Blob(_)) {
                    groups.push(record.id());
                    self.operators.lock().remove(&record.id());
                }
                if !matches!(record, TransferRecord::Block(_)) {
                    notes.push(Note {
                        id: record.id(),
                        state: TransferState::Deleted,
                        progress: None,
                    });
                }
            }
        }
        for blob_id in groups {
            self.queue.cancel_group(blob_id);
        }
        info!(root = %id, "removed transfer");
        self.notify(notes);
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Loads every persisted record into the index.
    ///
    /// Records that were mid-flight when the previous process died load as
    /// paused; nothing auto-resumes. A block whose parent record is missing
    /// is store corruption and fails the whole load.
    fn load_context(&self) -> Result<()> {
        let records = self.store.fetch_all()?;

        let known: std::collections::HashSet<TransferId> =
            records.iter().map(|r| r.id()).collect();
        for record in &records {
            if let TransferRecord::Block(block) = record {
                if !known.contains(&block.parent) {
                    error!(block = %block.id, parent = %block.parent, "orphaned block record");
                    return Err(TransferError::OrphanBlock(block.id));
                }
            }
        }

        let mut index = self.index.lock();
        let mut loaded = 0usize;
        for mut record in records {
            if record.state().is_active() {
                record.set_state(TransferState::Paused);
            }
            index.insert(record);
            loaded += 1;
        }
        info!(records = loaded, "loaded persisted transfers");
        Ok(())
    }

    // ========================================================================
    // Persistence and notification plumbing
    // ========================================================================

    /// Best-effort persistence on the event path; the in-memory index stays
    /// authoritative if the store misbehaves.
    fn persist_ids(&self, index: &TransferIndex, ids: &[TransferId]) {
        let records: Vec<TransferRecord> = ids
            .iter()
            .filter_map(|id| index.get(*id))
            .cloned()
            .collect();
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.store.save(&records) {
            error!(error = %e, "failed to persist transfer records");
        }
    }

    fn persist_subtree(&self, index: &TransferIndex, root: TransferId) {
        let ids = index.subtree(root);
        self.persist_ids(index, &ids);
    }

    fn notify(&self, notes: Vec<Note>) {
        if notes.is_empty() {
            return;
        }
        let observer = self.observer.lock().clone();
        let Some(observer) = observer else { return };
        for note in notes {
            observer.on_transfer_state_changed(note.id, note.state, note.progress);
        }
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.inner.index.lock();
        f.debug_struct("TransferManager")
            .field("records", &index.len())
            .field("queue", &self.inner.queue)
            .finish()
    }
}
