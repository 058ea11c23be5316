//! End-to-end engine scenarios against scripted storage clients.
//!
//! The scripted client lets each test control exactly when blocks complete
//! (through semaphore gates), which blocks fail, and what a download probe
//! reports, so ordering guarantees can be asserted deterministically.

use blobhaul::client::{
    plan_blocks, BlobDownloader, BlobUploader, BlockOutcome, BlockPlanEntry, ProbeInfo,
    RestorationId, StorageClient,
};
use blobhaul::config::EngineConfig;
use blobhaul::connectivity::{ManualConnectivityMonitor, Reachability};
use blobhaul::error::TransferError;
use blobhaul::manager::{TransferManager, TransferObserver, TransferProgress};
use blobhaul::store::{DurableStore, MemoryStore};
use blobhaul::transfer::{TransferId, TransferState, TransferType};
use blobhaul::Result;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted wire layer
// ============================================================================

#[derive(Default)]
struct UploadScript {
    /// Per-block gate; when present, each put_block must acquire a permit.
    gate: Option<Arc<Semaphore>>,
    /// Protocol block id that should fail with a network error.
    fail_block: Option<String>,
    commits: AtomicUsize,
    committed_ids: Mutex<Vec<String>>,
}

struct ScriptedUploader {
    plan: Vec<BlockPlanEntry>,
    script: Arc<UploadScript>,
}

impl BlobUploader for ScriptedUploader {
    fn block_plan(&self) -> Result<Vec<BlockPlanEntry>> {
        Ok(self.plan.clone())
    }

    fn put_block<'a>(
        &'a self,
        block_id: &'a str,
        start: u64,
        end: u64,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, BlockOutcome> {
        Box::pin(async move {
            if let Some(gate) = &self.script.gate {
                tokio::select! {
                    _ = cancel.cancelled() => return BlockOutcome::success(0),
                    permit = gate.acquire() => permit.expect("gate closed").forget(),
                }
            }
            if self.script.fail_block.as_deref() == Some(block_id) {
                return BlockOutcome::failure(
                    0,
                    TransferError::Network(format!("connection reset uploading {block_id}")),
                );
            }
            BlockOutcome::success(end - start)
        })
    }

    fn commit_block_list<'a>(&'a self, block_ids: Vec<String>) -> BoxFuture<'a, BlockOutcome> {
        Box::pin(async move {
            self.script.commits.fetch_add(1, Ordering::SeqCst);
            *self.script.committed_ids.lock() = block_ids;
            BlockOutcome::success(0)
        })
    }

    fn seed_progress(&self, _bytes: u64, _total: u64) {}
}

#[derive(Default)]
struct DownloadScript {
    finalizes: AtomicUsize,
    fetched: Mutex<Vec<(u64, u64)>>,
    fail_probe: bool,
}

struct ScriptedDownloader {
    total: u64,
    first_chunk: u64,
    chunk: u64,
    script: Arc<DownloadScript>,
}

impl BlobDownloader for ScriptedDownloader {
    fn probe<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, Result<ProbeInfo>> {
        Box::pin(async move {
            if self.script.fail_probe {
                return Err(TransferError::Network("metadata request timed out".into()));
            }
            let mut remaining_plan = Vec::new();
            let mut start = self.first_chunk;
            let mut ordinal = 1u32;
            while start < self.total {
                let end = (start + self.chunk).min(self.total);
                remaining_plan.push(BlockPlanEntry {
                    block_id: format!("{ordinal:08}"),
                    start,
                    end,
                });
                start = end;
                ordinal += 1;
            }
            Ok(ProbeInfo {
                total_bytes: self.total,
                first_chunk_bytes: self.first_chunk,
                remaining_plan,
            })
        })
    }

    fn get_range<'a>(
        &'a self,
        start: u64,
        end: u64,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, BlockOutcome> {
        Box::pin(async move {
            self.script.fetched.lock().push((start, end));
            BlockOutcome::success(end - start)
        })
    }

    fn finalize<'a>(&'a self) -> BoxFuture<'a, BlockOutcome> {
        Box::pin(async move {
            self.script.finalizes.fetch_add(1, Ordering::SeqCst);
            BlockOutcome::success(0)
        })
    }

    fn seed_progress(&self, _bytes: u64, _total: u64) {}
}

struct ScriptedClient {
    total_bytes: u64,
    block_size: u64,
    upload: Arc<UploadScript>,
    download: Arc<DownloadScript>,
    first_chunk: u64,
}

impl ScriptedClient {
    fn new(total_bytes: u64, block_size: u64) -> Self {
        Self {
            total_bytes,
            block_size,
            upload: Arc::new(UploadScript::default()),
            download: Arc::new(DownloadScript::default()),
            first_chunk: block_size,
        }
    }

    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        Arc::get_mut(&mut self.upload)
            .expect("script not shared yet")
            .gate = Some(gate);
        self
    }

    fn with_failing_block(mut self, block_id: &str) -> Self {
        Arc::get_mut(&mut self.upload)
            .expect("script not shared yet")
            .fail_block = Some(block_id.to_string());
        self
    }

    fn with_failing_probe(mut self) -> Self {
        Arc::get_mut(&mut self.download)
            .expect("script not shared yet")
            .fail_probe = true;
        self
    }
}

impl StorageClient for ScriptedClient {
    fn endpoint(&self) -> &str {
        "https://storage.test.invalid"
    }

    fn make_uploader(&self, _source: &str, _destination: &str) -> Result<Arc<dyn BlobUploader>> {
        Ok(Arc::new(ScriptedUploader {
            plan: plan_blocks(self.total_bytes, self.block_size),
            script: Arc::clone(&self.upload),
        }))
    }

    fn make_downloader(
        &self,
        _source: &str,
        _destination: &str,
    ) -> Result<Arc<dyn BlobDownloader>> {
        Ok(Arc::new(ScriptedDownloader {
            total: self.total_bytes,
            first_chunk: self.first_chunk.min(self.total_bytes),
            chunk: self.block_size,
            script: Arc::clone(&self.download),
        }))
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct RecordingObserver {
    events: Mutex<Vec<(TransferId, TransferState, Option<TransferProgress>)>>,
}

impl TransferObserver for RecordingObserver {
    fn on_transfer_state_changed(
        &self,
        id: TransferId,
        state: TransferState,
        progress: Option<TransferProgress>,
    ) {
        self.events.lock().push((id, state, progress));
    }
}

fn rid() -> RestorationId {
    RestorationId::new("acct-1")
}

fn manager_with(store: Arc<dyn DurableStore>) -> (TransferManager, Arc<ManualConnectivityMonitor>) {
    let monitor = Arc::new(ManualConnectivityMonitor::new(Reachability::ReachableWan));
    let manager = TransferManager::new(EngineConfig::default(), store, monitor.clone());
    (manager, monitor)
}

/// Polls `pred` until it holds or two seconds elapse.
async fn wait_until(pred: impl Fn() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

// ============================================================================
// Upload scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_waits_for_every_block() {
    let gate = Arc::new(Semaphore::new(2));
    let client = Arc::new(ScriptedClient::new(30, 10).with_gate(gate.clone()));
    let script = Arc::clone(&client.upload);
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();

    // Two of three blocks can finish; the commit must not run yet.
    wait_until(|| mgr.progress(id).is_some_and(|p| p.bytes_transferred == 20)).await;
    assert_eq!(script.commits.load(Ordering::SeqCst), 0);
    assert_eq!(mgr.transfer_state(id), Some(TransferState::InProgress));

    gate.add_permits(1);
    wait_until(|| mgr.transfer_state(id) == Some(TransferState::Completed)).await;

    assert_eq!(script.commits.load(Ordering::SeqCst), 1);
    // The commit names all blocks in range order.
    assert_eq!(
        *script.committed_ids.lock(),
        vec!["00000000", "00000001", "00000002"]
    );
}

#[tokio::test]
async fn failed_block_skips_commit_and_fails_blob() {
    let client = Arc::new(ScriptedClient::new(30, 10).with_failing_block("00000001"));
    let script = Arc::clone(&client.upload);
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
    mgr.wait_idle().await;

    assert_eq!(mgr.transfer_state(id), Some(TransferState::Failed));
    assert_eq!(script.commits.load(Ordering::SeqCst), 0);
    let error = mgr.last_error(id).unwrap();
    assert!(error.contains("connection reset"));
    // Progress from the healthy blocks is retained.
    assert_eq!(mgr.progress(id).unwrap().bytes_transferred, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_preserves_progress_and_resume_finishes() {
    let gate = Arc::new(Semaphore::new(1));
    let client = Arc::new(ScriptedClient::new(30, 10).with_gate(gate.clone()));
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
    wait_until(|| mgr.progress(id).is_some_and(|p| p.bytes_transferred == 10)).await;

    mgr.pause(id).unwrap();
    mgr.wait_idle().await;
    assert_eq!(mgr.transfer_state(id), Some(TransferState::Paused));
    assert_eq!(mgr.progress(id).unwrap().bytes_transferred, 10);

    gate.add_permits(2);
    mgr.resume(id).unwrap();
    wait_until(|| mgr.transfer_state(id) == Some(TransferState::Completed)).await;

    assert_eq!(mgr.progress(id).unwrap().bytes_transferred, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_is_terminal() {
    let gate = Arc::new(Semaphore::new(0));
    let client = Arc::new(ScriptedClient::new(30, 10).with_gate(gate.clone()));
    let script = Arc::clone(&client.upload);
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
    wait_until(|| mgr.transfer_state(id) == Some(TransferState::InProgress)).await;

    mgr.cancel(id).unwrap();
    mgr.wait_idle().await;

    assert_eq!(mgr.transfer_state(id), Some(TransferState::Canceled));
    assert_eq!(script.commits.load(Ordering::SeqCst), 0);
    // Canceled is not resumable; resume must leave it alone.
    mgr.resume(id).unwrap();
    mgr.wait_idle().await;
    assert_eq!(mgr.transfer_state(id), Some(TransferState::Canceled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_cascades_to_child_blocks() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let client = Arc::new(ScriptedClient::new(30, 10).with_gate(gate.clone()));
    let (mgr, _) = manager_with(store.clone());
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
    wait_until(|| mgr.transfer_state(id) == Some(TransferState::InProgress)).await;

    mgr.cancel(id).unwrap();
    mgr.wait_idle().await;

    // Cancellation reaches every child block; none stays runnable.
    let blocks = store.fetch_children(id).unwrap();
    assert_eq!(blocks.len(), 3);
    for block in blocks {
        assert_eq!(block.state(), TransferState::Canceled);
    }
}

#[tokio::test]
async fn batch_groups_blobs_under_one_parent() {
    let client = Arc::new(ScriptedClient::new(20, 10));
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr
        .add_batch(
            rid(),
            TransferType::Upload,
            vec![
                ("/a".to_string(), "c/a".to_string()),
                ("/b".to_string(), "c/b".to_string()),
                ("/c".to_string(), "c/c".to_string()),
            ],
        )
        .unwrap();
    mgr.wait_idle().await;

    assert_eq!(mgr.transfer_state(id), Some(TransferState::Completed));
    let progress = mgr.progress(id).unwrap();
    assert_eq!(progress.bytes_transferred, 60);
    assert_eq!(progress.total_bytes, 60);
}

// ============================================================================
// Download scenarios
// ============================================================================

#[tokio::test]
async fn download_replans_after_probe() {
    let client = Arc::new(ScriptedClient::new(100, 30));
    let script = Arc::clone(&client.download);
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_download(rid(), "c/big.bin", "/data/big.bin").unwrap();
    mgr.wait_idle().await;

    assert_eq!(mgr.transfer_state(id), Some(TransferState::Completed));
    let progress = mgr.progress(id).unwrap();
    assert_eq!(progress.bytes_transferred, 100);
    assert_eq!(progress.total_bytes, 100);
    assert_eq!(script.finalizes.load(Ordering::SeqCst), 1);

    // The probe wrote [0, 30); the planned ranges cover the rest.
    let mut fetched = script.fetched.lock().clone();
    fetched.sort();
    assert_eq!(fetched, vec![(30, 60), (60, 90), (90, 100)]);
}

#[tokio::test]
async fn download_that_fits_in_first_chunk_skips_range_phase() {
    let client = Arc::new(ScriptedClient::new(25, 30));
    let script = Arc::clone(&client.download);
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_download(rid(), "c/small.bin", "/data/small.bin").unwrap();
    mgr.wait_idle().await;

    assert_eq!(mgr.transfer_state(id), Some(TransferState::Completed));
    assert!(script.fetched.lock().is_empty());
    assert_eq!(script.finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.progress(id).unwrap().bytes_transferred, 25);
}

#[tokio::test]
async fn failed_probe_fails_the_download() {
    let client = Arc::new(ScriptedClient::new(100, 30).with_failing_probe());
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_download(rid(), "c/big.bin", "/data/big.bin").unwrap();
    mgr.wait_idle().await;

    assert_eq!(mgr.transfer_state(id), Some(TransferState::Failed));
    assert!(mgr.last_error(id).unwrap().contains("timed out"));
}

// ============================================================================
// Restart and reconnection
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_without_client_fails_resume() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(1));
    let id;
    {
        let client = Arc::new(ScriptedClient::new(30, 10).with_gate(gate.clone()));
        let (mgr, _) = manager_with(store.clone());
        let storage: Arc<dyn StorageClient> = client;
        mgr.register_client(rid(), &storage).unwrap();
        mgr.start_managing().unwrap();
        id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
        wait_until(|| mgr.progress(id).is_some_and(|p| p.bytes_transferred == 10)).await;
        mgr.stop_managing();
        mgr.wait_idle().await;
    }

    // New process: records load as paused, but nobody re-registered a client.
    let (mgr, _) = manager_with(store);
    mgr.start_managing().unwrap();
    assert_eq!(mgr.transfer_state(id), Some(TransferState::Paused));
    assert_eq!(mgr.progress(id).unwrap().bytes_transferred, 10);

    let err = mgr.resume(id).unwrap_err();
    assert!(matches!(err, TransferError::MissingClient(_)));
    assert_eq!(mgr.transfer_state(id), Some(TransferState::Failed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_with_reregistered_client_resumes_from_offset() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(1));
    let id;
    {
        let client = Arc::new(ScriptedClient::new(30, 10).with_gate(gate.clone()));
        let (mgr, _) = manager_with(store.clone());
        let storage: Arc<dyn StorageClient> = client;
        mgr.register_client(rid(), &storage).unwrap();
        mgr.start_managing().unwrap();
        id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
        wait_until(|| mgr.progress(id).is_some_and(|p| p.bytes_transferred == 10)).await;
        mgr.stop_managing();
        mgr.wait_idle().await;
    }

    let client = Arc::new(ScriptedClient::new(30, 10));
    let script = Arc::clone(&client.upload);
    let (mgr, _) = manager_with(store);
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();
    mgr.start_managing().unwrap();

    mgr.resume(id).unwrap();
    wait_until(|| mgr.transfer_state(id) == Some(TransferState::Completed)).await;

    assert_eq!(mgr.progress(id).unwrap().bytes_transferred, 30);
    // The commit still names every block, including the pre-restart one.
    assert_eq!(
        *script.committed_ids.lock(),
        vec!["00000000", "00000001", "00000002"]
    );
}

#[tokio::test]
async fn duplicate_restoration_id_is_rejected() {
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let first: Arc<dyn StorageClient> = Arc::new(ScriptedClient::new(10, 10));
    let second: Arc<dyn StorageClient> = Arc::new(ScriptedClient::new(10, 10));

    mgr.register_client(rid(), &first).unwrap();
    let err = mgr.register_client(rid(), &second).unwrap_err();
    assert!(matches!(err, TransferError::DuplicateRestorationId(_)));
}

// ============================================================================
// Connectivity
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connectivity_loss_pauses_and_restore_resumes() {
    let gate = Arc::new(Semaphore::new(1));
    let client = Arc::new(ScriptedClient::new(30, 10).with_gate(gate.clone()));
    let (mgr, monitor) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();
    mgr.start_managing().unwrap();

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
    wait_until(|| mgr.progress(id).is_some_and(|p| p.bytes_transferred == 10)).await;

    monitor.set_reachability(Reachability::Unreachable);
    mgr.wait_idle().await;
    assert_eq!(mgr.transfer_state(id), Some(TransferState::Paused));
    assert_eq!(mgr.progress(id).unwrap().bytes_transferred, 10);

    gate.add_permits(2);
    monitor.set_reachability(Reachability::ReachableWan);
    wait_until(|| mgr.transfer_state(id) == Some(TransferState::Completed)).await;
}

// ============================================================================
// Removal and observers
// ============================================================================

#[tokio::test]
async fn remove_purges_the_durable_store() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::new(20, 10));
    let (mgr, _) = manager_with(store.clone());
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
    mgr.wait_idle().await;
    assert!(!store.fetch_all().unwrap().is_empty());

    mgr.remove(id).unwrap();
    assert_eq!(mgr.transfer_state(id), None);
    assert!(store.fetch_all().unwrap().is_empty());
}

#[tokio::test]
async fn observer_sees_terminal_state_with_progress() {
    let client = Arc::new(ScriptedClient::new(20, 10));
    let (mgr, _) = manager_with(Arc::new(MemoryStore::new()));
    let storage: Arc<dyn StorageClient> = client;
    mgr.register_client(rid(), &storage).unwrap();

    let observer = Arc::new(RecordingObserver {
        events: Mutex::new(Vec::new()),
    });
    mgr.set_observer(observer.clone());

    let id = mgr.add_upload(rid(), "/data/a.bin", "c/a.bin").unwrap();
    mgr.wait_idle().await;

    let events = observer.events.lock();
    let terminal = events
        .iter()
        .find(|(eid, state, _)| *eid == id && *state == TransferState::Completed)
        .expect("no completion notification");
    assert_eq!(terminal.2, Some(TransferProgress::new(20, 20)));
}
