//! Storage clients and the restoration-id registry.
//!
//! A [`StorageClient`] holds whatever credentials and endpoint knowledge the
//! embedding application uses to talk to object storage; the engine never
//! inspects it beyond asking for upload/download helpers. Clients are bound
//! to persisted transfers through a [`RestorationId`] so a transfer written
//! to the durable store can be reattached to a freshly re-created client
//! after a cold start.
//!
//! The registry holds clients weakly: the application owns its clients, and
//! once the owner drops one, lookups return `None` instead of keeping it
//! alive. A dead entry no longer counts as registered, so re-registering the
//! same id after a restart succeeds.

mod operator;

pub use operator::{
    plan_blocks, BlobDownloader, BlobOperator, BlobUploader, BlockOutcome, BlockPlanEntry,
    ProbeInfo,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{Result, TransferError};

/// Stable identifier binding persisted transfers to the client context
/// needed to resume them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestorationId(String);

impl RestorationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RestorationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RestorationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Credentials/endpoint holder supplied by the embedding application.
///
/// The factories construct the per-blob wire helpers; any construction
/// failure surfaces as [`TransferError::Client`] and forces the affected
/// transfer to `failed`.
pub trait StorageClient: Send + Sync {
    /// Base endpoint this client talks to (for logging only).
    fn endpoint(&self) -> &str;

    /// Builds an upload helper for one source/destination pair.
    fn make_uploader(&self, source: &str, destination: &str) -> Result<Arc<dyn BlobUploader>>;

    /// Builds a download helper for one source/destination pair.
    fn make_downloader(&self, source: &str, destination: &str) -> Result<Arc<dyn BlobDownloader>>;
}

/// Maps restoration ids to live clients, holding them weakly.
#[derive(Default)]
pub struct ClientRegistry {
    entries: Mutex<HashMap<RestorationId, Weak<dyn StorageClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client under `id`.
    ///
    /// Fails with [`TransferError::DuplicateRestorationId`] if a *live*
    /// client is already registered under the same id; the original
    /// registration remains intact. An entry whose owner has dropped the
    /// client is treated as absent.
    pub fn register(&self, id: RestorationId, client: &Arc<dyn StorageClient>) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id) {
            if existing.upgrade().is_some() {
                return Err(TransferError::DuplicateRestorationId(id));
            }
        }
        entries.insert(id, Arc::downgrade(client));
        Ok(())
    }

    /// Looks up the live client for `id`, or `None` if none was registered
    /// or the owner has released it.
    pub fn lookup(&self, id: &RestorationId) -> Option<Arc<dyn StorageClient>> {
        self.entries.lock().get(id).and_then(Weak::upgrade)
    }

    /// Drops the entry for `id`, if any.
    pub fn unregister(&self, id: &RestorationId) {
        self.entries.lock().remove(id);
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}
