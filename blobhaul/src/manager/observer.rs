//! Observer surface for state and progress notifications.

use crate::transfer::{TransferId, TransferState};

/// Progress snapshot delivered alongside a state notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    /// Known total; 0 while a download's size is still unknown.
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: u64) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
        }
    }

    /// Completion fraction in `0.0..=1.0`, or `None` while the total is
    /// unknown.
    pub fn fraction(&self) -> Option<f64> {
        (self.total_bytes > 0).then(|| self.bytes_transferred as f64 / self.total_bytes as f64)
    }
}

/// Receives state-change and progress notifications.
///
/// Called after the engine has released its internal locks, so observers may
/// call back into the manager. Implementations should still return quickly;
/// long work belongs on the embedder's own executor.
pub trait TransferObserver: Send + Sync {
    fn on_transfer_state_changed(
        &self,
        id: TransferId,
        state: TransferState,
        progress: Option<TransferProgress>,
    );
}
