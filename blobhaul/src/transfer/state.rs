//! Transfer state machine.
//!
//! Happy path: `Pending → InProgress → Completed`. Pause and resume move a
//! transfer through `Paused → Pending`; a failure leaves it in `Failed` until
//! an explicit resume. `Canceled`, `Completed` and `Deleted` are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a transfer entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Waiting to be queued or dispatched.
    Pending,
    /// Operations for this transfer are queued or running.
    InProgress,
    /// Suspended by the user or by connectivity loss; resumable.
    Paused,
    /// Canceled by the user; terminal, never resumable.
    Canceled,
    /// A network or client error stopped the transfer; resumable only by an
    /// explicit reconnect + resume.
    Failed,
    /// All required operations, including the finishing step, succeeded.
    Completed,
    /// The entity was removed from the index and the durable store.
    Deleted,
}

impl TransferState {
    /// Active transfers are the only ones the manager queues operations for.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Resumable states are the ones a resume call is meaningful for.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Paused | Self::Failed)
    }

    /// Terminal states never transition again (except to `Deleted` via
    /// explicit removal).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Completed | Self::Deleted)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Removal (`Deleted`) is reachable from every state, since entities are
    /// destroyed only via explicit removal, never implicitly on completion.
    pub fn can_transition(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Pending, InProgress) | (Pending, Paused) | (Pending, Canceled) => true,
            (InProgress, Completed)
            | (InProgress, Paused)
            | (InProgress, Canceled)
            | (InProgress, Failed) => true,
            (Paused, Pending) | (Paused, Canceled) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InProgress => "inProgress",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}
