//! Error types for the transfer engine.

use thiserror::Error;

use crate::client::RestorationId;
use crate::store::StoreError;
use crate::transfer::TransferId;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors surfaced by the transfer engine.
///
/// Nothing in this taxonomy is retried by the engine itself; retry is a
/// resume decision made by the caller after inspecting `failed` state.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A client is already registered under this restoration id.
    #[error("a client is already registered for restoration id {0}")]
    DuplicateRestorationId(RestorationId),

    /// No live client is registered for the restoration id.
    ///
    /// Raised when a resume is attempted after a restart and the owning
    /// client was never re-registered. The affected transfer is forced to
    /// `failed`; the caller must re-register and resume again.
    #[error("no client registered for restoration id {0}")]
    MissingClient(RestorationId),

    /// Network or transport failure reported by an operator.
    #[error("network failure: {0}")]
    Network(String),

    /// The storage client failed to construct an upload/download helper.
    #[error("client error: {0}")]
    Client(String),

    /// A persisted block transfer has no surviving parent.
    ///
    /// Indicates store corruption. Fatal: reported loudly, never repaired.
    #[error("store corruption: block transfer {0} has no parent")]
    OrphanBlock(TransferId),

    /// The transfer id is not present in the in-memory index.
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    /// A finishing operation was skipped because one or more of its block
    /// operations did not complete successfully.
    #[error("finishing step skipped: one or more block operations did not complete")]
    IncompleteBlockSet,

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
