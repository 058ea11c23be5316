//! blobhaul: a resumable multi-part transfer engine for object storage.
//!
//! The engine moves large objects between local storage and an object store
//! in independently-transferable blocks, surviving process restarts and
//! connectivity loss. The embedding application supplies the wire layer (a
//! [`client::StorageClient`] producing per-blob upload/download helpers) and
//! a [`store::DurableStore`]; the engine owns chunking, scheduling,
//! dependency ordering, state persistence and pause/resume semantics.
//!
//! # Architecture
//!
//! ```text
//! TransferManager ──owns──> TransferIndex   (arena of Block/Blob/Multi records)
//!        │                  OperationQueue  (bounded concurrency + dep edges)
//!        │                  ClientRegistry  (restoration id -> weak client)
//!        │                  DurableStore    (system of record)
//!        └──reacts to─────> ConnectivityMonitor
//! ```
//!
//! Uploads chunk upfront: every block becomes one queued operation, and a
//! block-list commit depends on all of them. Downloads start with a single
//! size probe; the blob is re-planned into range operations once the size is
//! known, with a finalize step depending on them. A dependency that fails or
//! is canceled skips its dependents, so a finishing step can never run over
//! an incomplete block set.
//!
//! # Example
//!
//! ```no_run
//! use blobhaul::client::RestorationId;
//! use blobhaul::config::EngineConfig;
//! use blobhaul::connectivity::ManualConnectivityMonitor;
//! use blobhaul::manager::TransferManager;
//! use blobhaul::store::JsonFileStore;
//! use std::sync::Arc;
//!
//! # fn client() -> Arc<dyn blobhaul::client::StorageClient> { unimplemented!() }
//! # async fn run() -> blobhaul::Result<()> {
//! let store = Arc::new(JsonFileStore::open("transfers.json")?);
//! let monitor = Arc::new(ManualConnectivityMonitor::default());
//! let manager = TransferManager::new(EngineConfig::default(), store, monitor);
//!
//! let client = client();
//! manager.register_client(RestorationId::new("account-1"), &client)?;
//! manager.start_managing()?;
//!
//! let id = manager.add_upload(RestorationId::new("account-1"), "/data/big.bin", "backups/big.bin")?;
//! manager.wait_idle().await;
//! println!("{:?}", manager.transfer_state(id));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod store;
pub mod transfer;

pub use client::{RestorationId, StorageClient};
pub use config::EngineConfig;
pub use error::{Result, TransferError};
pub use manager::{TransferManager, TransferObserver, TransferProgress};
pub use transfer::{TransferId, TransferState, TransferType};
