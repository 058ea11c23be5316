//! Operation queue: dependency-aware, bounded-concurrency scheduling of
//! network actions.

mod operation;
mod scheduler;

pub use operation::{
    Operation, OperationEvent, OperationId, OperationKind, OperationOutcome, OperationResult,
    QueuedOperation,
};
pub use scheduler::{EventSink, OperationQueue};
