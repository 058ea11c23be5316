//! Bounded-concurrency scheduler over an explicit dependency graph.
//!
//! Nodes are keyed by [`OperationId`]; edges point at the operations a node
//! must wait for. Dispatch walks waiting nodes in submission order and starts
//! a node only when every dependency settled `Succeeded` and a concurrency
//! slot is free. A dependency that settled `Failed`, `Canceled` or `Skipped`
//! settles the dependent `Skipped` without dispatching it — this is what
//! keeps a finishing step from ever running against an incomplete block set.
//!
//! Cancellation is cooperative: waiting nodes settle `Canceled` immediately;
//! running nodes get their [`CancellationToken`] fired and settle through
//! their normal completion path. Every settled node emits exactly one
//! [`OperationEvent`] to the sink, outside the queue lock (the sink re-enters
//! the transfer manager, which may call back into the queue).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::operation::{
    Operation, OperationEvent, OperationId, OperationOutcome, OperationResult, QueuedOperation,
};
use crate::transfer::TransferId;

/// Receives one event per settled operation.
pub type EventSink = Arc<dyn Fn(OperationEvent) + Send + Sync>;

struct Node {
    operation: Arc<dyn Operation>,
    dependencies: Vec<OperationId>,
    running: bool,
    cancel: CancellationToken,
}

impl Node {
    fn event(
        &self,
        id: OperationId,
        outcome: OperationOutcome,
    ) -> OperationEvent {
        OperationEvent {
            operation: id,
            transfer: self.operation.transfer(),
            group: self.operation.group(),
            kind: self.operation.kind(),
            outcome,
            bytes_transferred: 0,
            error: None,
            probe: None,
        }
    }
}

struct QueueInner {
    nodes: HashMap<OperationId, Node>,
    /// Waiting node ids in submission order.
    order: Vec<OperationId>,
    /// Outcomes of settled operations, kept for dependency evaluation.
    finished: HashMap<OperationId, OperationOutcome>,
    running: usize,
    max_concurrency: usize,
}

/// Bounded-concurrency operation scheduler.
///
/// Cheap to clone; all clones share the same queue. Must be created inside a
/// tokio runtime: the queue captures the runtime handle so that synchronous
/// control methods can still dispatch work.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Mutex<QueueInner>>,
    sink: EventSink,
    handle: Handle,
    idle: Arc<Notify>,
}

impl OperationQueue {
    /// Creates a queue running at most `max_concurrency` operations at once.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(max_concurrency: usize, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                nodes: HashMap::new(),
                order: Vec::new(),
                finished: HashMap::new(),
                running: 0,
                max_concurrency: max_concurrency.max(1),
            })),
            sink,
            handle: Handle::current(),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Enqueues a single operation.
    pub fn add(&self, operation: QueuedOperation) {
        self.add_batch(vec![operation]);
    }

    /// Enqueues a batch; dependency edges between batch members are in place
    /// before any of them may dispatch.
    pub fn add_batch(&self, operations: Vec<QueuedOperation>) {
        {
            let mut inner = self.inner.lock();
            for queued in operations {
                debug!(
                    op = %queued.id,
                    name = queued.operation.name(),
                    deps = queued.dependencies.len(),
                    "enqueueing operation"
                );
                inner.order.push(queued.id);
                inner.nodes.insert(
                    queued.id,
                    Node {
                        operation: queued.operation,
                        dependencies: queued.dependencies,
                        running: false,
                        cancel: CancellationToken::new(),
                    },
                );
            }
        }
        self.dispatch();
    }

    /// Changes the in-flight cap; affects future dispatch decisions only,
    /// running operations are not preempted.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.inner.lock().max_concurrency = max_concurrency.max(1);
        self.dispatch();
    }

    /// Cancels every queued and in-flight operation. Non-blocking and safe
    /// to call concurrently with ongoing execution.
    pub fn cancel_all(&self) {
        self.cancel_where(|_| true);
    }

    /// Cancels all operations belonging to one owning blob transfer.
    pub fn cancel_group(&self, group: TransferId) {
        self.cancel_where(|op| op.group() == group);
    }

    /// Outcome of a settled operation, if it settled.
    pub fn outcome(&self, id: OperationId) -> Option<OperationOutcome> {
        self.inner.lock().finished.get(&id).copied()
    }

    /// Number of operations waiting for dependencies or a slot.
    pub fn waiting(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Number of operations currently executing.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().running
    }

    /// True when no operation is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// Resolves once the queue has no waiting or running operations.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn cancel_where(&self, pred: impl Fn(&dyn Operation) -> bool) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let order = std::mem::take(&mut inner.order);
            let mut remaining = Vec::new();
            for id in order {
                let matches = inner
                    .nodes
                    .get(&id)
                    .is_some_and(|n| pred(n.operation.as_ref()));
                if matches {
                    let node = inner.nodes.remove(&id).expect("waiting node present");
                    inner.finished.insert(id, OperationOutcome::Canceled);
                    events.push(node.event(id, OperationOutcome::Canceled));
                } else {
                    remaining.push(id);
                }
            }
            inner.order = remaining;

            // Running operations settle through their own completion path.
            for node in inner.nodes.values() {
                if node.running && pred(node.operation.as_ref()) {
                    node.cancel.cancel();
                }
            }
        }
        for event in events {
            (self.sink)(event);
        }
        self.dispatch();
    }

    /// Settles skips and starts every ready node the concurrency cap allows.
    fn dispatch(&self) {
        let mut events = Vec::new();
        let mut to_spawn = Vec::new();
        {
            let mut inner = self.inner.lock();
            let order = std::mem::take(&mut inner.order);
            let mut remaining = Vec::new();
            for id in order {
                if !inner.nodes.contains_key(&id) {
                    continue;
                }

                let mut dep_unsatisfied = false;
                let mut dep_pending = false;
                for dep in &inner.nodes[&id].dependencies {
                    match inner.finished.get(dep) {
                        Some(outcome) if outcome.is_success() => {}
                        Some(_) => {
                            dep_unsatisfied = true;
                            break;
                        }
                        None if inner.nodes.contains_key(dep) => dep_pending = true,
                        None => {
                            // Edges must reference the same or an earlier
                            // submission; anything else is a programming
                            // error in graph construction.
                            warn!(op = %id, dep = %dep, "unknown dependency; skipping dependent");
                            dep_unsatisfied = true;
                            break;
                        }
                    }
                }

                if dep_unsatisfied {
                    let node = inner.nodes.remove(&id).expect("waiting node present");
                    inner.finished.insert(id, OperationOutcome::Skipped);
                    debug!(op = %id, name = node.operation.name(), "skipping: dependency did not succeed");
                    events.push(node.event(id, OperationOutcome::Skipped));
                    continue;
                }
                if dep_pending || inner.running >= inner.max_concurrency {
                    remaining.push(id);
                    continue;
                }

                inner.running += 1;
                let node = inner.nodes.get_mut(&id).expect("waiting node present");
                node.running = true;
                to_spawn.push((id, Arc::clone(&node.operation), node.cancel.clone()));
            }
            inner.order = remaining;
        }

        for event in events {
            (self.sink)(event);
        }
        for (id, operation, cancel) in to_spawn {
            let queue = self.clone();
            self.handle.spawn(async move {
                debug!(op = %id, name = operation.name(), "dispatching operation");
                let result = operation.execute(&cancel).await;
                queue.complete(id, operation, cancel, result);
            });
        }

        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn complete(
        &self,
        id: OperationId,
        operation: Arc<dyn Operation>,
        cancel: CancellationToken,
        result: OperationResult,
    ) {
        let outcome = if cancel.is_cancelled() {
            OperationOutcome::Canceled
        } else if result.error.is_some() {
            OperationOutcome::Failed
        } else {
            OperationOutcome::Succeeded
        };
        {
            let mut inner = self.inner.lock();
            inner.nodes.remove(&id);
            inner.running -= 1;
            inner.finished.insert(id, outcome);
        }

        debug!(
            op = %id,
            name = operation.name(),
            outcome = ?outcome,
            bytes = result.bytes_transferred,
            "operation settled"
        );
        (self.sink)(OperationEvent {
            operation: id,
            transfer: operation.transfer(),
            group: operation.group(),
            kind: operation.kind(),
            outcome,
            bytes_transferred: result.bytes_transferred,
            error: result.error.map(|e| e.to_string()),
            probe: result.probe,
        });
        self.dispatch();
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OperationQueue")
            .field("waiting", &inner.order.len())
            .field("running", &inner.running)
            .field("max_concurrency", &inner.max_concurrency)
            .finish()
    }
}
