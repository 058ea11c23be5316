//! Connectivity monitoring.
//!
//! The engine reacts to reachability transitions: loss pauses every active
//! transfer, restoration resumes the resumable ones. Platform notifiers live
//! outside this crate; embedders forward their events into a
//! [`ManualConnectivityMonitor`] (or implement [`ConnectivityMonitor`]
//! directly).

use parking_lot::Mutex;
use std::sync::Arc;

/// Network reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unreachable,
    ReachableLan,
    ReachableWan,
}

impl Reachability {
    pub fn is_reachable(self) -> bool {
        !matches!(self, Self::Unreachable)
    }
}

/// Callback invoked on every reachability transition.
pub type ReachabilityCallback = Arc<dyn Fn(Reachability) + Send + Sync>;

/// Reports reachability transitions via callback registration.
pub trait ConnectivityMonitor: Send + Sync {
    /// Registers `callback` and begins delivering transitions.
    fn start_listening(&self, callback: ReachabilityCallback);

    /// Stops delivering transitions and drops the callback.
    fn stop_listening(&self);

    /// Last observed reachability.
    fn current(&self) -> Reachability;
}

/// Monitor driven by explicit [`set_reachability`](Self::set_reachability)
/// calls.
///
/// Embedders wire their platform notifier to it; tests drive it directly.
/// Transitions are only delivered while a listener is registered, and
/// repeated reports of the same state are suppressed.
pub struct ManualConnectivityMonitor {
    state: Mutex<Reachability>,
    callback: Mutex<Option<ReachabilityCallback>>,
}

impl ManualConnectivityMonitor {
    pub fn new(initial: Reachability) -> Self {
        Self {
            state: Mutex::new(initial),
            callback: Mutex::new(None),
        }
    }

    /// Records a transition and notifies the listener, if any.
    pub fn set_reachability(&self, next: Reachability) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        // Clone out of the lock; the callback may call back into the engine.
        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            cb(next);
        }
    }
}

impl Default for ManualConnectivityMonitor {
    fn default() -> Self {
        Self::new(Reachability::ReachableWan)
    }
}

impl ConnectivityMonitor for ManualConnectivityMonitor {
    fn start_listening(&self, callback: ReachabilityCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn stop_listening(&self) {
        *self.callback.lock() = None;
    }

    fn current(&self) -> Reachability {
        *self.state.lock()
    }
}
