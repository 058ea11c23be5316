//! Configuration for the transfer engine.

/// Default maximum number of operations in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Recommended block size for chunked transfer plans (4 MiB).
///
/// Chunking itself is a wire-layer decision: uploaders enumerate their own
/// plan and download probes return theirs. This is the size
/// [`plan_blocks`](crate::client::plan_blocks) callers should reach for
/// absent a better number.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Configuration for a [`TransferManager`](crate::manager::TransferManager).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of operations the queue runs concurrently.
    pub max_concurrency: usize,

    /// Whether connectivity loss pauses all active transfers (and
    /// restoration resumes them).
    pub pause_on_connectivity_loss: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            pause_on_connectivity_loss: true,
        }
    }
}

impl EngineConfig {
    /// Sets the concurrency cap.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Disables the connectivity-driven pause/resume control loop.
    pub fn without_connectivity_control(mut self) -> Self {
        self.pause_on_connectivity_loss = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert!(config.pause_on_connectivity_loss);
    }

    #[test]
    fn concurrency_clamps_to_one() {
        let config = EngineConfig::default().with_max_concurrency(0);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn connectivity_control_can_be_disabled() {
        let config = EngineConfig::default().without_connectivity_control();
        assert!(!config.pause_on_connectivity_loss);
    }
}
