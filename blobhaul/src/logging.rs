//! Tracing integration for structured logging.
//!
//! Embedding applications call [`init_logging`] once at startup; the engine
//! itself only emits `tracing` events and never installs a subscriber on its
//! own.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// `verbosity` maps 0=error, 1=warn, 2=info, 3=debug, 4+=trace. The
/// `RUST_LOG` environment variable overrides the computed filter.
///
/// Returns an error message if a global subscriber is already installed.
pub fn init_logging(verbosity: u8) -> Result<(), String> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("blobhaul={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_error() {
        // Whichever call wins the race installs the subscriber; the second
        // must fail cleanly instead of panicking.
        let first = init_logging(2);
        let second = init_logging(2);
        assert!(first.is_ok() || second.is_err());
    }
}
