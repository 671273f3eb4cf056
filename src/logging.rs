//! Tracing setup for the anvil binary.
//!
//! Two sinks:
//! - stderr, compact, for the operator watching a run
//! - `.anvil/logs/anvil.log.<date>`, JSON, daily rotation, for post-mortems
//!
//! Progress lines meant for humans are printed with `console` by the
//! commands themselves and are not routed through here.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter directive for a given verbosity.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "anvil=debug" } else { "anvil=info" }
}

/// Build an `EnvFilter` from `RUST_LOG`, falling back to the default directive.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Initialize the global subscriber.
///
/// When `log_dir` is given and writable, a JSON file layer is added; the
/// returned guard must be held until exit so buffered lines get flushed.
/// Calling this twice is harmless: the second registration is ignored.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .with_filter(env_filter(verbose));

    let file = log_dir
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .map(|dir| tracing_appender::non_blocking(rolling::daily(dir, "anvil.log")));

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(true)
                .with_target(true)
                .with_filter(env_filter(verbose));

            let _ = tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_tracks_verbosity() {
        assert_eq!(default_directive(false), "anvil=info");
        assert_eq!(default_directive(true), "anvil=debug");
    }

    #[test]
    fn test_init_creates_log_dir_and_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let guard = init(Some(&log_dir), false);
        assert!(guard.is_some());
        assert!(log_dir.is_dir());
    }
}
