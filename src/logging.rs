//! Tracing setup for the CLI.
//!
//! - stderr: compact, filtered by `RUST_LOG` (default `warn`, `info` with `--verbose`)
//! - `.storyforge/logs/storyforge.log.<date>`: JSON lines, daily rotation
//!
//! User-facing status lines are printed by the commands themselves and are
//! not affected by the filter.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "storyforge.log";

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "info" } else { "warn" }
}

pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process so buffered file output is flushed on exit.
///
/// Without a usable `log_dir` only the stderr layer is installed.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    let file = log_dir
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .map(|dir| tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX)));

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            let installed = tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            installed.ok().map(|_| guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}
