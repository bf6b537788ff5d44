//! Structured logging for debugging stackwise.
//!
//! Levels follow the usual tracing conventions:
//! - ERROR: failures that abort a run
//! - WARN: recoverable problems (cleanup failures, retries)
//! - INFO: run, layer and task lifecycle
//! - DEBUG: git and adapter traces
//! - TRACE: raw tool output
//!
//! Logs go to `~/.stackwise/stackwise.log`, truncated on startup. Verbose
//! mode (`--verbose` or `STACKWISE_DEBUG=1`) raises the default level to
//! DEBUG and mirrors output to stderr. `STACKWISE_LOG` takes a full
//! `EnvFilter` directive and overrides both.

use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Config;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "STACKWISE_LOG";

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "STACKWISE_DEBUG";

/// Whether debug logging was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "stackwise=debug"
    } else {
        "stackwise=info"
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbose: bool) {
    let verbose = verbose || env_debug();
    let filter = || {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
    };

    let file_layer = Config::stackwise_dir().ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        let file = File::create(dir.join("stackwise.log")).ok()?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(filter()),
        )
    });

    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });

    // A subscriber may already be installed (tests, embedding callers).
    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
}
