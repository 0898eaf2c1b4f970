//! Tracing subscriber setup for the command shell.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! shell's job. Stderr always gets a compact fmt layer. In verbose mode a
//! daily-rolling file under the log directory is added, written through a
//! non-blocking worker whose guard must outlive every event.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{TdlError, TdlResult};

/// Log file prefix; the appender adds the date.
pub const LOG_FILE: &str = "tdl.log";

/// Default filter directive for the given verbosity.
#[must_use]
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides the default filter. Returns the file writer guard
/// in verbose mode; dropping it flushes pending lines. A second call in the
/// same process keeps the first subscriber.
///
/// # Errors
/// Returns an error if the log directory cannot be created.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> TdlResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    let (file, guard) = match log_dir.filter(|_| verbose) {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                TdlError::io(format!("failed to create log directory {}", dir.display()), e)
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(guard)
}
