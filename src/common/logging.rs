//! Logging and tracing configuration
//!
//! Runs are driven by the host test runner, so console output goes through
//! the test writer and is captured per test. A run can additionally append
//! to a log file next to the per-process logs.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name of the run log inside a run's log directory
pub const RUN_LOG_FILE: &str = "run.log";

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("discovery_e2e=info,warn"))
}

/// Initialize tracing for test runs (captured stdout logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable. Safe to call
/// from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(
            fmt::layer()
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init();
}

/// Initialize tracing with an additional run log file
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the duration of the run. Returns `None` when a subscriber was already
/// installed, in which case nothing is written to the file.
pub fn init_file_logging(log_dir: &Path) -> std::io::Result<Option<WorkerGuard>> {
    std::fs::create_dir_all(log_dir)?;

    let appender = tracing_appender::rolling::never(log_dir, RUN_LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer().with_test_writer().with_target(true).compact();

    let installed = tracing_subscriber::registry()
        .with(default_filter())
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_ok();

    Ok(installed.then_some(guard))
}
