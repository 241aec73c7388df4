//! `src/logging.rs`
//! ============================================================================
//! Tracing setup for the cache engine.
//!
//! Two layers: a non-blocking daily-rolling file sink capturing everything
//! the `RUST_LOG` filter admits, and a terse stderr sink for warnings and
//! errors. Cache events carry `marker = "CACHE_OPERATION"` fields so the
//! log file can be grepped per subsystem.

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub struct Logger;

impl Logger {
    /// Install the global subscriber. Returns the appender guard; hold it
    /// for the lifetime of the program or tail log lines are lost.
    ///
    /// # Errors
    /// Fails when a global subscriber is already installed.
    pub fn init_tracing(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
        let file_appender = rolling::daily(log_dir, "dpfm-core.log");
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();

        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter_fn(|meta| *meta.level() <= tracing::Level::WARN));

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init()?;

        Ok(guard)
    }
}
