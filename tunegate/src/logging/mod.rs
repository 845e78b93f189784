//! Logging initialization.
//!
//! Console output plus a non-blocking daily log file. The filter comes from
//! `RUST_LOG` with a crate-scoped default. Log lines never carry secrets;
//! components attach `session_id`, `tuner_slot` and `correlation_id` as
//! structured fields.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::Result;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "tunegate=info,enigma2=info,sqlx=warn,tower_http=info";

/// Initialize the global subscriber.
///
/// The returned guard must be held for the process lifetime so buffered
/// file output is flushed on shutdown.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file_appender = tracing_appender::rolling::daily(log_dir, "tunegate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    Ok(guard)
}
