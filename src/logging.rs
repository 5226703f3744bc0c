//! Tracing subscriber setup.
//!
//! Everything is driven by [`AppConfig`]: `log_level` for the crate,
//! `sql_log_level` for sqlx statement logging, `rotation` for the file
//! appender and `use_json` for the output format. `RUST_LOG` overrides the
//! filter when set.

use crate::config::{AppConfig, Rotation};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is not set.
pub fn filter_directives(config: &AppConfig) -> String {
    format!("{},sqlx={}", config.log_level, config.sql_log_level)
}

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation {
        Rotation::Hourly => rolling::hourly(&config.log_dir, &config.log_file),
        Rotation::Daily => rolling::daily(&config.log_dir, &config.log_file),
        Rotation::Never => rolling::never(&config.log_dir, &config.log_file),
    }
}

/// Install the global subscriber. Keep the guard alive for the life of the
/// process or buffered file output is lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(config));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    tracing::debug!(
        rotation = ?config.rotation,
        json = config.use_json,
        dir = %config.log_dir,
        "Logging initialized"
    );
    guard
}
