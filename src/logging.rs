//! Logging configuration and initialization.
//!
//! This module sets up the tracing subscriber based on the application
//! configuration, supporting stdout, stderr, and file output with
//! configurable formats.

use std::fs::OpenOptions;
use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
///
/// # Arguments
///
/// * `config` - The logging configuration
/// * `level_override` - Optional level override from CLI/environment
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
) -> io::Result<WorkerGuard> {
    let level = level_override
        .as_ref()
        .unwrap_or(&config.level)
        .to_lowercase();

    // RUST_LOG wins; otherwise derive directives from the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&level)));

    let (writer, guard) = match config.output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        path => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_appender::non_blocking(file)
        }
    };

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }

    Ok(guard)
}

/// Builds the filter directives for a configured level, quieting noisy
/// dependencies unless the user asks for everything via `RUST_LOG`.
fn filter_directives(level: &str) -> String {
    let level = match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    };
    format!("{level},hyper=warn,notify=warn")
}
