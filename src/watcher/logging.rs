//! Structured logging setup for the watcher
//!
//! Provides JSON-formatted and human-readable logging to stdout and to the
//! service log file. Integrates with the tracing ecosystem for structured
//! event logging.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::Subscriber;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level used before the configuration is loaded.
const SETUP_LEVEL: &str = "info";

/// Plain stdout subscriber for the startup phase.
///
/// Events emitted while the configuration is being loaded (for example
/// warnings about ignored environment overrides) have no configured
/// subscriber yet. Install this one around that phase with
/// [`tracing::subscriber::with_default`]. `RUST_LOG` is honoured.
pub fn setup_subscriber() -> impl Subscriber + Send + Sync {
    let filter = build_filter(SETUP_LEVEL).unwrap_or_else(|_| EnvFilter::new(SETUP_LEVEL));
    fmt().with_env_filter(filter).with_target(true).finish()
}

/// Initialize watcher logging based on configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Every event is
/// written to stdout and appended to `log_file`.
///
/// # Arguments
///
/// * `config` - Logging configuration
/// * `log_file` - Service log file, created if missing
///
/// # Errors
///
/// Returns error if the level is invalid, the log file cannot be opened,
/// or a global subscriber is already installed
///
/// # Examples
///
/// ```no_run
/// use obs_watcher::config::LoggingConfig;
/// use obs_watcher::watcher::logging::init_watcher_logging;
/// use std::path::Path;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// let result = init_watcher_logging(&config, Path::new("/var/log/obs-watcher/watcher.log"));
/// assert!(result.is_ok());
/// ```
pub fn init_watcher_logging(config: &LoggingConfig, log_file: &Path) -> Result<()> {
    let env_filter = build_filter(&config.level)?;
    let file = Arc::new(open_log_file(log_file)?);

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json_format {
        let stdout_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true);

        let file_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(file);

        registry.with(stdout_layer).with(file_layer).try_init()?;
    } else {
        let stdout_layer = fmt::layer().with_target(true).with_level(true);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(false)
            .with_writer(file);

        registry.with(stdout_layer).with(file_layer).try_init()?;
    }

    Ok(())
}

/// Filter from `RUST_LOG`, falling back to `level`.
fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {level}"))
}

/// Opens `path` for appending, creating it if needed.
fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}
