//! Error types for obs-watcher
//!
//! Component-level failures (decoding, pipeline stages, broker sessions)
//! have their own `thiserror` enums next to the code that raises them.
//! This module holds the errors that surface at setup time and end the
//! process before the subscription loop starts.

use thiserror::Error;

/// Setup-time error type for obs-watcher
///
/// These are all fatal: the service refuses to start rather than run
/// with a partial watch-list or without its runtime directories.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Configuration-related errors (missing fields, bad values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A watch entry names a user that does not exist on this host
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Runtime directory could not be created
    #[error("Could not create directory {}: {source}", .path.display())]
    RuntimeDir {
        /// Directory that could not be created
        path: std::path::PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Fatal broker condition that ended the subscription loop
    #[error("Broker error: {0}")]
    Broker(String),
}

/// Result type alias for obs-watcher operations
///
/// Uses `anyhow::Error` so setup code can attach context while still
/// carrying a [`WatcherError`] underneath.
pub type Result<T> = anyhow::Result<T>;
