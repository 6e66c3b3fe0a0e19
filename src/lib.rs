//! obs-watcher - react to successful package builds
//!
//! This library listens on the openSUSE (OBS) or SUSE (IBS) build service
//! message bus for "package build succeeded" events, matches them against a
//! configured watch-list, and for every match downloads the built packages,
//! installs them, and launches a trigger command.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `broker`: Server profiles, build events, and the reconnecting AMQP subscription
//! - `watcher`: Watch-list, event matching, artifact pipeline, and dispatch
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use obs_watcher::watcher::{SystemUsers, Watcher};
//! use obs_watcher::Config;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Path::new("/etc/obs-watcher/obs.yaml"), &Default::default())?;
//!     config.validate()?;
//!
//!     let watch_list = config.watch_list(&SystemUsers)?;
//!     Watcher::new(&config, watch_list, false)?.start().await
//! }
//! ```

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod watcher;

// Re-export commonly used types
pub use broker::{BuildEvent, ServerKind};
pub use config::Config;
pub use error::{Result, WatcherError};
pub use watcher::{Watcher, WatchEntry, WatchList};

#[cfg(test)]
pub mod test_utils;
