//! Watcher module for reacting to successful package builds
//!
//! This module provides everything between a broker delivery and the
//! processes it starts: the watch-list, event matching, the artifact
//! pipeline and the external command seam.
//!
//! # Overview
//!
//! For every delivery the watcher:
//! 1. Decodes the build event
//! 2. Validates that it names a complete build
//! 3. Finds the matching watch entry, if any
//! 4. Downloads, installs and triggers for that entry
//!
//! # Modules
//!
//! - [`watch_list`]: Watched builds and the users they run as
//! - [`matcher`]: Event decoding, validation and matching
//! - [`pipeline`]: The fetch → install → trigger pipeline
//! - [`runner`]: External command execution
//! - [`logging`]: Structured logging configuration
//! - [`watcher`]: Dispatcher and service wiring

pub mod logging;
pub mod matcher;
pub mod pipeline;
pub mod runner;
pub mod watch_list;
#[allow(clippy::module_inception)]
pub mod watcher;

pub use matcher::EventMatcher;
pub use pipeline::{
    artifact_dir_name, trigger_log_name, ArtifactPipeline, PipelineError, PipelineOutcome,
    PipelineSettings, Stage,
};
pub use runner::{CommandError, CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use watch_list::{SystemUsers, UserIdentity, UserResolver, WatchEntry, WatchList};
pub use watcher::{DispatchOutcome, Dispatcher, Watcher};
