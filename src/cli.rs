//! Command-line interface definition for obs-watcher
//!
//! This module defines the CLI structure using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::broker::ServerKind;

/// obs-watcher - react to successful package builds
///
/// Listens for build success events from the openSUSE or SUSE build
/// service, downloads and installs the packages you watch, and runs a
/// trigger command for each of them.
#[derive(Parser, Debug, Clone)]
#[command(name = "obs-watcher")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    ///
    /// Defaults to `/etc/obs-watcher/<server>.yaml`.
    #[arg(short, long, env = "OBS_WATCHER_CONFIG")]
    pub config: Option<String>,

    /// Build service to listen to (overrides the config file)
    #[arg(short, long, value_enum)]
    pub server: Option<ServerKind>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for obs-watcher
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Listen for build events and process watched packages
    Listen {
        /// Match events and log hits, but do not download, install or trigger
        #[arg(long)]
        dry_run: bool,

        /// Write logs to this file in addition to stdout
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Emit logs as JSON
        #[arg(long)]
        json_logs: bool,
    },

    /// Validate the configuration and list watched packages
    Check,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: None,
            server: None,
            verbose: false,
            command: Commands::Check,
        }
    }
}
