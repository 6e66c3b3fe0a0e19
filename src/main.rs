//! obs-watcher - react to successful package builds
//!
#![doc = "obs-watcher - react to successful package builds"]
#![doc = "Main entry point for the obs-watcher service."]

use std::path::{Path, PathBuf};

use anyhow::Result;

use obs_watcher::broker::redact_url;
use obs_watcher::cli::{Cli, Commands};
use obs_watcher::config::{default_config_path, Config};
use obs_watcher::error::WatcherError;
use obs_watcher::watcher::logging::{init_watcher_logging, setup_subscriber};
use obs_watcher::watcher::{SystemUsers, Watcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = match &cli.config {
        Some(path) => PathBuf::from(path),
        None => default_config_path(cli.server.unwrap_or_default()),
    };
    // Loading may warn about ignored overrides before logging is configured
    let config = tracing::subscriber::with_default(setup_subscriber(), || {
        Config::load(&config_path, &cli)
    })?;

    // Validate configuration and resolve users before touching the system
    config.validate()?;
    let watch_list = config.watch_list(&SystemUsers)?;

    create_runtime_dir(&config.download_dir)?;
    create_runtime_dir(&config.log_dir)?;

    init_watcher_logging(&config.logging, &config.log_file())?;

    let profile = config.profile();
    tracing::info!(
        config = %config_path.display(),
        server = %profile.kind,
        "Found {} package(s) to listen for:\n{}",
        watch_list.len(),
        watch_list.summary()
    );

    match cli.command {
        Commands::Check => {
            println!("Broker:      {}", redact_url(&profile.broker_url));
            println!("Routing key: {}", profile.routing_key());
            println!("Packages:    {}", watch_list.len());
            for entry in &watch_list {
                println!("  {entry}");
            }
            Ok(())
        }
        Commands::Listen { dry_run, .. } => {
            tracing::info!("Starting listen mode");
            if dry_run {
                tracing::warn!("Dry-run: matched packages will not be downloaded or installed");
            }

            let mut watcher = Watcher::new(&config, watch_list, dry_run)?;
            tokio::select! {
                result = watcher.start() => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                    Ok(())
                }
            }
        }
    }
}

/// Create a runtime directory (with parents) if it does not exist yet.
fn create_runtime_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|source| WatcherError::RuntimeDir {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
