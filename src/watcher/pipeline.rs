//! Fetch → install → trigger pipeline for a matched build.
//!
//! Each stage produces the only input the next one needs and the first
//! failure stops the run. Failures are returned as a
//! [`PipelineOutcome::Aborted`] value; nothing here panics or propagates
//! an error to the subscription loop.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::unistd::{Gid, Uid};
use thiserror::Error;
use tracing::{error, info};

use super::runner::{CommandError, CommandRunner, CommandSpec};
use super::watch_list::WatchEntry;
use crate::config::Config;

/// Timestamp format of artifact directory names.
const DIR_TIMESTAMP: &str = "%d_%m_%Y_%H_%M_%S";

/// Timestamp format of trigger log names.
const LOG_TIMESTAMP: &str = "%Y-%d-%m_%H-%M-%S";

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Download the built packages.
    Fetch,
    /// Install the downloaded packages.
    Install,
    /// Launch the trigger command.
    Trigger,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Install => "install",
            Self::Trigger => "trigger",
        })
    }
}

/// Errors that abort a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The artifact directory could not be created.
    #[error("could not create {}: {source}", .path.display())]
    CreateDir {
        /// Directory
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The artifact directory is missing right after creating it.
    #[error("{} is not a directory after creation", .0.display())]
    MissingDir(PathBuf),

    /// Ownership of the artifact directory could not be changed.
    #[error("could not chown {} to {user}: {source}", .path.display())]
    Chown {
        /// Directory
        path: PathBuf,
        /// Target user
        user: String,
        /// Underlying errno
        source: nix::errno::Errno,
    },

    /// The artifact pattern is not a valid glob.
    #[error("invalid artifact pattern {pattern}: {source}")]
    Pattern {
        /// Offending pattern
        pattern: String,
        /// Glob parse error
        source: glob::PatternError,
    },

    /// The download produced nothing to install.
    #[error("no artifacts matching {0}")]
    NoArtifacts(String),

    /// The trigger log file could not be created.
    #[error("could not create trigger log {}: {source}", .path.display())]
    TriggerLog {
        /// Log file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// An external command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Result of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// All three stages succeeded.
    Handled {
        /// Directory the packages were downloaded to
        artifact_dir: PathBuf,
        /// Log file receiving the trigger command's output
        trigger_log: PathBuf,
    },
    /// A stage failed; later stages did not run.
    Aborted {
        /// Failed stage
        stage: Stage,
        /// Why it failed
        error: PipelineError,
    },
}

impl PipelineOutcome {
    /// Stage the run stopped at, if it stopped early.
    pub fn aborted_at(&self) -> Option<Stage> {
        match self {
            Self::Handled { .. } => None,
            Self::Aborted { stage, .. } => Some(*stage),
        }
    }

    /// True if every stage succeeded.
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled { .. })
    }
}

/// Paths, tools and limits the pipeline runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Build service API URL for the download tool
    pub api_url: String,
    /// Parent of the per-event artifact directories
    pub download_dir: PathBuf,
    /// Directory for trigger logs
    pub log_dir: PathBuf,
    /// Download tool
    pub download_tool: String,
    /// Install tool
    pub install_tool: String,
    /// Install tool arguments preceding the artifact paths
    pub install_args: Vec<String>,
    /// Glob selecting artifacts inside the artifact directory
    pub artifact_pattern: String,
    /// Timeout for download and install
    pub timeout: Duration,
}

impl PipelineSettings {
    /// Settings derived from the service configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_url: config.profile().api_url,
            download_dir: config.download_dir.clone(),
            log_dir: config.log_dir.clone(),
            download_tool: config.tools.download.clone(),
            install_tool: config.tools.install.clone(),
            install_args: config.tools.install_args.clone(),
            artifact_pattern: config.tools.artifact_pattern.clone(),
            timeout: config.tools.timeout(),
        }
    }
}

/// Name of the artifact directory for `entry` at `now`.
///
/// Distinct seconds give distinct names, so events never share a
/// directory unless they arrive within the same second.
pub fn artifact_dir_name(entry: &WatchEntry, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}_{}",
        entry.project,
        entry.package,
        entry.repo,
        now.format(DIR_TIMESTAMP)
    )
}

/// File name of the trigger log for `entry` at `now`.
pub fn trigger_log_name(entry: &WatchEntry, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}_{}.log",
        entry.project,
        entry.package,
        entry.repo,
        now.format(LOG_TIMESTAMP)
    )
}

/// The fetch → install → trigger pipeline.
pub struct ArtifactPipeline<R: CommandRunner> {
    settings: PipelineSettings,
    runner: R,
}

impl<R: CommandRunner> ArtifactPipeline<R> {
    /// Creates a pipeline.
    pub fn new(settings: PipelineSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    /// Settings in use.
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runner in use.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs all stages for `entry`.
    pub async fn run(&self, entry: &WatchEntry) -> PipelineOutcome {
        let artifact_dir = match self.fetch(entry, Utc::now()).await {
            Ok(dir) => dir,
            Err(error) => return self.abort(entry, Stage::Fetch, error),
        };

        if let Err(error) = self.install(&artifact_dir).await {
            return self.abort(entry, Stage::Install, error);
        }

        let trigger_log = match self.trigger(entry, Utc::now()).await {
            Ok(log) => log,
            Err(error) => return self.abort(entry, Stage::Trigger, error),
        };

        info!(
            entry = %entry.name,
            artifact_dir = %artifact_dir.display(),
            trigger_log = %trigger_log.display(),
            "Package processed"
        );

        PipelineOutcome::Handled {
            artifact_dir,
            trigger_log,
        }
    }

    fn abort(&self, entry: &WatchEntry, stage: Stage, error: PipelineError) -> PipelineOutcome {
        let output = match &error {
            PipelineError::Command(
                CommandError::Failed { output, .. } | CommandError::TimedOut { output, .. },
            ) => output.combined(),
            _ => String::new(),
        };
        error!(
            entry = %entry.name,
            stage = %stage,
            error = %error,
            output = %output,
            "Pipeline aborted"
        );
        PipelineOutcome::Aborted { stage, error }
    }

    /// Stage 1: create a fresh artifact directory owned by the entry's
    /// user and download the built packages into it as that user.
    ///
    /// The directory is left in place if the download fails.
    pub async fn fetch(
        &self,
        entry: &WatchEntry,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, PipelineError> {
        let dir = self
            .settings
            .download_dir
            .join(artifact_dir_name(entry, now));

        info!(dir = %dir.display(), "Making dir");
        std::fs::create_dir_all(&dir).map_err(|source| PipelineError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        if !dir.is_dir() {
            return Err(PipelineError::MissingDir(dir));
        }

        nix::unistd::chown(
            &dir,
            Some(Uid::from_raw(entry.identity.uid)),
            Some(Gid::from_raw(entry.identity.gid)),
        )
        .map_err(|source| PipelineError::Chown {
            path: dir.clone(),
            user: entry.identity.name.clone(),
            source,
        })?;

        let spec = CommandSpec::new(&self.settings.download_tool)
            .args(["-A", self.settings.api_url.as_str(), "getbinaries", "-d"])
            .arg(dir.to_string_lossy())
            .args([
                &entry.project,
                &entry.package,
                &entry.repo,
                &entry.build_arch,
            ])
            .run_as(entry.identity.clone());

        info!(command = %spec, "Calling download tool");
        self.runner.run(&spec, self.settings.timeout).await?;

        Ok(dir)
    }

    /// Stage 2: install every artifact in `dir` matching the pattern.
    ///
    /// Returns the installed paths.
    pub async fn install(&self, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            self.settings.artifact_pattern
        );
        let mut artifacts: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|source| PipelineError::Pattern {
                pattern: pattern.clone(),
                source,
            })?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        artifacts.sort();

        if artifacts.is_empty() {
            return Err(PipelineError::NoArtifacts(pattern));
        }

        let spec = CommandSpec::new(&self.settings.install_tool)
            .args(self.settings.install_args.iter().cloned())
            .args(artifacts.iter().map(|path| path.to_string_lossy().into_owned()));

        info!(command = %spec, "Calling install tool");
        self.runner.run(&spec, self.settings.timeout).await?;

        Ok(artifacts)
    }

    /// Stage 3: launch the entry's trigger command with its output going
    /// to a fresh log file, without waiting for it.
    ///
    /// Returns the log file path.
    pub async fn trigger(
        &self,
        entry: &WatchEntry,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, PipelineError> {
        let log_path = self.settings.log_dir.join(trigger_log_name(entry, now));
        let log = File::create(&log_path).map_err(|source| PipelineError::TriggerLog {
            path: log_path.clone(),
            source,
        })?;

        // The trigger may be a full shell command line; the build is
        // passed as positional parameters after it.
        let script = format!("{} \"$@\"", entry.trigger_cmd);
        let spec = CommandSpec::new("sh").args([
            "-c",
            script.as_str(),
            entry.trigger_cmd.as_str(),
            entry.project.as_str(),
            entry.package.as_str(),
            entry.repo.as_str(),
        ]);

        info!(command = %spec, log = %log_path.display(), "Calling trigger");
        self.runner.launch(&spec, log).await?;

        Ok(log_path)
    }
}
