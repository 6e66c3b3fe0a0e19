//! Configuration management for obs-watcher
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides,
//! and turns the `packages` section into a resolved [`WatchList`].

use crate::broker::{ReconnectPolicy, ServerKind, ServerProfile};
use crate::cli::{Cli, Commands};
use crate::error::{Result, WatcherError};
use crate::watcher::{UserResolver, WatchEntry, WatchList};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Trigger command used when an entry does not set one.
pub const DEFAULT_TRIGGER: &str = "/bin/true";

/// Main configuration structure for obs-watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which build service to listen to
    #[serde(default)]
    pub server: ServerKind,

    /// Override for the profile's broker URL (e.g. a local RabbitMQ)
    #[serde(default)]
    pub broker_url: Option<String>,

    /// Directory per-event artifact directories are created in
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Directory trigger logs (and by default the service log) go to
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// External tool configuration
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Reconnect backoff configuration
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Watched packages, in match order
    #[serde(default)]
    pub packages: Vec<PackageConfig>,
}

/// External tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Download tool (called as `<tool> -A <api> getbinaries -d <dir> ...`)
    #[serde(default = "default_download_tool")]
    pub download: String,

    /// Package install tool
    #[serde(default = "default_install_tool")]
    pub install: String,

    /// Arguments passed to the install tool before the artifact paths
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,

    /// Glob selecting the artifacts to install inside the download dir
    #[serde(default = "default_artifact_pattern")]
    pub artifact_pattern: String,

    /// Timeout for download and install, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on concurrently running trigger commands (unbounded if unset)
    #[serde(default)]
    pub max_concurrent_triggers: Option<usize>,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First delay after a lost connection, in milliseconds (0 = no delay)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Largest delay between attempts, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (defaults to `<log_dir>/watcher.log`)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

/// One watched package as written in the config file
///
/// Every field is read as a string so that a missing field can be
/// reported by name instead of as a generic parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Label used in error messages and logs
    #[serde(default)]
    pub name: Option<String>,

    /// Build service project
    #[serde(default)]
    pub project: String,

    /// Package name
    #[serde(default)]
    pub package: String,

    /// Repository
    #[serde(default)]
    pub repo: String,

    /// Build architecture
    #[serde(default)]
    pub buildarch: String,

    /// Package architecture
    #[serde(default)]
    pub pkg_arch: String,

    /// Local user that downloads and owns the artifacts
    #[serde(default)]
    pub user: String,

    /// Command run after a successful install; `/bin/true` when unset,
    /// null or blank
    #[serde(
        default = "default_trigger_cmd",
        deserialize_with = "deserialize_trigger_cmd"
    )]
    pub trigger_cmd: String,
}

impl PackageConfig {
    fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("#{}", index + 1))
    }

    fn fields(&self) -> [(&'static str, &str); 7] {
        [
            ("project", self.project.as_str()),
            ("package", self.package.as_str()),
            ("repo", self.repo.as_str()),
            ("buildarch", self.buildarch.as_str()),
            ("pkg_arch", self.pkg_arch.as_str()),
            ("user", self.user.as_str()),
            ("trigger_cmd", self.trigger_cmd.as_str()),
        ]
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/run/obs-watcher")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/obs-watcher")
}

fn default_download_tool() -> String {
    "/usr/bin/osc".to_string()
}

fn default_install_tool() -> String {
    "/usr/bin/rpm".to_string()
}

fn default_install_args() -> Vec<String> {
    vec!["-Uvh".to_string()]
}

fn default_artifact_pattern() -> String {
    "*.rpm".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_trigger_cmd() -> String {
    DEFAULT_TRIGGER.to_string()
}

fn deserialize_trigger_cmd<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .filter(|cmd| !cmd.trim().is_empty())
        .unwrap_or_else(default_trigger_cmd))
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            download: default_download_tool(),
            install: default_install_tool(),
            install_args: default_install_args(),
            artifact_pattern: default_artifact_pattern(),
            timeout_secs: default_timeout_secs(),
            max_concurrent_triggers: None,
        }
    }
}

impl ToolsConfig {
    /// Download/install timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Backoff policy for the subscription loop
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

/// Default config file location for a server
///
/// # Examples
///
/// ```
/// use obs_watcher::broker::ServerKind;
/// use obs_watcher::config::default_config_path;
///
/// assert_eq!(
///     default_config_path(ServerKind::Ibs).to_str(),
///     Some("/etc/obs-watcher/ibs.yaml")
/// );
/// ```
pub fn default_config_path(server: ServerKind) -> PathBuf {
    PathBuf::from(format!("/etc/obs-watcher/{}.yaml", server.as_str()))
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path, cli: &Cli) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_vars();
        config.apply_cli_overrides(cli);
        Ok(config)
    }

    /// Parse a configuration from YAML text
    ///
    /// # Errors
    ///
    /// Returns error if the YAML does not describe a configuration
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| WatcherError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WatcherError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&contents)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(url) = std::env::var("OBS_WATCHER_BROKER_URL") {
            self.broker_url = Some(url);
            tracing::debug!("Env override: OBS_WATCHER_BROKER_URL");
        }

        if let Ok(dir) = std::env::var("OBS_WATCHER_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(&dir);
            tracing::debug!(download_dir = %dir, "Env override: OBS_WATCHER_DOWNLOAD_DIR");
        }

        if let Ok(dir) = std::env::var("OBS_WATCHER_LOG_DIR") {
            self.log_dir = PathBuf::from(&dir);
            tracing::debug!(log_dir = %dir, "Env override: OBS_WATCHER_LOG_DIR");
        }

        if let Ok(timeout) = std::env::var("OBS_WATCHER_COMMAND_TIMEOUT") {
            match timeout.parse::<u64>() {
                Ok(v) => {
                    self.tools.timeout_secs = v;
                    tracing::debug!(timeout_secs = v, "Env override: OBS_WATCHER_COMMAND_TIMEOUT");
                }
                Err(_) => {
                    tracing::warn!("Invalid value for OBS_WATCHER_COMMAND_TIMEOUT: {}", timeout);
                }
            }
        }

        if let Ok(level) = std::env::var("OBS_WATCHER_LOG_LEVEL") {
            self.logging.level = level.clone();
            tracing::debug!(level = %level, "Env override: OBS_WATCHER_LOG_LEVEL");
        }

        if let Ok(json_logs) = std::env::var("OBS_WATCHER_JSON_LOGS") {
            match json_logs.parse::<bool>() {
                Ok(v) => {
                    self.logging.json_format = v;
                    tracing::debug!(json_logs = v, "Env override: OBS_WATCHER_JSON_LOGS");
                }
                Err(_) => {
                    tracing::warn!("Invalid value for OBS_WATCHER_JSON_LOGS: {}", json_logs);
                }
            }
        }

        if let Ok(log_file) = std::env::var("OBS_WATCHER_LOG_FILE") {
            self.logging.file_path = Some(PathBuf::from(&log_file));
            tracing::debug!(log_file = %log_file, "Env override: OBS_WATCHER_LOG_FILE");
        }
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(server) = cli.server {
            self.server = server;
        }

        if cli.verbose {
            self.logging.level = "debug".to_string();
        }

        if let Commands::Listen {
            log_file,
            json_logs,
            ..
        } = &cli.command
        {
            if let Some(path) = log_file {
                self.logging.file_path = Some(path.clone());
            }
            if *json_logs {
                self.logging.json_format = true;
            }
        }
    }

    /// Validate the configuration
    ///
    /// Ensures that the package list is usable and that timeouts and
    /// backoff values are within range. User names are checked later,
    /// when the watch-list is resolved.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.packages.is_empty() {
            return Err(WatcherError::Config(
                "No packages configured to listen for".to_string(),
            )
            .into());
        }

        for (index, package) in self.packages.iter().enumerate() {
            for (field, value) in package.fields() {
                if value.trim().is_empty() {
                    return Err(WatcherError::Config(format!(
                        "Package monitor section [{}] does not specify: [{}]",
                        package.label(index),
                        field
                    ))
                    .into());
                }
            }
        }

        if self.tools.timeout_secs == 0 {
            return Err(WatcherError::Config(
                "tools.timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.tools.max_concurrent_triggers == Some(0) {
            return Err(WatcherError::Config(
                "tools.max_concurrent_triggers must be greater than 0 when set".to_string(),
            )
            .into());
        }

        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(WatcherError::Config(
                "reconnect.max_backoff_ms must not be smaller than reconnect.initial_backoff_ms"
                    .to_string(),
            )
            .into());
        }

        if self.tools.download.trim().is_empty() || self.tools.install.trim().is_empty() {
            return Err(
                WatcherError::Config("tools.download and tools.install must be set".to_string())
                    .into(),
            );
        }

        Ok(())
    }

    /// Server profile with the broker URL override applied
    pub fn profile(&self) -> ServerProfile {
        let profile = self.server.profile();
        match &self.broker_url {
            Some(url) => profile.with_broker_url(url.clone()),
            None => profile,
        }
    }

    /// Effective service log file
    pub fn log_file(&self) -> PathBuf {
        self.logging
            .file_path
            .clone()
            .unwrap_or_else(|| self.log_dir.join("watcher.log"))
    }

    /// Resolve the `packages` section into a watch-list
    ///
    /// Each entry's `user` is looked up exactly once here.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::UnknownUser`] if a user does not exist
    pub fn watch_list(&self, users: &dyn UserResolver) -> Result<WatchList> {
        let mut entries = Vec::with_capacity(self.packages.len());

        for (index, package) in self.packages.iter().enumerate() {
            let identity = users.resolve(&package.user)?;
            entries.push(WatchEntry {
                name: package.label(index),
                project: package.project.clone(),
                package: package.package.clone(),
                repo: package.repo.clone(),
                build_arch: package.buildarch.clone(),
                pkg_arch: package.pkg_arch.clone(),
                user: package.user.clone(),
                trigger_cmd: package.trigger_cmd.clone(),
                identity,
            });
        }

        Ok(WatchList::new(entries))
    }
}
