//! Test utilities for obs-watcher
//!
//! This module provides temporary directories, watch entries, and
//! in-memory fakes for the broker and for external commands.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::broker::{
    BrokerMessage, Connector, MessageHandler, Session, SubscriptionError, SubscriptionTarget,
};
use crate::error::WatcherError;
use crate::watcher::{
    CommandError, CommandOutput, CommandRunner, CommandSpec, UserIdentity, UserResolver,
    WatchEntry,
};

/// Create a temporary directory for testing
///
/// # Returns
///
/// Returns a TempDir that will be cleaned up when dropped
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Watch entry owned by the user running the tests, triggering `/bin/true`
pub fn watch_entry(project: &str, package: &str, repo: &str, arch: &str) -> WatchEntry {
    let identity = UserIdentity::current();
    WatchEntry {
        name: package.to_string(),
        project: project.to_string(),
        package: package.to_string(),
        repo: repo.to_string(),
        build_arch: arch.to_string(),
        pkg_arch: arch.to_string(),
        user: identity.name.clone(),
        trigger_cmd: "/bin/true".to_string(),
        identity,
    }
}

/// Resolver over a fixed user table
pub struct StaticUsers {
    users: HashMap<String, UserIdentity>,
}

impl StaticUsers {
    /// Users as `(name, uid, gid)`
    pub fn new(users: &[(&str, u32, u32)]) -> Self {
        Self {
            users: users
                .iter()
                .map(|(name, uid, gid)| {
                    (
                        name.to_string(),
                        UserIdentity {
                            name: name.to_string(),
                            uid: *uid,
                            gid: *gid,
                            home: std::path::PathBuf::from(format!("/home/{name}")),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl UserResolver for StaticUsers {
    fn resolve(&self, name: &str) -> Result<UserIdentity, WatcherError> {
        self.users
            .get(name)
            .cloned()
            .ok_or_else(|| WatcherError::UnknownUser(name.to_string()))
    }
}

/// What one connect attempt of a [`FakeConnector`] does
pub enum SessionScript {
    /// Connect succeeds; the session yields these results in order
    Session(Vec<Result<BrokerMessage, SubscriptionError>>),
    /// Connect fails with this error
    Refuse(SubscriptionError),
}

impl SessionScript {
    /// A session yielding `items`, then a fatal "script exhausted"
    pub fn session(items: Vec<Result<BrokerMessage, SubscriptionError>>) -> Self {
        Self::Session(items)
    }

    /// A refused connect
    pub fn refuse(err: SubscriptionError) -> Self {
        Self::Refuse(err)
    }
}

/// Connector that plays back one [`SessionScript`] per connect attempt
///
/// Once the scripts run out every connect fails fatally.
pub struct FakeConnector {
    scripts: Mutex<VecDeque<SessionScript>>,
}

impl FakeConnector {
    /// Connector playing `scripts` in order
    pub fn new(scripts: Vec<SessionScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _target: &SubscriptionTarget,
    ) -> Result<Box<dyn Session>, SubscriptionError> {
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(SessionScript::Session(items)) => Ok(Box::new(FakeSession {
                items: items.into(),
            })),
            Some(SessionScript::Refuse(err)) => Err(err),
            None => Err(SubscriptionError::Fatal("no more sessions".to_string())),
        }
    }
}

struct FakeSession {
    items: VecDeque<Result<BrokerMessage, SubscriptionError>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn next_message(&mut self) -> Result<BrokerMessage, SubscriptionError> {
        self.items
            .pop_front()
            .unwrap_or_else(|| Err(SubscriptionError::Fatal("script exhausted".to_string())))
    }
}

/// Handler recording every delivery it receives
#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<BrokerMessage>>,
}

impl RecordingHandler {
    /// Number of deliveries handled
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Bodies of the handled deliveries, in order
    pub fn bodies(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.body_lossy().into_owned())
            .collect()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: BrokerMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Failure a [`FakeRunner`] reports for a program
#[derive(Debug, Clone, Copy)]
pub enum FakeFailure {
    /// Non-zero exit with this code
    Exit(i32),
    /// Timeout
    Timeout,
    /// Process could not be started
    Spawn,
}

/// Command runner that records commands instead of running them
///
/// A download call (any command with `-d <dir>`) creates the configured
/// artifact files in `<dir>`.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    launched: Mutex<Vec<CommandSpec>>,
    failures: HashMap<String, FakeFailure>,
    artifacts: Vec<String>,
}

impl FakeRunner {
    /// Runner where every command succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every invocation of `program` fail
    pub fn fail(mut self, program: &str, failure: FakeFailure) -> Self {
        self.failures.insert(program.to_string(), failure);
        self
    }

    /// Files the fake download creates
    pub fn with_artifacts(mut self, names: &[&str]) -> Self {
        self.artifacts = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Commands passed to `run`, in order
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands passed to `launch`, in order
    pub fn launched(&self) -> Vec<CommandSpec> {
        self.launched.lock().unwrap().clone()
    }

    fn failure(&self, spec: &CommandSpec, timeout: Duration) -> Option<CommandError> {
        let command = spec.to_string();
        self.failures.get(&spec.program).map(|failure| match failure {
            FakeFailure::Exit(code) => CommandError::Failed {
                command,
                code: Some(*code),
                output: CommandOutput {
                    stdout: String::new(),
                    stderr: "fake failure".to_string(),
                },
            },
            FakeFailure::Timeout => CommandError::TimedOut {
                command,
                timeout,
                output: CommandOutput::default(),
            },
            FakeFailure::Spawn => CommandError::Spawn {
                command,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "fake spawn failure"),
            },
        })
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        if let Some(err) = self.failure(spec, timeout) {
            return Err(err);
        }

        if let Some(pos) = spec.args.iter().position(|a| a == "-d") {
            if let Some(dir) = spec.args.get(pos + 1) {
                for name in &self.artifacts {
                    std::fs::write(std::path::Path::new(dir).join(name), b"")
                        .expect("Failed to write fake artifact");
                }
            }
        }

        Ok(CommandOutput::default())
    }

    async fn launch(&self, spec: &CommandSpec, _log: File) -> Result<(), CommandError> {
        self.launched.lock().unwrap().push(spec.clone());
        match self.failure(spec, Duration::ZERO) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_creation() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    fn test_static_users() {
        let users = StaticUsers::new(&[("trenn", 1000, 100)]);
        assert_eq!(users.resolve("trenn").unwrap().uid, 1000);
        assert!(users.resolve("nobody-here").is_err());
    }

    #[test]
    fn test_watch_entry_uses_current_user() {
        let entry = watch_entry("p", "q", "r", "x86_64");
        assert_eq!(entry.identity, UserIdentity::current());
        assert_eq!(entry.trigger_cmd, "/bin/true");
    }
}
