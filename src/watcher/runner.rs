//! External command execution.
//!
//! The pipeline never spawns processes itself; it describes them as
//! [`CommandSpec`]s and hands them to a [`CommandRunner`]. Two modes are
//! supported:
//!
//! - [`CommandRunner::run`]: wait for the command, bounded by a timeout,
//!   and capture its output (download and install)
//! - [`CommandRunner::launch`]: start the command with its output going
//!   to a file and return immediately (trigger)

use std::fmt;
use std::fs::File;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::watch_list::UserIdentity;

/// Errors from running an external command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The process could not be started.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The process started but waiting for it failed.
    #[error("failed waiting for `{command}`: {source}")]
    Wait {
        /// Command line
        command: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The process did not finish in time and was killed.
    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    TimedOut {
        /// Command line
        command: String,
        /// Timeout that elapsed
        timeout: Duration,
        /// Output written before the kill
        output: CommandOutput,
    },

    /// The process exited unsuccessfully.
    #[error("`{command}` exited with {}", exit_code_str(.code))]
    Failed {
        /// Command line
        command: String,
        /// Exit code, `None` if killed by a signal
        code: Option<i32>,
        /// Captured output
        output: CommandOutput,
    },
}

fn exit_code_str(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// A command to run: program, arguments, and optionally the user to run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Run the child as this user instead of the service's.
    pub run_as: Option<UserIdentity>,
}

impl CommandSpec {
    /// Creates a spec running as the service user.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            run_as: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs the command as `identity`.
    pub fn run_as(mut self, identity: UserIdentity) -> Self {
        self.run_as = Some(identity);
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(identity) = &self.run_as {
            cmd.uid(identity.uid)
                .gid(identity.gid)
                .env("HOME", &identity.home)
                .env("USER", &identity.name)
                .env("LOGNAME", &identity.name);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        if let Some(identity) = &self.run_as {
            write!(f, " (as {})", identity.name)?;
        }
        Ok(())
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout and stderr joined for a log line.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", "") => String::new(),
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// How long a killed command's pipes may keep draining.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Background copy of one child pipe into a shared buffer.
///
/// The buffer stays readable if the copy has to be abandoned, so output
/// written before a kill is kept.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        });
        Self { buf, task }
    }

    /// Waits for EOF, or at most `grace`, and returns what was read.
    async fn finish(mut self, grace: Option<Duration>) -> String {
        match grace {
            Some(grace) => {
                if tokio::time::timeout(grace, &mut self.task).await.is_err() {
                    self.task.abort();
                }
            }
            None => {
                let _ = (&mut self.task).await;
            }
        }
        let bytes = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn collect_output(
    stdout: PipeReader,
    stderr: PipeReader,
    grace: Option<Duration>,
) -> CommandOutput {
    let (stdout, stderr) = tokio::join!(stdout.finish(grace), stderr.finish(grace));
    CommandOutput { stdout, stderr }
}

/// Executes external commands for the pipeline.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion, killing it after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] on spawn failure, timeout, or a
    /// non-zero exit.
    async fn run(&self, spec: &CommandSpec, timeout: Duration)
        -> Result<CommandOutput, CommandError>;

    /// Starts `spec` with stdout and stderr redirected to `log`, without
    /// waiting for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the process cannot be started.
    async fn launch(&self, spec: &CommandSpec, log: File) -> Result<(), CommandError>;
}

/// [`CommandRunner`] that spawns real processes with tokio.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    trigger_slots: Option<Arc<Semaphore>>,
}

impl ProcessRunner {
    /// Runner with no limit on concurrently running launched commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner allowing at most `limit` launched commands at a time.
    ///
    /// [`CommandRunner::launch`] waits for a free slot before spawning.
    pub fn with_trigger_limit(limit: usize) -> Self {
        Self {
            trigger_slots: Some(Arc::new(Semaphore::new(limit))),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: spec.to_string(),
            source,
        })?;
        let stdout = PipeReader::spawn(child.stdout.take());
        let stderr = PipeReader::spawn(child.stderr.take());

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(CommandError::Wait {
                    command: spec.to_string(),
                    source,
                })
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(command = %spec, error = %e, "Could not kill timed out command");
                }
                // Descendants may still hold the pipes open
                let output = collect_output(stdout, stderr, Some(DRAIN_GRACE)).await;
                return Err(CommandError::TimedOut {
                    command: spec.to_string(),
                    timeout,
                    output,
                });
            }
        };

        let captured = collect_output(stdout, stderr, None).await;
        if status.success() {
            Ok(captured)
        } else {
            Err(CommandError::Failed {
                command: spec.to_string(),
                code: status.code(),
                output: captured,
            })
        }
    }

    async fn launch(&self, spec: &CommandSpec, log: File) -> Result<(), CommandError> {
        let spawn_error = |source: std::io::Error| CommandError::Spawn {
            command: spec.to_string(),
            source,
        };

        let permit = match &self.trigger_slots {
            Some(slots) => match slots.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return Err(spawn_error(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "trigger slots closed",
                    )))
                }
            },
            None => None,
        };

        let stderr_log = log.try_clone().map_err(spawn_error)?;
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log));

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let command = spec.to_string();

        // Never joined. Reaps the child and releases the trigger slot.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(command = %command, status = %status, "Trigger finished"),
                Err(e) => warn!(command = %command, error = %e, "Could not wait for trigger"),
            }
            drop(permit);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    #[test]
    fn test_spec_display() {
        let spec = CommandSpec::new("/usr/bin/rpm")
            .arg("-Uvh")
            .args(["/run/a.rpm", "/run/b.rpm"]);
        assert_eq!(spec.to_string(), "/usr/bin/rpm -Uvh /run/a.rpm /run/b.rpm");
    }

    #[test]
    fn test_spec_display_with_user() {
        let spec = CommandSpec::new("osc").arg("getbinaries").run_as(UserIdentity {
            name: "trenn".to_string(),
            uid: 1000,
            gid: 100,
            home: "/home/trenn".into(),
        });
        assert_eq!(spec.to_string(), "osc getbinaries (as trenn)");
    }

    #[test]
    fn test_output_combined() {
        let output = CommandOutput {
            stdout: "installed\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.combined(), "installed");

        let output = CommandOutput {
            stdout: "a".to_string(),
            stderr: "b".to_string(),
        };
        assert_eq!(output.combined(), "a\nb");
    }

    #[test]
    fn test_error_display() {
        let err = CommandError::TimedOut {
            command: "osc getbinaries".to_string(),
            timeout: Duration::from_secs(20),
            output: CommandOutput::default(),
        };
        assert_eq!(err.to_string(), "`osc getbinaries` timed out after 20s");

        let err = CommandError::Wait {
            command: "osc getbinaries".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted"),
        };
        assert_eq!(
            err.to_string(),
            "failed waiting for `osc getbinaries`: interrupted"
        );

        let err = CommandError::Failed {
            command: "rpm -Uvh".to_string(),
            code: Some(1),
            output: CommandOutput::default(),
        };
        assert_eq!(err.to_string(), "`rpm -Uvh` exited with status 1");

        let err = CommandError::Failed {
            command: "rpm -Uvh".to_string(),
            code: None,
            output: CommandOutput::default(),
        };
        assert_eq!(err.to_string(), "`rpm -Uvh` exited with a signal");
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]);
        let output = ProcessRunner::new()
            .run(&spec, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_non_zero_exit() {
        let spec = CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = ProcessRunner::new()
            .run(&spec, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(output.stderr.trim(), "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let spec = CommandSpec::new("sleep").arg("10");
        let started = std::time::Instant::now();
        let err = ProcessRunner::new()
            .run(&spec, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_partial_output() {
        let spec =
            CommandSpec::new("sh").args(["-c", "echo partial; echo half >&2; exec sleep 10"]);
        let err = ProcessRunner::new()
            .run(&spec, Duration::from_millis(300))
            .await
            .unwrap_err();
        match err {
            CommandError::TimedOut { output, .. } => {
                assert_eq!(output.stdout.trim(), "partial");
                assert_eq!(output.stderr.trim(), "half");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout_with_descendant_holding_pipe() {
        // The backgrounded sleep outlives the killed shell and keeps stdout open
        let spec = CommandSpec::new("sh").args(["-c", "echo started; sleep 10 & wait"]);
        let started = std::time::Instant::now();
        let err = ProcessRunner::new()
            .run(&spec, Duration::from_millis(200))
            .await
            .unwrap_err();
        match err {
            CommandError::TimedOut { output, .. } => {
                assert_eq!(output.stdout.trim(), "started");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let spec = CommandSpec::new("/nonexistent/obs-watcher-tool");
        let err = ProcessRunner::new()
            .run(&spec, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_as_current_user() {
        let spec = CommandSpec::new("id")
            .arg("-u")
            .run_as(UserIdentity::current());
        let output = ProcessRunner::new()
            .run(&spec, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            output.stdout.trim(),
            nix::unistd::getuid().as_raw().to_string()
        );
    }

    #[tokio::test]
    async fn test_run_as_sets_login_environment() {
        let home = temp_dir();
        let identity = UserIdentity {
            home: home.path().to_path_buf(),
            ..UserIdentity::current()
        };
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"$HOME|$USER|$LOGNAME\""])
            .run_as(identity.clone());
        let output = ProcessRunner::new()
            .run(&spec, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            output.stdout.trim(),
            format!(
                "{}|{}|{}",
                home.path().display(),
                identity.name,
                identity.name
            )
        );
    }

    #[tokio::test]
    async fn test_launch_writes_to_log() {
        let dir = temp_dir();
        let log_path = dir.path().join("trigger.log");
        let log = File::create(&log_path).unwrap();

        let spec = CommandSpec::new("sh").args(["-c", "echo triggered; echo oops >&2"]);
        ProcessRunner::new().launch(&spec, log).await.unwrap();

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&log_path).unwrap();
            if contents.contains("oops") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(contents.contains("triggered"));
        assert!(contents.contains("oops"));
    }

    #[tokio::test]
    async fn test_launch_does_not_wait() {
        let dir = temp_dir();
        let log = File::create(dir.path().join("slow.log")).unwrap();

        let spec = CommandSpec::new("sleep").arg("5");
        let started = std::time::Instant::now();
        ProcessRunner::new().launch(&spec, log).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let dir = temp_dir();
        let log = File::create(dir.path().join("missing.log")).unwrap();

        let spec = CommandSpec::new("/nonexistent/trigger");
        let err = ProcessRunner::new().launch(&spec, log).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_launch_with_limit_releases_slot() {
        let dir = temp_dir();
        let runner = ProcessRunner::with_trigger_limit(1);

        let first = File::create(dir.path().join("first.log")).unwrap();
        runner
            .launch(&CommandSpec::new("true"), first)
            .await
            .unwrap();

        // Second launch only proceeds once the first child has been reaped
        let second = File::create(dir.path().join("second.log")).unwrap();
        let launched = tokio::time::timeout(
            Duration::from_secs(5),
            runner.launch(&CommandSpec::new("true"), second),
        )
        .await;
        assert!(matches!(launched, Ok(Ok(()))));
    }
}
