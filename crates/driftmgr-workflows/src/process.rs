//! Out-of-process command invocation

use crate::error::{Result, WorkflowError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A command line to run in a working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub working_dir: PathBuf,
    /// Kill the process after this long
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Create a command
    pub fn new<I, S>(program: impl Into<String>, args: I, working_dir: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout: None,
        }
    }

    /// Split a whitespace-separated command line
    pub fn parse(line: &str, working_dir: impl AsRef<Path>) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| WorkflowError::Invalid("empty command line".to_string()))?;
        Ok(Self::new(program, parts, working_dir))
    }

    /// Set a timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Command line as a single string
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
}

impl CommandOutput {
    /// Zero exit is the only success signal
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into an error carrying the output
    pub fn into_result(self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(WorkflowError::CommandFailed {
                command: spec.display(),
                output: self.output,
            })
        }
    }
}

/// Runs external commands
///
/// Implementations must observe the cancellation token and return
/// [`WorkflowError::Cancelled`] promptly once it fires.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    /// Create a runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        debug!(command = %spec.display(), dir = %spec.working_dir.display(), "Running command");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let wait = child.wait_with_output();
        let output = match spec.timeout {
            Some(timeout) => tokio::select! {
                _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                res = tokio::time::timeout(timeout, wait) => match res {
                    Ok(out) => out?,
                    Err(_) => {
                        warn!(command = %spec.display(), "Command timed out");
                        return Err(WorkflowError::Timeout { seconds: timeout.as_secs() });
                    }
                },
            },
            None => tokio::select! {
                _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                out = wait => out?,
            },
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            exit_code: output.status.code(),
            output: combined,
        })
    }
}
