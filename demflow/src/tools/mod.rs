//! External tool invocation.
//!
//! Every stage talks to its command-line tool through [`ToolRunner`], so the
//! process boundary can be replaced by a scripted runner in tests:
//!
//! - [`ToolCommand`] describes one invocation
//! - [`ToolOutcome`] carries the exit status and captured output
//! - [`ProcessToolRunner`] runs commands with `tokio::process`

mod environment;
mod process;

pub use environment::{ToolEnvironment, API_KEY_VAR};
pub use process::ProcessToolRunner;

use crate::errors::{DemflowError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Program name or path.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Per-command environment variables.
    pub env: BTreeMap<String, String>,
    /// Wall-clock limit after which the child is killed.
    pub timeout: Duration,
}

impl ToolCommand {
    /// Creates a command without arguments.
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout,
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument.
    #[must_use]
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        let arg = path.as_ref().to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets a per-command environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Returns the command as a single display line.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Lines of stdout kept in failure diagnostics.
pub const STDOUT_TAIL_LINES: usize = 40;

/// Result of running a [`ToolCommand`] to a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutcome {
    /// Exit code; `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// True if the timeout elapsed and the child was killed.
    pub timed_out: bool,
    /// Wall-clock time from spawn to exit.
    pub elapsed: Duration,
    /// OS process id of the child, when it was spawned.
    pub pid: Option<u32>,
}

impl ToolOutcome {
    /// Creates the outcome of a process that exited on its own.
    #[must_use]
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Creates the outcome of a process killed at its timeout.
    #[must_use]
    pub fn killed_at_timeout(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: true,
            ..Self::default()
        }
    }

    /// Returns true if the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Returns stdout followed by stderr.
    #[must_use]
    pub fn diagnostics(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Returns the last [`STDOUT_TAIL_LINES`] lines of stdout followed by
    /// stderr.
    ///
    /// The stereo tools log most failure detail to stdout.
    #[must_use]
    pub fn failure_diagnostics(&self) -> String {
        let lines: Vec<&str> = self.stdout.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDOUT_TAIL_LINES)..].join("\n");
        match (tail.is_empty(), self.stderr.is_empty()) {
            (_, true) => tail,
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{tail}\n{}", self.stderr),
        }
    }

    /// Converts a timed-out outcome into [`DemflowError::ToolTimeout`].
    pub fn require_completed(self, command: &ToolCommand) -> Result<Self> {
        if self.timed_out {
            return Err(DemflowError::ToolTimeout {
                program: command.program.clone(),
                timeout: command.timeout,
                diagnostics: self.diagnostics(),
            });
        }
        Ok(self)
    }

    /// Converts a non-zero exit into [`DemflowError::ToolFailed`].
    pub fn require_success(self, command: &ToolCommand) -> Result<Self> {
        let outcome = self.require_completed(command)?;
        if outcome.success() {
            return Ok(outcome);
        }
        Err(DemflowError::ToolFailed {
            program: command.program.clone(),
            exit_code: outcome.exit_code,
            diagnostics: outcome.failure_diagnostics(),
        })
    }
}

/// Executes external commands.
///
/// Launch failures are errors. A non-zero exit or a timeout is reported in
/// the returned [`ToolOutcome`] and left to the caller to classify.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs a command to completion or timeout.
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutcome>;
}
