//! Command execution abstraction for rsprovision.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Captured output and exit status of a command
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`
//! - [`run`]: Executes a spec and turns a non-zero exit into [`ProvisionError::Command`]

mod pipe;
mod real;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ProvisionError;

pub use real::RealCommandExecutor;

/// Formats string arguments into a space-separated string.
///
/// Arguments containing whitespace are debug-quoted so the rendered
/// command line stays unambiguous in logs and error messages.
pub(crate) fn format_command_args(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) {
                format!("{:?}", a)
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A backend CLI invocation: program, arguments, working directory and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// The command to execute (e.g., "lxc")
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (optional, defaults to current directory)
    pub cwd: Option<Utf8PathBuf>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args
    #[must_use]
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Sets the working directory
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl AsRef<Utf8Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Renders the full command line for logs and error messages.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, format_command_args(&self.args))
        }
    }
}

/// Result of command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code of the command (`None` when terminated by a signal)
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ExecutionResult {
    /// Creates a successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Creates a failed result with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so a single executor can be
/// shared by every backend through `Arc<dyn CommandExecutor>`.
pub trait CommandExecutor: Send + Sync {
    /// Runs the described command and captures its output.
    ///
    /// Returns `Err` only when the command could not be run at all; a
    /// non-zero exit is reported through [`ExecutionResult::code`].
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}

/// Executes `spec` and returns its stdout, failing on a non-zero exit.
pub fn run(executor: &dyn CommandExecutor, spec: &CommandSpec) -> Result<String> {
    tracing::debug!("running: {}", spec.command_line());
    let result = executor.execute(spec)?;
    if !result.success() {
        return Err(ProvisionError::Command {
            command: spec.command_line(),
            stdout: result.stdout,
            stderr: result.stderr,
            code: result.code,
        }
        .into());
    }
    Ok(result.stdout)
}
