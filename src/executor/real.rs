//! [`RealCommandExecutor`]: runs backend CLIs as child processes.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use which::which;

use super::pipe::{Stream, drain, panic_text};
use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::ProvisionError;

/// Executor backed by `std::process`.
///
/// The binary is resolved through `PATH` first, so a missing `lxc` or
/// `terraform` surfaces as a configuration error instead of a spawn failure.
/// stdin is closed and both output streams are drained on their own threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealCommandExecutor;

/// A spawned child plus the threads draining it.
struct Running<'a> {
    spec: &'a CommandSpec,
    child: Child,
    readers: Vec<(Stream, JoinHandle<String>)>,
}

impl Running<'_> {
    fn attach<R>(&mut self, source: Option<R>, stream: Stream) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        let spawned = thread::Builder::new()
            .name(format!("{stream}-drain"))
            .spawn(move || drain(source, stream));
        match spawned {
            Ok(handle) => {
                self.readers.push((stream, handle));
                Ok(())
            }
            Err(e) => Err(self.abort(format!("could not start {stream} reader: {e}"))),
        }
    }

    /// Kills the child, reaps it, joins any readers and builds the error.
    fn abort(&mut self, reason: String) -> anyhow::Error {
        let pid = self.child.id();
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid, "kill failed, child probably exited already: {e}");
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!(pid, "could not reap killed child: {e}");
        }
        for (stream, handle) in self.readers.drain(..) {
            if let Err(payload) = handle.join() {
                tracing::warn!(%stream, "reader panicked while aborting: {}", panic_text(&*payload));
            }
        }
        failure(self.spec, reason)
    }

    fn finish(mut self) -> Result<ExecutionResult> {
        let status = match self.child.wait() {
            Ok(status) => status,
            Err(e) => return Err(self.abort(format!("could not wait for child: {e}"))),
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut panicked = Vec::new();
        for (stream, handle) in self.readers.drain(..) {
            match handle.join() {
                Ok(text) if stream == Stream::Out => stdout = text,
                Ok(text) => stderr = text,
                Err(payload) => {
                    let text = panic_text(&*payload);
                    tracing::error!(%stream, panic = text, "reader thread panicked");
                    panicked.push(format!("{stream}: {text}"));
                }
            }
        }
        if !panicked.is_empty() {
            return Err(failure(self.spec, format!("output lost, {}", panicked.join(", "))));
        }

        tracing::trace!(command = %self.spec.command, code = ?status.code(), "child exited");
        Ok(ExecutionResult {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn failure(spec: &CommandSpec, reason: String) -> anyhow::Error {
    ProvisionError::Command {
        command: spec.command_line(),
        stdout: String::new(),
        stderr: reason,
        code: None,
    }
    .into()
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let program = which(&spec.command)
            .map_err(|e| ProvisionError::Config(format!("{} is not on PATH: {e}", spec.command)))?;
        tracing::trace!(command = %spec.command, path = %program.display(), "resolved");

        let mut command = Command::new(program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start `{}`", spec.command_line()))?;
        tracing::trace!(command = %spec.command, pid = child.id(), "spawned");

        let out = child.stdout.take();
        let err = child.stderr.take();
        let mut running = Running {
            spec,
            child,
            readers: Vec::with_capacity(2),
        };
        running.attach(out, Stream::Out)?;
        running.attach(err, Stream::Err)?;
        running.finish()
    }
}
