//! Typed failures of the provisioner.
//!
//! [`ProvisionError`] covers the inventory store, the readiness protocol,
//! backend CLIs and HTTP services, and request validation. Inherent APIs
//! return it directly. The `CommandExecutor`, `HttpClient` and
//! `Provisioner` seams speak `anyhow::Result`, and `?` lifts the typed
//! error into that. The task entry point later searches the `anyhow` chain
//! for it to pick the envelope category.

use std::io;

/// Short message for an IO failure, keyed on its kind.
///
/// Inventory paths already appear in the error, so the OS text
/// ("No such file or directory (os error 2)") is dropped for kinds with a
/// clear name.
pub(crate) fn describe_io(err: &io::Error) -> String {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => "not found",
        io::ErrorKind::PermissionDenied => "permission denied",
        io::ErrorKind::IsADirectory => "is a directory",
        io::ErrorKind::AlreadyExists => "already exists",
        _ => return format!("I/O error: {err}"),
    };
    format!("I/O error: {kind}")
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Domain-specific error type for rsprovision.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// The task request is malformed or contradictory.
    #[error("validation error: {0}")]
    Validation(String),

    /// A backend answered with a status that will never turn into success.
    #[error("backend request failed: {message}")]
    BackendRequest {
        /// HTTP status code, when the failure came from an HTTP exchange.
        status: Option<u16>,
        /// Human-readable description of the failure.
        message: String,
        /// Raw response body, kept for the error envelope.
        body: Option<String>,
    },

    /// A wall-clock or attempt budget was exhausted while waiting for readiness.
    #[error("timeout: {0}")]
    Timeout(String),

    /// An inventory lookup found no matching target.
    #[error("failed to lookup target {0}")]
    NotFound(String),

    /// Invalid inventory location or missing credentials.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subprocess exited with a non-zero status.
    #[error("command failed: {command}: exit code {}", display_code(.code))]
    Command {
        /// The command line that was executed.
        command: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
        /// Exit code, `None` when the process was killed by a signal.
        code: Option<i32>,
    },

    /// A payload (inventory file, backend response) could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred, usually including a path.
        context: String,
        /// Human-readable description derived from [`describe_io`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Creates an `Io` variant with the `message` field derived from `source`.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: describe_io(&source),
            source,
        }
    }

    /// Short category tag used to build the `kind` of the error envelope.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "argument_error",
            Self::BackendRequest { .. } => "service_error",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config_error",
            Self::Command { .. } => "command_failure",
            Self::Parse(_) | Self::Io { .. } => "failure",
        }
    }
}
