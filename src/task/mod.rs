//! Task entry point: one JSON request in, one JSON line and an exit code out.
//!
//! [`TaskRunner::run`] is the only place where errors are turned into the
//! `_error` envelope. Everything below it propagates errors with `?`.

mod request;
mod response;

use std::io::Read;
use std::sync::PoisonError;

use anyhow::{Context, Result};
use tracing::{error, info};

pub use request::{Action, ProvisionRequest, TaskRequest, TearDownRequest, ValidatedAction};
pub use response::{ErrorBody, ErrorEnvelope, TaskOutcome, TaskSuccess, provision_error};

use crate::backends::Provisioner;
use crate::error::ProvisionError;
use crate::inventory::Inventory;

/// Process exit statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPolicy {
    pub success: i32,
    pub failure: i32,
    /// Used when the request itself is rejected.
    pub validation_failure: i32,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            success: 0,
            failure: 1,
            validation_failure: 1,
        }
    }
}

/// The line to print and the status to exit with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub exit_code: i32,
    pub line: String,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunner {
    backend: String,
    policy: ExitPolicy,
}

impl TaskRunner {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            policy: ExitPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ExitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs one task.
    ///
    /// `build` is only called once the request has been validated and the
    /// inventory opened, so a malformed request never touches a backend.
    pub fn run<F>(&self, input: &str, build: F) -> TaskReport
    where
        F: FnOnce() -> Result<Box<dyn Provisioner>>,
    {
        match self.execute(input, build) {
            Ok(outcome) => {
                let success = TaskSuccess::from(outcome);
                match serde_json::to_string(&success) {
                    Ok(line) => TaskReport {
                        exit_code: self.policy.success,
                        line,
                    },
                    Err(e) => self.failure(&anyhow::Error::new(e).context("failed to encode result")),
                }
            }
            Err(err) => self.failure(&err),
        }
    }

    /// Reads the request from `reader` and runs it.
    ///
    /// An unreadable request (I/O failure, invalid UTF-8) is reported as a
    /// validation failure through the same envelope as any other error.
    pub fn run_from<R, F>(&self, mut reader: R, build: F) -> TaskReport
    where
        R: Read,
        F: FnOnce() -> Result<Box<dyn Provisioner>>,
    {
        let mut input = String::new();
        if let Err(e) = reader.read_to_string(&mut input) {
            return self.reject(
                ProvisionError::Validation(format!("failed to read task input: {}", e)).into(),
            );
        }
        self.run(&input, build)
    }

    /// Reports a failure that happened before a request could be run.
    pub fn reject(&self, err: anyhow::Error) -> TaskReport {
        self.failure(&err)
    }

    fn execute<F>(&self, input: &str, build: F) -> Result<TaskOutcome>
    where
        F: FnOnce() -> Result<Box<dyn Provisioner>>,
    {
        let request = TaskRequest::parse(input)?;
        let action = request.validate()?;

        let shared = Inventory::open(request.inventory.as_deref())?;
        let provisioner = build()?;
        let mut inventory = shared.lock().unwrap_or_else(PoisonError::into_inner);

        match action {
            ValidatedAction::Provision(req) => {
                info!("provisioning {} with {}", req.platform, provisioner.name());
                provisioner
                    .provision(&req, &mut inventory)
                    .with_context(|| format!("failed to provision {}", req.platform))
            }
            ValidatedAction::TearDown(req) => {
                info!("tearing down {} with {}", req.node_name, provisioner.name());
                provisioner
                    .tear_down(&req, &mut inventory)
                    .with_context(|| format!("failed to tear down {}", req.node_name))
            }
        }
    }

    fn failure(&self, err: &anyhow::Error) -> TaskReport {
        error!("{:#}", err);
        let exit_code = match provision_error(err) {
            Some(ProvisionError::Validation(_)) => self.policy.validation_failure,
            _ => self.policy.failure,
        };
        let envelope = ErrorEnvelope::from_error(&self.backend, err);
        let line = serde_json::to_string(&envelope).unwrap_or_else(|_| {
            format!(
                r#"{{"_error":{{"kind":"provision/{}_failure","msg":"failed to encode error"}}}}"#,
                self.backend
            )
        });
        TaskReport { exit_code, line }
    }
}
