//! Success and error lines written to stdout.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::ProvisionError;
use crate::inventory::Node;
use crate::platform::Platform;

/// Action-specific fields of a successful result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskOutcome {
    /// One node created and registered.
    Provisioned { node_name: String, node: Node },
    /// A batch allocation; only the count is reported.
    Allocated { nodes: usize },
    /// Targets registered from a service response.
    Registered {
        node_name: Platform,
        target_names: Vec<String>,
    },
    /// Identities (`name`, else `uri`) of the nodes removed from the inventory.
    Removed { removed: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSuccess {
    pub status: &'static str,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

impl From<TaskOutcome> for TaskSuccess {
    fn from(outcome: TaskOutcome) -> Self {
        Self {
            status: "ok",
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub msg: String,
    pub details: Value,
}

/// `{"_error": {"kind", "msg", "details"}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "_error")]
    pub error: ErrorBody,
}

/// Returns the first typed error in the chain of `err`, if any.
pub fn provision_error(err: &anyhow::Error) -> Option<&ProvisionError> {
    err.downcast_ref::<ProvisionError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<ProvisionError>()))
}

impl ErrorEnvelope {
    /// Builds the envelope for a failure of `backend`.
    ///
    /// The kind is `provision/<backend>_<category>`, where the category
    /// comes from the first [`ProvisionError`] in the chain and defaults to
    /// `failure`. The message is the outermost error, `details.causes` the
    /// full chain. Backend errors add their HTTP `code` and `body`, command
    /// errors their captured output.
    pub fn from_error(backend: &str, err: &anyhow::Error) -> Self {
        let typed = provision_error(err);
        let category = typed.map_or("failure", ProvisionError::category);

        let mut details = Map::new();
        details.insert(
            "causes".to_string(),
            Value::from(err.chain().map(ToString::to_string).collect::<Vec<_>>()),
        );
        match typed {
            Some(ProvisionError::BackendRequest { status, body, .. }) => {
                details.insert("code".to_string(), json!(status));
                details.insert("body".to_string(), body_value(body.as_deref()));
            }
            Some(ProvisionError::Command {
                command,
                stdout,
                stderr,
                code,
            }) => {
                details.insert("command".to_string(), json!(command));
                details.insert("stdout".to_string(), json!(stdout));
                details.insert("stderr".to_string(), json!(stderr));
                details.insert("exit_code".to_string(), json!(code));
            }
            _ => {}
        }

        Self {
            error: ErrorBody {
                kind: format!("provision/{}_{}", backend, category),
                msg: err.to_string(),
                details: Value::Object(details),
            },
        }
    }
}

/// Response bodies are embedded as JSON when they parse, else as a string.
fn body_value(body: Option<&str>) -> Value {
    match body {
        None => Value::Null,
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw)),
    }
}
