//! The JSON task request read from stdin and its validation.

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::config::parse_vars;
use crate::error::ProvisionError;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Provision,
    TearDown,
}

/// One task invocation as received on stdin.
///
/// Keys other than the common ones are kept in `extra` and handed to the
/// backend, which decodes its own options from them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub inventory: Option<Utf8PathBuf>,
    #[serde(default)]
    pub vars: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Validated arguments of a provision action.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub platform: Platform,
    pub vars: Option<serde_yaml::Value>,
    pub options: Map<String, Value>,
}

impl ProvisionRequest {
    pub fn new(platform: impl Into<Platform>) -> Self {
        Self {
            platform: platform.into(),
            vars: None,
            options: Map::new(),
        }
    }

    #[must_use]
    pub fn with_vars(mut self, vars: serde_yaml::Value) -> Self {
        self.vars = Some(vars);
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

/// Validated arguments of a tear-down action.
#[derive(Debug, Clone, PartialEq)]
pub struct TearDownRequest {
    pub node_name: String,
    pub options: Map<String, Value>,
}

impl TearDownRequest {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            options: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedAction {
    Provision(ProvisionRequest),
    TearDown(TearDownRequest),
}

impl TaskRequest {
    pub fn parse(input: &str) -> Result<Self, ProvisionError> {
        serde_json::from_str(input)
            .map_err(|e| ProvisionError::Validation(format!("invalid task input: {}", e)))
    }

    /// Checks the action and its mutually exclusive arguments.
    ///
    /// Runs before the inventory is opened or any backend is contacted.
    pub fn validate(&self) -> Result<ValidatedAction, ProvisionError> {
        let action = match self.action.as_deref() {
            None | Some("") => {
                return Err(ProvisionError::Validation(
                    "must specify a valid action: provision or tear_down".to_string(),
                ));
            }
            Some(raw) => raw
                .parse::<Action>()
                .map_err(|_| ProvisionError::Validation(format!("invalid action: {}", raw)))?,
        };

        let platform = self.platform.as_ref().filter(|p| !p.is_empty());
        let node_name = self.node_name.as_deref().filter(|n| !n.is_empty());

        match (action, platform, node_name) {
            (Action::Provision, None, _) => Err(ProvisionError::Validation(
                "specify a platform when provisioning".to_string(),
            )),
            (Action::Provision, Some(_), Some(_)) => Err(ProvisionError::Validation(
                "specify only a platform, not node_name, when provisioning".to_string(),
            )),
            (Action::TearDown, _, None) => Err(ProvisionError::Validation(
                "specify a node_name when tearing down".to_string(),
            )),
            (Action::TearDown, Some(_), Some(_)) => Err(ProvisionError::Validation(
                "specify only a node_name, not platform, when tearing down".to_string(),
            )),
            (Action::Provision, Some(platform), None) => {
                Ok(ValidatedAction::Provision(ProvisionRequest {
                    platform: platform.clone(),
                    vars: self.decoded_vars()?,
                    options: self.extra.clone(),
                }))
            }
            (Action::TearDown, None, Some(node_name)) => {
                Ok(ValidatedAction::TearDown(TearDownRequest {
                    node_name: node_name.to_string(),
                    options: self.extra.clone(),
                }))
            }
        }
    }

    /// `vars` arrives either as a YAML/JSON string or as an inline JSON value.
    fn decoded_vars(&self) -> Result<Option<serde_yaml::Value>, ProvisionError> {
        match &self.vars {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => parse_vars(Some(raw)),
            Some(other) => serde_yaml::to_value(other)
                .map(Some)
                .map_err(|e| ProvisionError::Validation(format!("invalid vars: {}", e))),
        }
    }
}
