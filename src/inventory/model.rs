//! Record types of the inventory file.
//!
//! Nodes carry a typed core (`uri`, `name`, `config`) plus two open
//! mappings, `facts` and `vars`, for backend- and caller-specific data.
//! Keys the types do not know about are kept in `extra` so that loading
//! and saving a file written by another tool is lossless.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Builds a YAML mapping from key/value pairs, preserving their order.
pub fn mapping<I, K, V>(pairs: I) -> Mapping
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Value>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Transport configuration of a target.
///
/// `transport` names the connection family (`ssh`, `winrm`, `docker`,
/// `lxd`); the remaining keys hold the transport-specific sub-mapping,
/// conventionally under a key of the same name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(flatten)]
    pub settings: Mapping,
}

impl TargetConfig {
    /// Creates a config for `transport` whose settings live under the key of the same name.
    pub fn new(transport: impl Into<String>, settings: Mapping) -> Self {
        let transport = transport.into();
        let mut outer = Mapping::new();
        outer.insert(Value::from(transport.as_str()), Value::Mapping(settings));
        Self {
            transport: Some(transport),
            settings: outer,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transport.is_none() && self.settings.is_empty()
    }

    /// Returns the sub-mapping of the configured transport, if any.
    pub fn transport_settings(&self) -> Option<&Mapping> {
        let transport = self.transport.as_deref()?;
        self.settings.get(transport)?.as_mapping()
    }

    /// Returns a string setting of the configured transport.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.transport_settings()?.get(key)?.as_str()
    }
}

/// One provisioned, reachable target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "TargetConfig::is_empty")]
    pub config: TargetConfig,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub facts: Mapping,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Value>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl Node {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: TargetConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_fact(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.facts.insert(Value::from(key), value.into());
        self
    }

    #[must_use]
    pub fn with_vars(mut self, vars: Option<Value>) -> Self {
        self.vars = vars;
        self
    }

    /// The identity reported back to callers: `name` when present, else `uri`.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.uri)
    }

    pub fn fact(&self, key: &str) -> Option<&Value> {
        self.facts.get(key)
    }

    /// Returns a fact rendered as a string (numbers and booleans included).
    pub fn fact_str(&self, key: &str) -> Option<String> {
        match self.fact(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// A named partition of targets sharing a transport family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<Node>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
