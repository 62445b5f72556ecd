//! LXD containers and VMs driven through the `lxc` client.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use serde_yaml::{Mapping, Value};
use tracing::info;

use super::{Provisioner, decode_options, remove_and_save};
use crate::config::env_var;
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec, run};
use crate::inventory::{Inventory, LXD_NODES, Lookup, Node, TargetConfig};
use crate::protocol::{Clock, ExponentialBackoff, with_cleanup};
use crate::task::{ProvisionRequest, TaskOutcome, TearDownRequest};

/// Options that may come from the request or from `LXD_<NAME>` variables.
const ENV_OPTIONS: [&str; 5] = ["remote", "profiles", "storage", "instance_type", "vm"];

/// Instance options recognised by the backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LxdOptions {
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub profiles: Option<Vec<String>>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub vm: Option<bool>,
    #[serde(default)]
    pub retries: Option<u32>,
}

impl LxdOptions {
    /// `lxc create` flags for these options.
    pub fn create_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        for profile in self.profiles.iter().flatten() {
            flags.push("--profile".to_string());
            flags.push(profile.clone());
        }
        if let Some(instance_type) = &self.instance_type {
            flags.push("--type".to_string());
            flags.push(instance_type.clone());
        }
        if let Some(storage) = &self.storage {
            flags.push("--storage".to_string());
            flags.push(storage.clone());
        }
        if self.vm == Some(true) {
            flags.push("--vm".to_string());
        }
        flags
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LxdSettings {
    /// Defaults taken from `LXD_*` variables, YAML-decoded.
    pub defaults: Map<String, JsonValue>,
    pub probe: ExponentialBackoff,
}

impl LxdSettings {
    pub fn from_env() -> Result<Self, ProvisionError> {
        let mut defaults = Map::new();
        for name in ENV_OPTIONS {
            let var = format!("LXD_{}", name.to_uppercase());
            if let Some(raw) = env_var(&var) {
                let value: JsonValue = serde_yaml::from_str(&raw).map_err(|e| {
                    ProvisionError::Config(format!("invalid value for {}: {}", var, e))
                })?;
                if !value.is_null() {
                    defaults.insert(name.to_string(), value);
                }
            }
        }
        Ok(Self {
            defaults,
            probe: ExponentialBackoff::default(),
        })
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn decode<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T, ProvisionError> {
    serde_yaml::from_str(raw).map_err(|e| ProvisionError::Parse(format!("failed to parse {}: {}", what, e)))
}

pub struct LxdProvisioner {
    settings: LxdSettings,
    executor: Arc<dyn CommandExecutor>,
    clock: Arc<dyn Clock>,
}

impl LxdProvisioner {
    pub fn new(settings: LxdSettings, executor: Arc<dyn CommandExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            executor,
            clock,
        }
    }

    fn lxc<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full = vec!["-q".to_string()];
        full.extend(args.into_iter().map(Into::into));
        run(self.executor.as_ref(), &CommandSpec::new("lxc", full))
    }

    /// Request options merged over the environment defaults.
    ///
    /// Keys starting with `_` are task metadata and dropped.
    fn effective_options(&self, request: &ProvisionRequest) -> Map<String, JsonValue> {
        let mut options: Map<String, JsonValue> = request
            .options
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in &self.settings.defaults {
            if options.get(key).is_none_or(is_blank) {
                options.insert(key.clone(), value.clone());
            }
        }
        options
    }

    fn default_remote(&self) -> Result<String> {
        Ok(self.lxc(["remote", "get-default"])?.trim().to_string())
    }

    /// Attaches the agent device when the image asks for it, then boots
    /// `instance` and waits until it accepts `lxc exec`.
    fn prepare_and_start(&self, instance: &str, retries: u32) -> Result<()> {
        let properties: Value = decode(&self.lxc(["config", "show", instance, "-e"])?, "instance configuration")?;
        let cdrom_agent = properties
            .get("config")
            .and_then(|c| c.get("image.requirements.cdrom_agent"))
            .is_some_and(|v| v.as_str() == Some("true") || v.as_bool() == Some(true));
        if cdrom_agent {
            self.lxc(["config", "device", "add", instance, "agent", "disk", "source=agent:config"])?;
        }

        self.lxc(["start", instance])?;
        ExponentialBackoff { retries }.probe(self.clock.as_ref(), instance, || {
            self.lxc(["exec", instance, "uptime"]).map(drop)
        })
    }
}

impl Provisioner for LxdProvisioner {
    fn name(&self) -> &'static str {
        "lxd"
    }

    fn provision(&self, request: &ProvisionRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let options_map = self.effective_options(request);
        let options: LxdOptions = decode_options(&options_map)?;
        let retries = options.retries.unwrap_or(self.settings.probe.retries);
        let platform = request.platform.to_string();

        let remote = match &options.remote {
            Some(remote) => remote.clone(),
            None => self.default_remote()?,
        };

        let mut create = vec!["create".to_string(), platform.clone(), format!("{}:", remote)];
        create.extend(options.create_flags());
        let output = self.lxc(create)?;
        let container_id = output
            .split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::Parse("lxc create printed no instance name".to_string()))?;
        let instance = format!("{}:{}", remote, container_id);
        info!("created instance {}", instance);

        with_cleanup(
            &instance,
            || self.prepare_and_start(&instance, retries),
            || self.lxc(["delete", instance.as_str(), "-f"]).map(drop),
        )?;

        let mut settings = Mapping::new();
        settings.insert("remote".into(), Value::from(remote.as_str()));
        settings.insert("shell-command".into(), Value::from("sh -lc"));

        let mut node = Node::new(container_id.as_str())
            .with_config(TargetConfig::new("lxd", settings))
            .with_fact("provisioner", "lxd")
            .with_fact("container_id", container_id.as_str())
            .with_fact("platform", platform.as_str())
            .with_vars(request.vars.clone());
        for (key, value) in options_map.iter().filter(|(k, v)| *k != "retries" && !is_blank(v)) {
            let value = serde_yaml::to_value(value)
                .with_context(|| format!("failed to record option {}", key))?;
            node = node.with_fact(&format!("lxd_{}", key), value);
        }

        inventory.add(&node, LXD_NODES)?.save()?;

        Ok(TaskOutcome::Provisioned {
            node_name: container_id,
            node,
        })
    }

    fn tear_down(&self, request: &TearDownRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let node = inventory
            .lookup(&Lookup::either(&request.node_name).in_group(LXD_NODES))?
            .clone();
        let remote = match node.config.setting_str("remote") {
            Some(remote) => remote.to_string(),
            None => self.default_remote()?,
        };
        let container_id = node.fact_str("container_id").unwrap_or_else(|| node.uri.clone());

        self.lxc(["delete", format!("{}:{}", remote, container_id).as_str(), "-f"])?;
        remove_and_save(inventory, std::slice::from_ref(&node))
    }
}
