//! Local VMs managed by Vagrant.
//!
//! Every machine gets its own environment directory under
//! `<inventory dir>/.vagrant/`, holding the rendered `Vagrantfile`. The
//! directory is recorded in the `vagrant_env` fact and is all tear-down
//! needs to find the machine again.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use super::{
    Provisioner, create_env_dir, decode_options, env_root, remove_and_save, remove_env_dir,
    render_template, write_file,
};
use crate::config::{env_parse, env_var};
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec, run};
use crate::inventory::{Inventory, Lookup, Node, SSH_NODES, TargetConfig, WINRM_NODES};
use crate::platform::{is_windows, uses_ssh};
use crate::protocol::with_cleanup;
use crate::task::{ProvisionRequest, TaskOutcome, TearDownRequest};

const VAGRANTFILE: &str = r#"Vagrant.configure("2") do |config|
  config.vm.box = '{{ box }}'
  config.vm.boot_timeout = 600
  config.ssh.insert_key = false
{% if bridge %}  config.vm.network 'public_network', bridge: '{{ bridge }}'
{% endif %}{% if synced_folder == "disabled" %}  config.vm.synced_folder ".", "/vagrant", disabled: true
{% elif synced_folder == "smb" %}  config.vm.synced_folder '.', '/vagrant', type: 'smb', smb_username: '{{ smb_username }}', smb_password: '{{ smb_password }}'
{% endif %}{% if cpus or memory %}  config.vm.provider "{{ provider }}" do |v|
{% if cpus %}    v.cpus = {{ cpus }}
{% endif %}{% if memory %}    v.memory = {{ memory }}
{% endif %}  end
{% endif %}end
"#;

/// Oldest vagrant release with `winrm-config`.
const MIN_WINDOWS_VERSION: (u64, u64, u64) = (2, 2, 0);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VagrantSettings {
    pub enable_synced_folder: bool,
    pub provider: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<u32>,
    pub hyperv_vswitch: Option<String>,
    pub hyperv_smb_username: Option<String>,
    pub hyperv_smb_password: Option<String>,
    /// Whether the machine running vagrant is a Windows host (Hyper-V defaults).
    pub windows_host: bool,
}

impl VagrantSettings {
    pub fn from_env() -> Result<Self, ProvisionError> {
        Ok(Self {
            enable_synced_folder: env_var("VAGRANT_ENABLE_SYNCED_FOLDER")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            provider: env_var("VAGRANT_PROVIDER"),
            cpus: env_parse("VAGRANT_CPUS")?,
            memory: env_parse("VAGRANT_MEMORY")?,
            hyperv_vswitch: env_var("VAGRANT_HYPERV_VSWITCH"),
            hyperv_smb_username: env_var("VAGRANT_HYPERV_SMB_USERNAME"),
            hyperv_smb_password: env_var("VAGRANT_HYPERV_SMB_PASSWORD"),
            windows_host: cfg!(windows),
        })
    }

    /// Applies request options over these settings.
    fn merged(&self, options: VagrantOptions) -> Self {
        let mut merged = self.clone();
        if let Some(enabled) = options.enable_synced_folder {
            merged.enable_synced_folder = match enabled {
                JsonValue::Bool(b) => b,
                JsonValue::String(s) => s.eq_ignore_ascii_case("true"),
                _ => false,
            };
        }
        merged.provider = options.provider.or(merged.provider);
        merged.cpus = options.cpus.or(merged.cpus);
        merged.memory = options.memory.or(merged.memory);
        merged.hyperv_vswitch = options.hyperv_vswitch.or(merged.hyperv_vswitch);
        merged.hyperv_smb_username = options.hyperv_smb_username.or(merged.hyperv_smb_username);
        merged.hyperv_smb_password = options.hyperv_smb_password.or(merged.hyperv_smb_password);
        merged
    }

    fn provider(&self) -> &str {
        match &self.provider {
            Some(provider) => provider,
            None if self.windows_host => "hyperv",
            None => "virtualbox",
        }
    }

    /// Renders the `Vagrantfile` for `box_name`.
    pub fn vagrantfile(&self, box_name: &str) -> Result<String, ProvisionError> {
        let synced_folder = if !self.enable_synced_folder {
            "disabled"
        } else if self.windows_host
            && self.hyperv_smb_username.is_some()
            && self.hyperv_smb_password.is_some()
        {
            "smb"
        } else {
            "default"
        };
        let bridge = self
            .windows_host
            .then(|| self.hyperv_vswitch.as_deref().unwrap_or("Default Switch"));

        let mut context = tera::Context::new();
        context.insert("box", box_name);
        context.insert("bridge", &bridge);
        context.insert("synced_folder", synced_folder);
        context.insert("smb_username", &self.hyperv_smb_username);
        context.insert("smb_password", &self.hyperv_smb_password);
        context.insert("provider", self.provider());
        context.insert("cpus", &self.cpus);
        context.insert("memory", &self.memory);
        render_template("Vagrantfile", VAGRANTFILE, &context)
    }
}

#[derive(Debug, Default, Deserialize)]
struct VagrantOptions {
    #[serde(default)]
    enable_synced_folder: Option<JsonValue>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    cpus: Option<u32>,
    #[serde(default)]
    memory: Option<u32>,
    #[serde(default)]
    hyperv_vswitch: Option<String>,
    #[serde(default)]
    hyperv_smb_username: Option<String>,
    #[serde(default)]
    hyperv_smb_password: Option<String>,
}

/// The `Host default` block printed by `vagrant ssh-config` / `winrm-config`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemotingConfig {
    entries: BTreeMap<String, String>,
}

impl RemotingConfig {
    /// Parses the block of `Host default`; keys are lowercased and the
    /// first occurrence of a repeated key wins.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut in_default = false;
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key.to_lowercase(), value.trim().trim_matches('"').to_string()),
                None => continue,
            };
            if key == "host" {
                in_default = value.split_whitespace().any(|h| h == "default");
                continue;
            }
            if in_default {
                entries.entry(key).or_insert(value);
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str, ProvisionError> {
        self.get(key)
            .ok_or_else(|| ProvisionError::Parse(format!("vagrant remoting config has no {}", key)))
    }

    fn port_value(&self) -> Value {
        match self.get("port") {
            Some(port) => port
                .parse::<u16>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(port)),
            None => Value::Null,
        }
    }
}

/// Parses `Vagrant 2.3.4` into `(2, 3, 4)`.
fn parse_vagrant_version(output: &str) -> Option<(u64, u64, u64)> {
    let version = output.split_whitespace().nth(1)?;
    let mut parts = version.split('.').map(|p| {
        p.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse::<u64>()
            .ok()
    });
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

fn optional(value: Option<&str>) -> Value {
    value.map_or(Value::Null, Value::from)
}

fn sshd_restart_command(platform: &str) -> Result<&'static str, ProvisionError> {
    if platform.contains("debian") || platform.contains("ubuntu") {
        Ok("service ssh restart")
    } else if platform.contains("centos") {
        Ok("systemctl restart sshd.service")
    } else {
        Err(ProvisionError::Validation(format!("unsupported platform: '{}'", platform)))
    }
}

pub struct VagrantProvisioner {
    settings: VagrantSettings,
    executor: Arc<dyn CommandExecutor>,
}

impl VagrantProvisioner {
    pub fn new(settings: VagrantSettings, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { settings, executor }
    }

    fn vagrant<I, S>(&self, env: &Utf8Path, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        run(self.executor.as_ref(), &CommandSpec::new("vagrant", args).with_cwd(env))
    }

    fn ensure_windows_support(&self) -> Result<()> {
        let output = run(self.executor.as_ref(), &CommandSpec::new("vagrant", ["--version"]))?;
        let version = parse_vagrant_version(&output).ok_or_else(|| {
            ProvisionError::Parse(format!("unexpected vagrant version output: {}", output.trim()))
        })?;
        if version < MIN_WINDOWS_VERSION {
            return Err(ProvisionError::Config(format!(
                "to provision a Windows VM you must have vagrant 2.2.0 or later installed; found {}.{}.{}",
                version.0, version.1, version.2
            ))
            .into());
        }
        Ok(())
    }

    /// Copies the vagrant user's keys to root and allows user environments.
    fn prepare_root_access(&self, remoting: &RemotingConfig, restart: &str) -> Result<()> {
        let destination = format!("{}@{}", remoting.require("user")?, remoting.require("hostname")?);
        let mut base = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ];
        if let Some(port) = remoting.get("port") {
            base.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(key) = remoting.get("identityfile") {
            base.extend(["-i".to_string(), key.to_string()]);
        }
        base.push(destination);

        for command in [
            r#"sudo su -c "cp -r .ssh /root/.""#.to_string(),
            r#"sudo su -c "sed -i \"s/.*PermitUserEnvironment\s.*/PermitUserEnvironment yes/g\" /etc/ssh/sshd_config""#
                .to_string(),
            format!(r#"sudo su -c "{}""#, restart),
        ] {
            let mut args = base.clone();
            args.push(command);
            run(self.executor.as_ref(), &CommandSpec::new("ssh", args))?;
        }
        Ok(())
    }

    /// Boots the machine and returns its id and remoting configuration.
    fn bring_up(&self, env: &Utf8Path, platform: &str, provider: &str) -> Result<(String, RemotingConfig)> {
        self.vagrant(env, ["up", "--provider", provider])?;

        let id_path = env.join(".vagrant").join("machines").join("default").join(provider).join("index_uuid");
        let vm_id = fs::read_to_string(&id_path)
            .map_err(|e| ProvisionError::io(format!("failed to read {}", id_path), e))?
            .trim()
            .to_string();

        let (subcommand, file_name) = if uses_ssh(platform) {
            ("ssh-config", "ssh-config")
        } else {
            ("winrm-config", "winrm-config")
        };
        let raw = self.vagrant(env, [subcommand])?;
        write_file(&env.join(file_name), &raw)?;
        let remoting = RemotingConfig::parse(&raw);

        if uses_ssh(platform) {
            self.prepare_root_access(&remoting, sshd_restart_command(platform)?)?;
        }
        Ok((vm_id, remoting))
    }

    fn destroy(&self, env: &Utf8Path) -> Result<()> {
        self.vagrant(env, ["destroy", "-f"])?;
        remove_env_dir(env)?;
        Ok(())
    }
}

impl Provisioner for VagrantProvisioner {
    fn name(&self) -> &'static str {
        "vagrant"
    }

    fn provision(&self, request: &ProvisionRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let settings = self.settings.merged(decode_options(&request.options)?);
        let platform = request.platform.to_string();
        if is_windows(&platform) {
            self.ensure_windows_support()?;
        } else {
            sshd_restart_command(&platform)?;
        }
        let provider = settings.provider().to_string();

        let vagrantfile = settings.vagrantfile(&platform)?;
        let env = create_env_dir(&env_root(inventory.directory(), ".vagrant")?, &platform)?;
        with_cleanup(
            &format!("vagrant environment {}", env),
            || Ok(write_file(&env.join("Vagrantfile"), &vagrantfile)?),
            || Ok(remove_env_dir(&env)?),
        )?;
        debug!("rendered Vagrantfile in {}", env);

        let (vm_id, remoting) = with_cleanup(
            &format!("vagrant environment {}", env),
            || self.bring_up(&env, &platform, &provider),
            || self.destroy(&env),
        )?;

        let hostname = remoting.require("hostname")?;
        let node_name = format!("{}:{}", hostname, remoting.get("port").unwrap_or_default());

        let (config, group) = if uses_ssh(&platform) {
            let mut ssh = Mapping::new();
            ssh.insert("user".into(), optional(remoting.get("user")));
            ssh.insert("host".into(), hostname.into());
            ssh.insert("private-key".into(), optional(remoting.get("identityfile")));
            ssh.insert(
                "host-key-check".into(),
                Value::Bool(remoting.get("stricthostkeychecking").is_some_and(|v| v != "no")),
            );
            ssh.insert("port".into(), remoting.port_value());
            ssh.insert("run-as".into(), "root".into());
            (TargetConfig::new("ssh", ssh), SSH_NODES)
        } else {
            let mut winrm = Mapping::new();
            winrm.insert("user".into(), optional(remoting.get("user")));
            winrm.insert("password".into(), optional(remoting.get("password")));
            winrm.insert("ssl".into(), Value::Bool(false));
            (TargetConfig::new("winrm", winrm), WINRM_NODES)
        };

        let node = Node::new(node_name.as_str())
            .with_config(config)
            .with_fact("provisioner", "vagrant")
            .with_fact("platform", platform.as_str())
            .with_fact("id", vm_id.as_str())
            .with_fact("vagrant_env", env.as_str())
            .with_vars(request.vars.clone());

        inventory.add(&node, group)?.save()?;
        info!("vagrant machine {} is up at {}", vm_id, node_name);

        Ok(TaskOutcome::Provisioned { node_name, node })
    }

    fn tear_down(&self, request: &TearDownRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let node = inventory.lookup(&Lookup::either(&request.node_name))?.clone();
        let env = node.fact_str("vagrant_env").ok_or_else(|| {
            ProvisionError::Validation(format!("target {} has no vagrant_env fact", request.node_name))
        })?;
        self.destroy(Utf8Path::new(&env))?;
        info!("removed {}", request.node_name);
        remove_and_save(inventory, std::slice::from_ref(&node))
    }
}
