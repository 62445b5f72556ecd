//! Google Compute Engine VMs created with Terraform.
//!
//! Each provision works in a directory holding `main.tf` and `vars.tf`,
//! either generated under `<inventory dir>/.terraform/` or supplied by the
//! caller as `dir`. The `node` output of the configuration maps VM names to
//! public addresses; every entry becomes an SSH target.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use super::{
    Provisioner, create_env_dir, decode_options, env_root, remove_and_save, remove_env_dir,
    render_template, write_file,
};
use crate::config::login_user;
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec, run};
use crate::inventory::{Inventory, Lookup, Node, SSH_NODES, TargetConfig};
use crate::protocol::with_cleanup;
use crate::task::{ProvisionRequest, TaskOutcome, TearDownRequest};

const MAIN_TF: &str = r#"provider "google" {
  credentials = file(var.credentials_file)
  project     = var.project
  region      = var.region
}

resource "google_compute_instance" "node" {
  name         = var.vm_name
  machine_type = var.machine_type
  zone         = var.zone

  tags = ["litmus"]

  boot_disk {
    initialize_params {
      image = var.image
    }
  }

  network_interface {
    network = "default"
    access_config {
    }
  }

  metadata = {
    ssh-keys = "${var.ssh_user}:${file(var.ssh_public_key)}"
  }

  labels = {
    type       = "litmus"
    created_by = var.created_by
    owner      = var.owner
    build_url  = var.build_url
  }
}

# node name => public ip address
output "node" {
  value = tomap({
    (google_compute_instance.node.name) = google_compute_instance.node.network_interface.0.access_config.0.nat_ip
  })
}
"#;

const VARS_TF: &str = r#"variable "credentials_file" {
  type        = string
  description = "Path to gcp credentials file"
  default     = "{{ credentials_file }}"
}

variable "ssh_user" {
  type        = string
  description = "User used to connect via ssh"
  default     = "{{ ssh_user }}"
}

variable "ssh_public_key" {
  type        = string
  description = "Path to ssh public key"
  default     = "{{ ssh_public_key }}"
}

variable "project" {
  type        = string
  description = "Project ID"
  default     = "{{ project_id }}"
}

variable "zone" {
  type        = string
  description = "Compute Zone where to create the node"
  default     = "{{ zone }}"
}

variable "region" {
  type        = string
  description = "Compute Region where to create the node"
  default     = "{{ region }}"
}

variable "image" {
  type        = string
  description = "The image from which to initialize this disk"
  default     = "{{ image }}"
}

variable "machine_type" {
  type        = string
  description = "Type of machine"
  default     = "{{ machine_type }}"
}

variable "vm_name" {
  type        = string
  description = "The vm identifier"
  default     = "{{ vm_name }}"
}

variable "created_by" {
  type        = string
  description = "Name of the user that created the vm"
  default     = "{{ created_by }}"
}

variable "owner" {
  type        = string
  description = "Name of the Department/Team that owns this node (optional)"
  default     = "{{ owner }}"
}

variable "build_url" {
  type        = string
  description = "URL of the CI job that created the vm (optional)"
  default     = "{{ build_url }}"
}
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerraformSettings {
    /// Login name used for `ssh_user`, `created_by` and `owner` when not given.
    pub user: String,
}

impl TerraformSettings {
    pub fn from_env() -> Self {
        Self { user: login_user() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn iter(&self) -> impl Iterator<Item = &str> {
        let items: Vec<&str> = match self {
            Self::One(item) => vec![item.as_str()],
            Self::Many(items) => items.iter().map(String::as_str).collect(),
        };
        items.into_iter()
    }
}

/// Options shared by `apply` and `destroy`.
#[derive(Debug, Clone, Default, Deserialize)]
struct CliOptions {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    state_out: Option<String>,
    #[serde(default)]
    target: Option<OneOrMany>,
    #[serde(default)]
    var: Option<Map<String, JsonValue>>,
    #[serde(default)]
    var_file: Option<OneOrMany>,
}

impl CliOptions {
    fn args(&self, dir: &Utf8Path) -> Vec<String> {
        let mut args: Vec<String> = ["-auto-approve", "-no-color", "-input=false"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(state) = &self.state {
            args.push(format!("-state={}", dir.join(state)));
        }
        if let Some(state_out) = &self.state_out {
            args.push(format!("-state-out={}", dir.join(state_out)));
        }
        for resource in self.target.iter().flat_map(OneOrMany::iter) {
            args.push(format!("-target={}", resource));
        }
        for (key, value) in self.var.iter().flatten() {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.push("-var".to_string());
            args.push(format!("{}={}", key, value));
        }
        for path in self.var_file.iter().flat_map(OneOrMany::iter) {
            args.push(format!("-var-file={}", dir.join(path)));
        }
        args
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TerraformOptions {
    #[serde(default)]
    dir: Option<Utf8PathBuf>,
    #[serde(default)]
    ssh_user: Option<String>,
    #[serde(default)]
    ssh_private_key: Option<String>,
    #[serde(default)]
    ssh_public_key: Option<String>,
    #[serde(default)]
    ssh_host_key_check: Option<bool>,
    #[serde(default)]
    ssh_port: Option<u16>,
    #[serde(default)]
    created_by: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    build_url: Option<String>,
    #[serde(default)]
    credentials_file: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    machine_type: Option<String>,
    #[serde(default)]
    vm_name: Option<String>,
    #[serde(default)]
    main_template: Option<Utf8PathBuf>,
    #[serde(default)]
    vars_template: Option<Utf8PathBuf>,
    #[serde(flatten)]
    cli: CliOptions,
}

/// Values substituted into `vars.tf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcpVars {
    pub credentials_file: String,
    pub ssh_user: String,
    pub ssh_private_key: String,
    pub ssh_public_key: String,
    pub ssh_host_key_check: bool,
    pub ssh_port: u16,
    pub project_id: String,
    pub region: String,
    pub zone: String,
    pub image: String,
    pub machine_type: String,
    pub vm_name: String,
    pub created_by: String,
    pub owner: String,
    pub build_url: String,
}

impl GcpVars {
    fn resolve(settings: &TerraformSettings, options: &TerraformOptions, image: &str) -> Self {
        let created_by = options.created_by.clone().unwrap_or_else(|| settings.user.clone());
        let vm_name = options.vm_name.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("litmus-test-{}-{}", created_by, &suffix[..8])
        });
        Self {
            credentials_file: options
                .credentials_file
                .clone()
                .unwrap_or_else(|| "~/.ssh/litmus-compute.json".to_string()),
            ssh_user: options.ssh_user.clone().unwrap_or_else(|| settings.user.clone()),
            ssh_private_key: options
                .ssh_private_key
                .clone()
                .unwrap_or_else(|| "~/.ssh/litmus_compute".to_string()),
            ssh_public_key: options
                .ssh_public_key
                .clone()
                .unwrap_or_else(|| "~/.ssh/litmus_compute.pub".to_string()),
            ssh_host_key_check: options.ssh_host_key_check.unwrap_or(false),
            ssh_port: options.ssh_port.unwrap_or(22),
            project_id: options.project_id.clone().unwrap_or_else(|| "litmus-compute".to_string()),
            region: options.region.clone().unwrap_or_else(|| "us-central1".to_string()),
            zone: options.zone.clone().unwrap_or_else(|| "us-central1-a".to_string()),
            image: image.to_string(),
            machine_type: options.machine_type.clone().unwrap_or_else(|| "n1-standard-1".to_string()),
            vm_name,
            owner: options.owner.clone().unwrap_or_else(|| settings.user.clone()),
            created_by,
            build_url: options.build_url.clone().unwrap_or_default(),
        }
    }
}

/// Extracts `name => address` pairs from `terraform output -json`.
fn parse_node_output(raw: &str) -> Result<Vec<(String, String)>, ProvisionError> {
    let output: JsonValue = serde_json::from_str(raw)
        .map_err(|e| ProvisionError::Parse(format!("invalid terraform output: {}", e)))?;
    let nodes = output
        .get("node")
        .and_then(|n| n.get("value"))
        .and_then(JsonValue::as_object)
        .ok_or_else(|| ProvisionError::Parse("terraform output has no node map".to_string()))?;
    let pairs: Vec<(String, String)> = nodes
        .iter()
        .filter_map(|(name, ip)| ip.as_str().map(|ip| (name.clone(), ip.to_string())))
        .collect();
    if pairs.is_empty() {
        return Err(ProvisionError::Parse("terraform output lists no nodes".to_string()));
    }
    Ok(pairs)
}

fn read_template(path: &Utf8Path) -> Result<String, ProvisionError> {
    fs::read_to_string(path).map_err(|e| ProvisionError::io(format!("failed to read template {}", path), e))
}

pub struct TerraformProvisioner {
    settings: TerraformSettings,
    executor: Arc<dyn CommandExecutor>,
}

impl TerraformProvisioner {
    pub fn new(settings: TerraformSettings, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { settings, executor }
    }

    fn terraform<I, S>(&self, dir: &Utf8Path, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        run(self.executor.as_ref(), &CommandSpec::new("terraform", args).with_cwd(dir))
    }

    fn generate(&self, dir: &Utf8Path, options: &TerraformOptions, vars: &GcpVars) -> Result<()> {
        let main = match &options.main_template {
            Some(path) => read_template(path)?,
            None => MAIN_TF.to_string(),
        };
        let variables = match &options.vars_template {
            Some(path) => read_template(path)?,
            None => VARS_TF.to_string(),
        };
        let context = tera::Context::from_serialize(vars).context("failed to build template context")?;
        write_file(&dir.join("main.tf"), &render_template("main.tf", &main, &context)?)?;
        write_file(&dir.join("vars.tf"), &render_template("vars.tf", &variables, &context)?)?;
        debug!("generated terraform files in {}", dir);
        Ok(())
    }

    /// Writes the generated configuration, then runs `init` when needed and `validate`.
    fn prepare(&self, dir: &Utf8Path, generated: bool, options: &TerraformOptions, vars: &GcpVars) -> Result<()> {
        if generated {
            self.generate(dir, options, vars)?;
        }
        if dir.join(".terraform").exists() {
            debug!("terraform already initialized in {}", dir);
        } else {
            self.terraform(dir, ["init", "-no-color"])?;
        }
        self.terraform(dir, ["validate", "-no-color"])?;
        Ok(())
    }

    fn apply_and_read(&self, dir: &Utf8Path, cli: &CliOptions) -> Result<Vec<(String, String)>> {
        let mut apply = vec!["apply".to_string()];
        apply.extend(cli.args(dir));
        self.terraform(dir, apply)?;
        let output = self.terraform(dir, ["output", "-no-color", "-json"])?;
        Ok(parse_node_output(&output)?)
    }

    fn destroy(&self, dir: &Utf8Path, cli: &CliOptions) -> Result<()> {
        let mut destroy = vec!["destroy".to_string()];
        destroy.extend(cli.args(dir));
        self.terraform(dir, destroy).map(drop)
    }
}

impl Provisioner for TerraformProvisioner {
    fn name(&self) -> &'static str {
        "terraform"
    }

    fn provision(&self, request: &ProvisionRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let options: TerraformOptions = decode_options(&request.options)?;
        let platform = request.platform.to_string();
        let vars = GcpVars::resolve(&self.settings, &options, &platform);

        let (dir, generated) = match &options.dir {
            Some(dir) => (dir.clone(), false),
            None => {
                let root = env_root(inventory.directory(), ".terraform")?;
                (create_env_dir(&root, &request.platform.slug())?, true)
            }
        };

        with_cleanup(
            &format!("terraform environment {}", dir),
            || self.prepare(&dir, generated, &options, &vars),
            || {
                if generated {
                    remove_env_dir(&dir)?;
                }
                Ok(())
            },
        )?;

        let nodes = with_cleanup(
            &format!("terraform environment {}", dir),
            || self.apply_and_read(&dir, &options.cli),
            || self.destroy(&dir, &options.cli),
        )?;

        let mut created = Vec::with_capacity(nodes.len());
        for (vm_name, address) in nodes {
            let mut ssh = Mapping::new();
            ssh.insert("user".into(), vars.ssh_user.as_str().into());
            ssh.insert("host".into(), address.as_str().into());
            ssh.insert("private-key".into(), vars.ssh_private_key.as_str().into());
            ssh.insert("host-key-check".into(), Value::Bool(vars.ssh_host_key_check));
            ssh.insert("port".into(), Value::from(vars.ssh_port));
            ssh.insert("run-as".into(), "root".into());

            let node = Node::new(address.as_str())
                .with_config(TargetConfig::new("ssh", ssh))
                .with_fact("provisioner", "terraform_gcp")
                .with_fact("platform", platform.as_str())
                .with_fact("id", vm_name.as_str())
                .with_fact("terraform_env", dir.as_str())
                .with_vars(request.vars.clone());
            inventory.add(&node, SSH_NODES)?;
            created.push(node);
        }
        inventory.save()?;
        info!("terraform created {} node(s) in {}", created.len(), dir);

        let node = created.swap_remove(0);
        Ok(TaskOutcome::Provisioned {
            node_name: node.uri.clone(),
            node,
        })
    }

    fn tear_down(&self, request: &TearDownRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let cli: CliOptions = decode_options(&request.options)?;
        let node = inventory.lookup(&Lookup::either(&request.node_name))?;
        let env = node.fact_str("terraform_env").ok_or_else(|| {
            ProvisionError::Validation(format!("target {} has no terraform_env fact", request.node_name))
        })?;
        let targets = inventory.correlated("terraform_env", &env);
        let dir = Utf8PathBuf::from(env);

        self.destroy(&dir, &cli)?;
        if dir.starts_with(inventory.directory().join(".terraform"))
            || inventory
                .directory()
                .canonicalize_utf8()
                .is_ok_and(|root| dir.starts_with(root.join(".terraform")))
        {
            remove_env_dir(&dir)?;
        }
        info!("destroyed terraform environment {}", dir);
        remove_and_save(inventory, &targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(json: serde_json::Value) -> TerraformOptions {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_cli_args() {
        let opts = options(serde_json::json!({
            "state": "tf.state",
            "target": ["a.b", "c.d"],
            "var": { "count": 2, "name": "x" },
            "var_file": "prod.tfvars",
        }));
        assert_eq!(
            opts.cli.args(Utf8Path::new("/work")),
            vec![
                "-auto-approve",
                "-no-color",
                "-input=false",
                "-state=/work/tf.state",
                "-target=a.b",
                "-target=c.d",
                "-var",
                "count=2",
                "-var",
                "name=x",
                "-var-file=/work/prod.tfvars",
            ]
        );
    }

    #[test]
    fn test_resolve_defaults() {
        let settings = TerraformSettings { user: "alice".into() };
        let vars = GcpVars::resolve(&settings, &TerraformOptions::default(), "centos-cloud/centos-7");
        assert_eq!(vars.ssh_user, "alice");
        assert_eq!(vars.owner, "alice");
        assert_eq!(vars.region, "us-central1");
        assert_eq!(vars.zone, "us-central1-a");
        assert_eq!(vars.machine_type, "n1-standard-1");
        assert_eq!(vars.ssh_private_key, "~/.ssh/litmus_compute");
        assert_eq!(vars.ssh_port, 22);
        assert!(vars.vm_name.starts_with("litmus-test-alice-"));
        assert_eq!(vars.vm_name.len(), "litmus-test-alice-".len() + 8);
    }

    #[test]
    fn test_vars_template_renders() {
        let settings = TerraformSettings { user: "alice".into() };
        let opts = options(serde_json::json!({ "vm_name": "vm1", "zone": "europe-west1-b" }));
        let vars = GcpVars::resolve(&settings, &opts, "debian-cloud/debian-12");
        let context = tera::Context::from_serialize(&vars).unwrap();
        let rendered = render_template("vars.tf", VARS_TF, &context).unwrap();
        assert!(rendered.contains("default     = \"vm1\""));
        assert!(rendered.contains("default     = \"europe-west1-b\""));
        assert!(rendered.contains("default     = \"debian-cloud/debian-12\""));
        let main = render_template("main.tf", MAIN_TF, &context).unwrap();
        assert!(main.contains("${var.ssh_user}"));
    }

    #[test]
    fn test_parse_node_output() {
        let raw = r#"{"node": {"sensitive": false, "type": ["map", "string"], "value": {"node01": "10.178.195.223"}}}"#;
        assert_eq!(
            parse_node_output(raw).unwrap(),
            vec![("node01".to_string(), "10.178.195.223".to_string())]
        );
        assert!(matches!(parse_node_output("{}"), Err(ProvisionError::Parse(_))));
        assert!(matches!(
            parse_node_output(r#"{"node": {"value": {}}}"#),
            Err(ProvisionError::Parse(_))
        ));
    }
}
