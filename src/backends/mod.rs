//! Provisioning backends.
//!
//! Each backend implements [`Provisioner`] on top of the shared protocol in
//! [`crate::protocol`]: create the resource, wait for it, register it in the
//! inventory, and clean up on failure. Collaborators (subprocesses, HTTP,
//! time, SSH setup) are injected through [`Services`] so every backend can
//! run against test doubles.

pub mod abs;
pub mod docker;
pub mod lxd;
pub mod provision_service;
pub mod terraform;
pub mod vagrant;

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cli::Backend;
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, RealCommandExecutor};
use crate::http::{HttpClient, UreqClient};
use crate::inventory::{Inventory, Node};
use crate::protocol::{Clock, SystemClock};
use crate::task::{ProvisionRequest, TaskOutcome, TearDownRequest};

pub use abs::{AbsProvisioner, AbsSettings};
pub use docker::{DockerProvisioner, DockerSettings, PackageManagerInstaller, SshInstaller};
pub use lxd::{LxdProvisioner, LxdSettings};
pub use provision_service::{ProvisionServiceProvisioner, ProvisionServiceSettings};
pub use terraform::{TerraformProvisioner, TerraformSettings};
pub use vagrant::{VagrantProvisioner, VagrantSettings};

/// A substrate able to create and destroy compute resources.
pub trait Provisioner {
    /// Short backend name, as used in error kinds.
    fn name(&self) -> &'static str;

    /// Creates resources for `request.platform` and registers them in `inventory`.
    fn provision(&self, request: &ProvisionRequest, inventory: &mut Inventory)
    -> Result<TaskOutcome>;

    /// Destroys the resource behind `request.node_name` and removes it from `inventory`.
    fn tear_down(&self, request: &TearDownRequest, inventory: &mut Inventory)
    -> Result<TaskOutcome>;
}

/// Collaborators shared by all backends.
#[derive(Clone)]
pub struct Services {
    pub executor: Arc<dyn CommandExecutor>,
    pub http: Arc<dyn HttpClient>,
    pub clock: Arc<dyn Clock>,
    pub installer: Arc<dyn SshInstaller>,
}

impl Services {
    /// Real subprocesses, a `ureq` client with a five minute read timeout and the wall clock.
    pub fn system() -> Self {
        Self {
            executor: Arc::new(RealCommandExecutor),
            http: Arc::new(UreqClient::new(Duration::from_secs(5 * 60), 0)),
            clock: Arc::new(SystemClock::new()),
            installer: Arc::new(PackageManagerInstaller),
        }
    }
}

/// Builds the provisioner for `backend`, reading its settings from the environment.
pub fn build(backend: Backend, services: &Services) -> Result<Box<dyn Provisioner>> {
    let provisioner: Box<dyn Provisioner> = match backend {
        Backend::Abs => Box::new(AbsProvisioner::new(
            AbsSettings::from_env()?,
            Arc::clone(&services.http),
            Arc::clone(&services.clock),
        )),
        Backend::ProvisionService => Box::new(ProvisionServiceProvisioner::new(
            ProvisionServiceSettings::from_env()?,
            Arc::clone(&services.http),
        )),
        Backend::Lxd => Box::new(LxdProvisioner::new(
            LxdSettings::from_env()?,
            Arc::clone(&services.executor),
            Arc::clone(&services.clock),
        )),
        Backend::Docker => Box::new(DockerProvisioner::new(
            DockerSettings::from_env(),
            Arc::clone(&services.executor),
            Arc::clone(&services.installer),
        )),
        Backend::Vagrant => Box::new(VagrantProvisioner::new(
            VagrantSettings::from_env()?,
            Arc::clone(&services.executor),
        )),
        Backend::Terraform => Box::new(TerraformProvisioner::new(
            TerraformSettings::from_env(),
            Arc::clone(&services.executor),
        )),
    };
    Ok(provisioner)
}

/// Decodes backend options from the extra keys of a request.
pub(crate) fn decode_options<T: DeserializeOwned>(
    options: &Map<String, Value>,
) -> Result<T, ProvisionError> {
    serde_json::from_value(Value::Object(options.clone()))
        .map_err(|e| ProvisionError::Validation(format!("invalid options: {}", e)))
}

/// Identities reported for removed nodes.
pub(crate) fn removed_names(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(|n| n.display_name().to_string()).collect()
}

/// Removes `nodes` from `inventory`, saves, and reports them as removed.
pub(crate) fn remove_and_save(inventory: &mut Inventory, nodes: &[Node]) -> Result<TaskOutcome> {
    for node in nodes {
        inventory.remove(node)?;
    }
    inventory.save()?;
    Ok(TaskOutcome::Removed {
        removed: removed_names(nodes),
    })
}

/// Renders a tera template with the given context, without autoescaping.
pub(crate) fn render_template(
    name: &str,
    template: &str,
    context: &tera::Context,
) -> Result<String, ProvisionError> {
    tera::Tera::one_off(template, context, false)
        .map_err(|e| ProvisionError::Config(format!("failed to render {}: {:?}", name, e)))
}

/// Writes `contents` to `path`, reporting failures with the path.
pub(crate) fn write_file(path: &Utf8Path, contents: &str) -> Result<(), ProvisionError> {
    fs::write(path, contents).map_err(|e| ProvisionError::io(format!("failed to write {}", path), e))
}

/// Removes an environment directory; a directory that is already gone is not an error.
pub(crate) fn remove_env_dir(dir: &Utf8Path) -> Result<(), ProvisionError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProvisionError::io(format!("failed to remove directory: {}", dir), e)),
    }
}

/// Absolute path of `<inventory dir>/<name>`, the parent of generated environments.
pub(crate) fn env_root(inventory_dir: &Utf8Path, name: &str) -> Result<Utf8PathBuf, ProvisionError> {
    let base = if inventory_dir.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        inventory_dir
    };
    let base = base
        .canonicalize_utf8()
        .map_err(|e| ProvisionError::io(format!("failed to resolve directory: {}", base), e))?;
    Ok(base.join(name))
}

/// Creates a fresh environment directory `<root>/<base>-<i>` for the lowest free `i`.
///
/// Each candidate is created with an exclusive `create_dir`, so two
/// concurrent invocations never receive the same directory.
pub(crate) fn create_env_dir(root: &Utf8Path, base: &str) -> Result<Utf8PathBuf, ProvisionError> {
    fs::create_dir_all(root)
        .map_err(|e| ProvisionError::io(format!("failed to create directory: {}", root), e))?;
    let base = base.replace(['/', '\\'], "-");
    let mut index = 0u32;
    loop {
        let candidate = root.join(format!("{}-{}", base, index));
        match fs::create_dir(&candidate) {
            Ok(()) => {
                debug!("created environment directory {}", candidate);
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => index += 1,
            Err(e) => {
                return Err(ProvisionError::io(
                    format!("failed to create directory: {}", candidate),
                    e,
                ));
            }
        }
    }
}
