//! Grouped registry of provisioned targets, persisted as a YAML file.
//!
//! The inventory is always handled as load → mutate → save within a single
//! process invocation. Nothing guards the file against a second process
//! doing the same at the same time: the last `save` wins and silently
//! discards the other writer's changes. Callers are expected to serialize
//! invocations that share an inventory file.

mod model;

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use tracing::debug;

use crate::error::ProvisionError;

pub use model::{Group, Node, TargetConfig, mapping};

/// File name used when the inventory location is a directory.
pub const DEFAULT_FILENAME: &str = "inventory.yaml";

/// Schema marker written to new inventories.
pub const INVENTORY_VERSION: u32 = 2;

pub const SSH_NODES: &str = "ssh_nodes";
pub const WINRM_NODES: &str = "winrm_nodes";
pub const DOCKER_NODES: &str = "docker_nodes";
pub const LXD_NODES: &str = "lxd_nodes";

/// An inventory shared by every `open` of the same location in this process.
pub type SharedInventory = Arc<Mutex<Inventory>>;

static INSTANCES: OnceLock<Mutex<HashMap<Utf8PathBuf, SharedInventory>>> = OnceLock::new();

fn default_version() -> u32 {
    INVENTORY_VERSION
}

/// The persisted registry of provisioned nodes, grouped by transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(skip)]
    location: Utf8PathBuf,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(flatten)]
    pub extra: Mapping,
}

/// Query for [`Inventory::lookup`].
///
/// A bare identifier ([`Lookup::either`]) matches a target whose `uri` or
/// `name` equals it; [`Lookup::uri`] and [`Lookup::name`] check one field
/// only. [`Lookup::in_group`] restricts the search to one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup<'a> {
    value: &'a str,
    by_uri: bool,
    by_name: bool,
    group: Option<&'a str>,
}

impl<'a> Lookup<'a> {
    pub fn either(value: &'a str) -> Self {
        Self {
            value,
            by_uri: true,
            by_name: true,
            group: None,
        }
    }

    pub fn uri(value: &'a str) -> Self {
        Self {
            by_name: false,
            ..Self::either(value)
        }
    }

    pub fn name(value: &'a str) -> Self {
        Self {
            by_uri: false,
            ..Self::either(value)
        }
    }

    #[must_use]
    pub fn in_group(mut self, group: &'a str) -> Self {
        self.group = Some(group);
        self
    }

    fn matches(&self, node: &Node) -> bool {
        (self.by_uri && node.uri == self.value)
            || (self.by_name && node.name.as_deref() == Some(self.value))
    }
}

/// Resolves an inventory location to the path of the inventory file.
///
/// - `None` resolves to [`DEFAULT_FILENAME`] in the current working directory.
/// - An existing directory resolves to [`DEFAULT_FILENAME`] inside it.
/// - Anything else is taken as the file path itself.
///
/// Relative paths are made absolute against the current directory. Fails
/// with [`ProvisionError::Config`] when the parent directory does not exist.
pub fn resolve_location(location: Option<&Utf8Path>) -> Result<Utf8PathBuf, ProvisionError> {
    let cwd = std::env::current_dir()
        .map_err(|e| ProvisionError::io("failed to read current directory", e))?;
    let cwd = Utf8PathBuf::try_from(cwd).map_err(|e| {
        ProvisionError::Config(format!("current directory is not valid UTF-8: {}", e))
    })?;

    let location = match location {
        Some(path) if path.is_relative() => cwd.join(path),
        Some(path) => path.to_path_buf(),
        None => cwd,
    };

    let path = if location.is_dir() {
        location.join(DEFAULT_FILENAME)
    } else {
        location
    };

    match path.parent() {
        Some(parent) if parent.is_dir() => Ok(path),
        _ => Err(ProvisionError::Config(format!(
            "directory for storing inventory does not exist: {}",
            path
        ))),
    }
}

/// Converts any serializable value into a [`Node`] by a serialize/deserialize round trip.
fn normalize<N: Serialize + ?Sized>(node: &N) -> Result<Node, ProvisionError> {
    let value = serde_yaml::to_value(node)
        .map_err(|e| ProvisionError::Parse(format!("failed to serialize target: {}", e)))?;
    serde_yaml::from_value(value)
        .map_err(|e| ProvisionError::Parse(format!("invalid inventory target: {}", e)))
}

impl Inventory {
    /// The structure used when no inventory file exists yet.
    pub fn skeleton(location: impl Into<Utf8PathBuf>) -> Self {
        Self {
            location: location.into(),
            version: INVENTORY_VERSION,
            groups: [DOCKER_NODES, SSH_NODES, WINRM_NODES]
                .into_iter()
                .map(Group::new)
                .collect(),
            extra: Mapping::new(),
        }
    }

    /// Opens the inventory at `location`, memoized per resolved path.
    ///
    /// Every call with a location resolving to the same file returns the
    /// same shared instance for the lifetime of the process.
    pub fn open(location: Option<&Utf8Path>) -> Result<SharedInventory, ProvisionError> {
        let path = resolve_location(location)?;
        let instances = INSTANCES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut instances = instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(shared) = instances.get(&path) {
            return Ok(Arc::clone(shared));
        }
        let shared = Arc::new(Mutex::new(Self::load(&path)?));
        instances.insert(path, Arc::clone(&shared));
        Ok(shared)
    }

    /// Reads the inventory file at `path`, or returns the skeleton if it does not exist.
    ///
    /// Unlike [`Inventory::open`] this always reads the file again.
    pub fn load(path: &Utf8Path) -> Result<Self, ProvisionError> {
        if !path.is_file() {
            debug!("inventory {} does not exist, using default skeleton", path);
            return Ok(Self::skeleton(path));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ProvisionError::io(format!("failed to read inventory: {}", path), e))?;
        if content.trim().is_empty() {
            return Ok(Self::skeleton(path));
        }

        let mut inventory: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProvisionError::Parse(format!("failed to parse inventory {}: {}", path, e))
        })?;
        inventory.location = path.to_path_buf();
        Ok(inventory)
    }

    /// Path of the backing file.
    pub fn location(&self) -> &Utf8Path {
        &self.location
    }

    /// Directory holding the backing file.
    pub fn directory(&self) -> &Utf8Path {
        self.location.parent().unwrap_or(Utf8Path::new("."))
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// All targets, in group order then insertion order.
    pub fn targets(&self) -> impl Iterator<Item = &Node> {
        self.groups.iter().flat_map(|g| g.targets.iter())
    }

    /// Appends `node` to `group`, creating the group if needed.
    ///
    /// Nothing is written to disk until [`Inventory::save`] is called.
    pub fn add<N: Serialize + ?Sized>(
        &mut self,
        node: &N,
        group: &str,
    ) -> Result<&mut Self, ProvisionError> {
        let node = normalize(node)?;
        debug!("adding target {} to group {}", node.display_name(), group);
        match self.groups.iter_mut().find(|g| g.name == group) {
            Some(existing) => existing.targets.push(node),
            None => self.groups.push(Group {
                name: group.to_string(),
                targets: vec![node],
                extra: Mapping::new(),
            }),
        }
        Ok(self)
    }

    /// Removes every target structurally equal to `node` from every group.
    ///
    /// Removing a node that is not present is a no-op.
    pub fn remove<N: Serialize + ?Sized>(&mut self, node: &N) -> Result<&mut Self, ProvisionError> {
        let node = normalize(node)?;
        let mut removed = 0;
        for group in &mut self.groups {
            let before = group.targets.len();
            group.targets.retain(|target| *target != node);
            removed += before - group.targets.len();
        }
        debug!("removed {} target(s) matching {}", removed, node.display_name());
        Ok(self)
    }

    /// Finds the first target matching `query`.
    pub fn lookup(&self, query: &Lookup<'_>) -> Result<&Node, ProvisionError> {
        self.groups
            .iter()
            .filter(|g| query.group.is_none_or(|name| g.name == name))
            .flat_map(|g| g.targets.iter())
            .find(|t| query.matches(t))
            .ok_or_else(|| ProvisionError::NotFound(query.value.to_string()))
    }

    /// All targets whose fact `key` equals `value`, in inventory order.
    pub fn correlated(&self, key: &str, value: &str) -> Vec<Node> {
        self.targets()
            .filter(|t| t.fact_str(key).as_deref() == Some(value))
            .cloned()
            .collect()
    }

    /// Overwrites the backing file with the full inventory.
    pub fn save(&self) -> Result<&Self, ProvisionError> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| ProvisionError::Parse(format!("failed to serialize inventory: {}", e)))?;
        fs::write(&self.location, yaml).map_err(|e| {
            ProvisionError::io(format!("failed to write inventory: {}", self.location), e)
        })?;
        debug!("saved inventory to {}", self.location);
        Ok(self)
    }
}
