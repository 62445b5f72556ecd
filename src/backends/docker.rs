//! Docker containers reachable over SSH through a forwarded port.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::Result;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::{Provisioner, remove_and_save};
use crate::config::env_var;
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec, run};
use crate::inventory::{Inventory, Lookup, Node, SSH_NODES, TargetConfig, mapping};
use crate::protocol::with_cleanup;
use crate::task::{ProvisionRequest, TaskOutcome, TearDownRequest};

/// Distribution facts of an image, from `/etc/os-release` or the image name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub fields: BTreeMap<String, String>,
}

impl OsRelease {
    /// Parses the shell-style `KEY=value` lines of an os-release file.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .filter(|(key, value)| !key.is_empty() && !value.is_empty())
            .map(|(key, value)| (key.to_string(), unquote(value)))
            .collect();
        Self { fields }
    }

    /// Guesses `ID` and `VERSION_ID` from an image reference like `org/distro:version`.
    pub fn from_image(image: &str) -> Self {
        let (id, version) = match image.split_once(':') {
            Some((id, version)) => (id, Some(version)),
            None => (image, None),
        };
        let mut fields = BTreeMap::new();
        fields.insert("ID".to_string(), id.replacen('/', "_", 1));
        if let Some(version) = version {
            fields.insert("VERSION_ID".to_string(), version.to_string());
        }
        Self { fields }
    }

    pub fn id(&self) -> &str {
        self.fields.get("ID").map_or("", String::as_str)
    }

    pub fn version_id(&self) -> &str {
        self.fields.get("VERSION_ID").map_or("", String::as_str)
    }

    fn to_value(&self) -> Value {
        Value::Mapping(mapping(self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
    }
}

fn unquote(value: &str) -> String {
    if value.starts_with('"') {
        serde_json::from_str(value).unwrap_or_else(|_| value.trim_matches('"').to_string())
    } else {
        value.trim_matches('\'').to_string()
    }
}

/// Prepares an SSH server inside a freshly started container.
pub trait SshInstaller: Send + Sync {
    fn install(&self, executor: &dyn CommandExecutor, container: &str, os: &OsRelease) -> Result<()>;
}

/// Installs and configures `sshd` with the distribution's package manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageManagerInstaller;

const RHEL_FAMILY: [&str; 11] = [
    "centos", "el-", "eos", "oracle", "ol", "rhel", "redhat", "scientific", "amzn", "rocky", "almalinux",
];

fn is_rhel_family(id: &str) -> bool {
    RHEL_FAMILY.iter().any(|name| id.contains(name))
}

/// Shell commands that install sshd and allow root password logins.
pub fn ssh_setup_commands(os: &OsRelease) -> Result<Vec<String>, ProvisionError> {
    let id = os.id().to_lowercase();
    let version = os.version_id();
    let mut commands: Vec<String> = Vec::new();

    if ["debian", "ubuntu", "cumulus"].iter().any(|d| id.contains(d)) {
        commands.extend([
            "rm -f /etc/apt/sources.list.d/ubuntu-esm-infra-trusty.list".into(),
            "apt-get update".into(),
            "apt-get install -y openssh-server openssh-client".into(),
        ]);
    } else if id.contains("fedora") {
        commands.extend([
            "dnf clean all".into(),
            "dnf install -y sudo openssh-server openssh-clients".into(),
            "ssh-keygen -A".into(),
        ]);
    } else if is_rhel_family(&id) {
        if version == "6" {
            commands.push(
                "rm -f /var/lib/rpm/__db*; db_verify /var/lib/rpm/Packages; rpm --rebuilddb; yum clean all"
                    .into(),
            );
        }
        commands.extend([
            "yum install -y sudo openssh-server openssh-clients".into(),
            "test -f /etc/ssh/ssh_host_rsa_key || ssh-keygen -t rsa -f /etc/ssh/ssh_host_rsa_key -N ''".into(),
        ]);
    } else if id.contains("opensuse") || id.contains("sles") {
        commands.extend([
            "zypper -n in openssh".into(),
            "ssh-keygen -A".into(),
            r#"sed -ri "s/^#?UsePAM .*/UsePAM no/" /etc/ssh/sshd_config"#.into(),
        ]);
    } else if id.contains("archlinux") {
        commands.extend([
            "pacman --noconfirm -Sy archlinux-keyring".into(),
            "pacman --noconfirm -Syu".into(),
            "pacman -S --noconfirm openssh".into(),
            "ssh-keygen -A".into(),
            r#"sed -ri "s/^#?UsePAM .*/UsePAM no/" /etc/ssh/sshd_config"#.into(),
            "systemctl enable sshd".into(),
        ]);
    } else {
        return Err(ProvisionError::Validation(format!(
            "distribution {} not yet supported on docker",
            os.id()
        )));
    }

    commands.extend([
        "mkdir -p /var/run/sshd".into(),
        "echo root:root | /usr/sbin/chpasswd".into(),
        r#"sed -ri "s/^#?PermitRootLogin .*/PermitRootLogin yes/" /etc/ssh/sshd_config"#.into(),
        r#"sed -ri "s/^#?PasswordAuthentication .*/PasswordAuthentication yes/" /etc/ssh/sshd_config"#.into(),
        r#"sed -ri "s/^#?UseDNS .*/UseDNS no/" /etc/ssh/sshd_config"#.into(),
    ]);

    if id.contains("debian") || id.contains("ubuntu") {
        commands.push("service ssh restart".into());
    } else if id.contains("sles") || id.contains("opensuse") || id.contains("archlinux") {
        commands.push("/usr/sbin/sshd".into());
    } else if ["7", "8", "9", "2"].iter().any(|v| version.starts_with(v)) {
        if version.starts_with('7') && ["rhel", "redhat", "centos"].iter().any(|d| id.contains(d)) {
            commands.push(
                r#"sed "s@session\s*required\s*pam_loginuid.so@session optional pam_loginuid.so@g" -i /etc/pam.d/sshd"#
                    .into(),
            );
        }
        commands.push("/usr/sbin/sshd".into());
    } else {
        commands.push("service sshd restart".into());
    }
    Ok(commands)
}

impl SshInstaller for PackageManagerInstaller {
    fn install(&self, executor: &dyn CommandExecutor, container: &str, os: &OsRelease) -> Result<()> {
        for command in ssh_setup_commands(os)? {
            run(executor, &CommandSpec::new("docker", ["exec", container, "sh", "-c", command.as_str()]))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerSettings {
    pub docker_host: Option<String>,
    /// Candidate host ports for SSH forwarding, tried in order.
    pub ports: RangeInclusive<u16>,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            docker_host: None,
            ports: 52222..=65535,
        }
    }
}

impl DockerSettings {
    pub fn from_env() -> Self {
        Self {
            docker_host: env_var("DOCKER_HOST"),
            ..Self::default()
        }
    }
}

/// Returns the host part of a docker endpoint such as `tcp://10.0.0.5:2376`.
fn endpoint_host(endpoint: &str) -> Option<String> {
    Url::parse(endpoint)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .filter(|host| !host.is_empty())
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Extra `docker run` options from `vars.docker_run_opts` plus the cgroup
/// options systemd-based Debian and Ubuntu images need.
fn run_options(image: &str, vars: Option<&Value>) -> Vec<String> {
    let mut opts: Vec<String> = Vec::new();
    match vars.and_then(|v| v.get("docker_run_opts")) {
        Some(Value::Sequence(items)) => {
            for item in items {
                match item {
                    Value::Sequence(nested) => {
                        opts.extend(nested.iter().filter_map(Value::as_str).map(str::to_string))
                    }
                    other => opts.extend(other.as_str().map(str::to_string)),
                }
            }
        }
        Some(Value::String(raw)) => opts.push(raw.clone()),
        _ => {}
    }
    let mut args: Vec<String> = opts
        .iter()
        .flat_map(|opt| opt.split_whitespace())
        .map(str::to_string)
        .collect();

    if image.contains("debian") || image.contains("ubuntu") {
        let joined = args.join(" ");
        if !joined.contains("--volume /sys/fs/cgroup:/sys/fs/cgroup") {
            args.extend(["--volume".to_string(), "/sys/fs/cgroup:/sys/fs/cgroup:rw".to_string()]);
        }
        if !joined.contains("--cgroupns") {
            args.push("--cgroupns=host".to_string());
        }
    }
    args
}

pub struct DockerProvisioner {
    settings: DockerSettings,
    executor: Arc<dyn CommandExecutor>,
    installer: Arc<dyn SshInstaller>,
}

impl DockerProvisioner {
    pub fn new(
        settings: DockerSettings,
        executor: Arc<dyn CommandExecutor>,
        installer: Arc<dyn SshInstaller>,
    ) -> Self {
        Self {
            settings,
            executor,
            installer,
        }
    }

    fn docker<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        run(self.executor.as_ref(), &CommandSpec::new("docker", args))
    }

    fn os_release(&self, image: &str) -> OsRelease {
        match self.docker(["run", "--rm", image, "cat", "/etc/os-release"]) {
            Ok(text) => OsRelease::parse(&text),
            Err(e) => {
                debug!("no os-release in {}, guessing from the image name: {:#}", image, e);
                OsRelease::from_image(image)
            }
        }
    }

    /// Host name under which forwarded ports are reachable.
    fn docker_hostname(&self) -> String {
        let mut hostname = match &self.settings.docker_host {
            Some(raw) => endpoint_host(raw).unwrap_or_else(|| raw.clone()),
            None => "localhost".to_string(),
        };
        match self.docker(["context", "inspect"]) {
            Ok(output) => {
                let endpoint = serde_json::from_str::<serde_json::Value>(&output)
                    .ok()
                    .and_then(|ctx| ctx[0]["Endpoints"]["docker"]["Host"].as_str().map(str::to_string));
                if let Some(host) = endpoint.as_deref().and_then(endpoint_host) {
                    hostname = host;
                }
            }
            Err(e) => debug!("docker context unavailable: {:#}", e),
        }
        hostname
    }

    fn forwarding_port(&self) -> Result<u16, ProvisionError> {
        self.settings
            .ports
            .clone()
            .find(|port| port_is_free(*port))
            .ok_or_else(|| {
                ProvisionError::Config("could not find an open port to use for SSH forwarding".to_string())
            })
    }
}

impl Provisioner for DockerProvisioner {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn provision(&self, request: &ProvisionRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let image = request.platform.to_string();
        let os = self.os_release(&image);
        let hostname = self.docker_hostname();
        warn!("using private port forwarding");
        let port = self.forwarding_port()?;

        let mut args: Vec<String> = [
            "run", "-d", "-it", "--privileged", "--tmpfs", "/tmp:exec", "-p",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(format!("{}:22", port));
        args.extend(run_options(&image, request.vars.as_ref()));
        args.push(image.clone());

        let output = self.docker(args)?;
        let container_id: String = output.trim().chars().take(12).collect();
        if container_id.is_empty() {
            return Err(ProvisionError::Parse("docker run printed no container id".to_string()).into());
        }
        info!("started container {} from {}", container_id, image);

        with_cleanup(
            &format!("container {}", container_id),
            || self.installer.install(self.executor.as_ref(), &container_id, &os),
            || self.docker(["rm", "-f", container_id.as_str()]).map(drop),
        )?;

        let mut ssh = Mapping::new();
        ssh.insert("user".into(), "root".into());
        ssh.insert("password".into(), "root".into());
        ssh.insert("port".into(), Value::from(port));
        ssh.insert("host-key-check".into(), Value::Bool(false));
        ssh.insert("connect-timeout".into(), Value::from(120));

        let node = Node::new(format!("{}:{}", hostname, port))
            .with_name(container_id.as_str())
            .with_config(TargetConfig::new("ssh", ssh))
            .with_fact("provisioner", "docker")
            .with_fact("platform", image.as_str())
            .with_fact("os-release", os.to_value())
            .with_fact("container_id", container_id.as_str())
            .with_vars(request.vars.clone());

        inventory.add(&node, SSH_NODES)?.save()?;

        Ok(TaskOutcome::Provisioned {
            node_name: container_id,
            node,
        })
    }

    fn tear_down(&self, request: &TearDownRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let node = inventory.lookup(&Lookup::either(&request.node_name))?.clone();
        let container_id = node
            .fact_str("container_id")
            .unwrap_or_else(|| node.display_name().to_string());
        self.docker(["rm", "-f", container_id.as_str()])?;
        info!("removed container {}", container_id);
        remove_and_save(inventory, std::slice::from_ref(&node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let os = OsRelease::parse(
            "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\n# comment\n\nPRETTY_NAME='Ubuntu 22.04'\n",
        );
        assert_eq!(os.id(), "ubuntu");
        assert_eq!(os.version_id(), "22.04");
        assert_eq!(os.fields.get("PRETTY_NAME").map(String::as_str), Some("Ubuntu 22.04"));
    }

    #[test]
    fn test_os_release_from_image() {
        let os = OsRelease::from_image("litmusimage/centos:7");
        assert_eq!(os.id(), "litmusimage_centos");
        assert_eq!(os.version_id(), "7");
        assert_eq!(OsRelease::from_image("alpine").version_id(), "");
    }

    #[test]
    fn test_ssh_setup_commands_by_family() {
        let debian = OsRelease::parse("ID=debian\nVERSION_ID=\"12\"");
        let commands = ssh_setup_commands(&debian).unwrap();
        assert!(commands.iter().any(|c| c.starts_with("apt-get install")));
        assert_eq!(commands.last().map(String::as_str), Some("service ssh restart"));

        let centos = OsRelease::parse("ID=\"centos\"\nVERSION_ID=\"7\"");
        let commands = ssh_setup_commands(&centos).unwrap();
        assert!(commands.iter().any(|c| c.contains("pam_loginuid")));
        assert_eq!(commands.last().map(String::as_str), Some("/usr/sbin/sshd"));

        let alpine = OsRelease::parse("ID=alpine");
        assert!(matches!(ssh_setup_commands(&alpine), Err(ProvisionError::Validation(_))));
    }

    #[test]
    fn test_run_options_flatten_and_cgroup_defaults() {
        let vars: Value = serde_yaml::from_str("docker_run_opts:\n- [\"-e FOO=1\"]\n- --ulimit nofile=1024\n").unwrap();
        let args = run_options("litmusimage/ubuntu:22.04", Some(&vars));
        assert_eq!(
            args,
            vec![
                "-e",
                "FOO=1",
                "--ulimit",
                "nofile=1024",
                "--volume",
                "/sys/fs/cgroup:/sys/fs/cgroup:rw",
                "--cgroupns=host"
            ]
        );
        assert!(run_options("litmusimage/centos:7", None).is_empty());
    }

    #[test]
    fn test_endpoint_host() {
        assert_eq!(endpoint_host("tcp://10.0.0.5:2376").as_deref(), Some("10.0.0.5"));
        assert_eq!(endpoint_host("unix:///var/run/docker.sock"), None);
    }
}
