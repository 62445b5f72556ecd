mod helpers;

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;
use helpers::{MockExecutor, reload, temp_inventory};
use rsprovision::backends::{Provisioner, VagrantProvisioner, VagrantSettings};
use rsprovision::error::ProvisionError;
use rsprovision::executor::{CommandSpec, ExecutionResult};
use rsprovision::inventory::{Inventory, SSH_NODES, WINRM_NODES};
use rsprovision::task::{ProvisionRequest, TaskOutcome, TearDownRequest, provision_error};

const SSH_CONFIG: &str = "Host default\n  HostName 127.0.0.1\n  User vagrant\n  Port 2222\n  UserKnownHostsFile /dev/null\n  StrictHostKeyChecking no\n  IdentityFile /home/ci/.vagrant.d/insecure_private_key\n";
const WINRM_CONFIG: &str = "Host default\n  HostName 127.0.0.1\n  User vagrant\n  Password vagrant\n  Port 55985\n  RDPPort 3389\n";

/// Simulates `vagrant up` by writing the machine id where vagrant keeps it.
fn write_machine_id(provider: &'static str) -> impl Fn(&CommandSpec) + Send + Sync + 'static {
    move |spec: &CommandSpec| {
        let cwd = spec.cwd.clone().expect("vagrant runs inside its environment");
        let dir = cwd.join(".vagrant/machines/default").join(provider);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index_uuid"), "5f3c0e9a\n").unwrap();
    }
}

fn vagrant(executor: &Arc<MockExecutor>) -> VagrantProvisioner {
    VagrantProvisioner::new(VagrantSettings::default(), executor.clone())
}

fn linux_executor() -> MockExecutor {
    MockExecutor::new()
        .on_with("vagrant up", ExecutionResult::ok(""), write_machine_id("virtualbox"))
        .on("vagrant ssh-config", ExecutionResult::ok(SSH_CONFIG))
}

#[test]
fn provision_boots_machine_and_prepares_root_access() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(linux_executor());
    let mut inventory = Inventory::load(&path)?;

    let request = ProvisionRequest::new("generic/ubuntu2004").with_option("cpus", 2);
    let TaskOutcome::Provisioned { node_name, node } = vagrant(&executor).provision(&request, &mut inventory)? else {
        panic!("expected a provisioned outcome");
    };

    assert_eq!(node_name, "127.0.0.1:2222");
    assert_eq!(node.config.transport.as_deref(), Some("ssh"));
    assert_eq!(node.config.setting_str("user"), Some("vagrant"));
    assert_eq!(node.config.setting_str("run-as"), Some("root"));
    assert_eq!(
        node.config.setting_str("private-key"),
        Some("/home/ci/.vagrant.d/insecure_private_key")
    );
    assert_eq!(node.fact_str("id").as_deref(), Some("5f3c0e9a"));

    let env = Utf8PathBuf::from(node.fact_str("vagrant_env").expect("vagrant_env fact"));
    assert_eq!(env.file_name(), Some("generic-ubuntu2004-0"));
    let vagrantfile = fs::read_to_string(env.join("Vagrantfile"))?;
    assert!(vagrantfile.contains("config.vm.box = 'generic/ubuntu2004'"));
    assert!(vagrantfile.contains("config.vm.provider \"virtualbox\" do |v|\n    v.cpus = 2\n  end"));
    assert_eq!(fs::read_to_string(env.join("ssh-config"))?, SSH_CONFIG);

    let calls = executor.calls();
    assert_eq!(calls[0], "vagrant up --provider virtualbox");
    assert_eq!(calls[1], "vagrant ssh-config");
    assert_eq!(executor.count("ssh "), 3);
    let last_ssh = executor.specs().pop().expect("ssh call");
    assert_eq!(last_ssh.args.last().map(String::as_str), Some(r#"sudo su -c "service ssh restart""#));
    assert!(last_ssh.args.contains(&"vagrant@127.0.0.1".to_string()));
    assert_eq!(executor.specs()[0].cwd.as_deref(), Some(env.as_path()));

    let saved = reload(&path)?;
    assert_eq!(saved.group(SSH_NODES).map(|g| g.targets.len()), Some(1));
    Ok(())
}

#[test]
fn windows_boxes_use_winrm_and_check_the_vagrant_version() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(
        MockExecutor::new()
            .on("vagrant --version", ExecutionResult::ok("Vagrant 2.3.7\n"))
            .on_with("vagrant up", ExecutionResult::ok(""), write_machine_id("virtualbox"))
            .on("vagrant winrm-config", ExecutionResult::ok(WINRM_CONFIG)),
    );
    let mut inventory = Inventory::load(&path)?;

    let TaskOutcome::Provisioned { node, .. } =
        vagrant(&executor).provision(&ProvisionRequest::new("gusztavvargadr/windows-server"), &mut inventory)?
    else {
        panic!("expected a provisioned outcome");
    };

    assert_eq!(node.uri, "127.0.0.1:55985");
    assert_eq!(node.config.transport.as_deref(), Some("winrm"));
    assert_eq!(node.config.setting_str("password"), Some("vagrant"));
    assert_eq!(executor.count("ssh "), 0);
    assert_eq!(reload(&path)?.group(WINRM_NODES).map(|g| g.targets.len()), Some(1));
    Ok(())
}

#[test]
fn old_vagrant_cannot_provision_windows() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(MockExecutor::new().on("vagrant --version", ExecutionResult::ok("Vagrant 2.1.5\n")));
    let mut inventory = Inventory::load(&path)?;

    let err = vagrant(&executor)
        .provision(&ProvisionRequest::new("gusztavvargadr/windows-server"), &mut inventory)
        .unwrap_err();

    assert!(matches!(provision_error(&err), Some(ProvisionError::Config(_))));
    assert_eq!(executor.calls(), vec!["vagrant --version"]);
    Ok(())
}

#[test]
fn unsupported_platform_is_rejected_before_boot() -> Result<()> {
    let (dir, path) = temp_inventory()?;
    let executor = Arc::new(linux_executor());
    let mut inventory = Inventory::load(&path)?;

    let err = vagrant(&executor)
        .provision(&ProvisionRequest::new("generic/alpine318"), &mut inventory)
        .unwrap_err();

    assert!(matches!(provision_error(&err), Some(ProvisionError::Validation(_))));
    assert!(executor.calls().is_empty());
    assert!(!dir.path().join(".vagrant").exists());
    Ok(())
}

#[test]
fn failed_boot_destroys_the_environment() -> Result<()> {
    let (dir, path) = temp_inventory()?;
    let executor = Arc::new(MockExecutor::new().on("vagrant up", ExecutionResult::failed(1, "VBoxManage error")));
    let mut inventory = Inventory::load(&path)?;

    let err = vagrant(&executor)
        .provision(&ProvisionRequest::new("generic/debian10"), &mut inventory)
        .unwrap_err();

    assert!(matches!(provision_error(&err), Some(ProvisionError::Command { .. })));
    assert_eq!(
        executor.calls(),
        vec!["vagrant up --provider virtualbox", "vagrant destroy -f"]
    );
    let leftovers: Vec<_> = fs::read_dir(dir.path().join(".vagrant"))?.collect();
    assert!(leftovers.is_empty(), "environment directory should be removed");
    assert!(!path.exists());
    Ok(())
}

#[test]
fn tear_down_destroys_machine_and_environment() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(linux_executor());
    let provisioner = vagrant(&executor);
    let mut inventory = Inventory::load(&path)?;
    let TaskOutcome::Provisioned { node, .. } =
        provisioner.provision(&ProvisionRequest::new("centos/7"), &mut inventory)?
    else {
        panic!("expected a provisioned outcome");
    };
    let env = Utf8PathBuf::from(node.fact_str("vagrant_env").expect("vagrant_env fact"));

    let mut inventory = reload(&path)?;
    let outcome = provisioner.tear_down(&TearDownRequest::new("127.0.0.1:2222"), &mut inventory)?;

    assert_eq!(
        outcome,
        TaskOutcome::Removed {
            removed: vec!["127.0.0.1:2222".to_string()]
        }
    );
    let destroy = executor.specs().pop().expect("destroy call");
    assert_eq!(destroy.command_line(), "vagrant destroy -f");
    assert_eq!(destroy.cwd.as_deref(), Some(env.as_path()));
    assert!(!env.exists());
    assert_eq!(reload(&path)?.targets().count(), 0);
    Ok(())
}
