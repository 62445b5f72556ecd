mod helpers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helpers::{MockExecutor, reload, temp_inventory};
use rsprovision::backends::{LxdProvisioner, LxdSettings, Provisioner};
use rsprovision::error::ProvisionError;
use rsprovision::executor::ExecutionResult;
use rsprovision::inventory::{Inventory, LXD_NODES};
use rsprovision::protocol::{ExponentialBackoff, ManualClock};
use rsprovision::task::{ProvisionRequest, TaskOutcome, TearDownRequest, provision_error};
use serde_json::Map;

const CREATE_OUTPUT: &str = "Creating the instance\nInstance name is: sunny-kit\n";

fn provisioner(executor: &Arc<MockExecutor>, clock: &Arc<ManualClock>) -> LxdProvisioner {
    let settings = LxdSettings {
        defaults: Map::new(),
        probe: ExponentialBackoff::default(),
    };
    LxdProvisioner::new(settings, executor.clone(), clock.clone())
}

fn base_executor() -> MockExecutor {
    MockExecutor::new()
        .on("lxc -q remote get-default", ExecutionResult::ok("local\n"))
        .on("lxc -q create", ExecutionResult::ok(CREATE_OUTPUT))
        .on("lxc -q config show", ExecutionResult::ok("config:\n  image.os: Ubuntu\n"))
}

#[test]
fn provision_registers_container_in_lxd_nodes() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(base_executor());
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let request = ProvisionRequest::new("images:ubuntu/22.04")
        .with_option("profiles", serde_json::json!(["default", "ci"]))
        .with_option("_task", "internal");
    let outcome = provisioner(&executor, &clock).provision(&request, &mut inventory)?;

    let TaskOutcome::Provisioned { node_name, node } = outcome else {
        panic!("expected a provisioned outcome");
    };
    assert_eq!(node_name, "sunny-kit");
    assert_eq!(node.config.transport.as_deref(), Some("lxd"));
    assert_eq!(node.config.setting_str("remote"), Some("local"));
    assert_eq!(node.config.setting_str("shell-command"), Some("sh -lc"));
    assert_eq!(node.fact_str("platform").as_deref(), Some("images:ubuntu/22.04"));
    assert!(node.fact("lxd_profiles").is_some());
    assert!(node.fact("lxd__task").is_none());

    assert_eq!(
        executor.calls(),
        vec![
            "lxc -q remote get-default",
            "lxc -q create images:ubuntu/22.04 local: --profile default --profile ci",
            "lxc -q config show local:sunny-kit -e",
            "lxc -q start local:sunny-kit",
            "lxc -q exec local:sunny-kit uptime",
        ]
    );
    assert!(clock.sleeps().is_empty());

    let saved = reload(&path)?;
    assert_eq!(saved.group(LXD_NODES).map(|g| g.targets.len()), Some(1));
    Ok(())
}

#[test]
fn cdrom_agent_requirement_adds_agent_device() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(
        MockExecutor::new()
            .on("lxc -q create", ExecutionResult::ok(CREATE_OUTPUT))
            .on(
                "lxc -q config show",
                ExecutionResult::ok("config:\n  image.requirements.cdrom_agent: \"true\"\n"),
            ),
    );
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let request = ProvisionRequest::new("images:windows").with_option("remote", "fake");
    provisioner(&executor, &clock).provision(&request, &mut inventory)?;

    assert_eq!(executor.count("lxc -q config device add fake:sunny-kit agent disk source=agent:config"), 1);
    assert_eq!(executor.count("lxc -q remote get-default"), 0);
    Ok(())
}

#[test]
fn zero_retries_accepts_failed_liveness_probe() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(
        base_executor().on("lxc -q exec", ExecutionResult::failed(1, "Error: VM agent isn't currently running")),
    );
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let request = ProvisionRequest::new("images:ubuntu/22.04").with_option("retries", 0);
    let outcome = provisioner(&executor, &clock).provision(&request, &mut inventory)?;

    assert!(matches!(outcome, TaskOutcome::Provisioned { .. }));
    assert_eq!(executor.count("lxc -q exec"), 1);
    assert_eq!(executor.count("lxc -q delete"), 0);
    assert!(clock.sleeps().is_empty());
    assert_eq!(reload(&path)?.group(LXD_NODES).map(|g| g.targets.len()), Some(1));
    Ok(())
}

#[test]
fn exhausted_retries_delete_instance_before_failing() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(base_executor().on("lxc -q exec", ExecutionResult::failed(1, "not ready")));
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let request = ProvisionRequest::new("images:ubuntu/22.04").with_option("retries", 1);
    let err = provisioner(&executor, &clock)
        .provision(&request, &mut inventory)
        .unwrap_err();

    assert!(matches!(provision_error(&err), Some(ProvisionError::Timeout(_))));
    let calls = executor.calls();
    assert_eq!(calls.last().map(String::as_str), Some("lxc -q delete local:sunny-kit -f"));
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    assert!(!path.exists(), "nothing should have been saved");
    Ok(())
}

#[test]
fn failed_config_inspection_deletes_created_instance() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(
        MockExecutor::new()
            .on("lxc -q remote get-default", ExecutionResult::ok("local\n"))
            .on("lxc -q create", ExecutionResult::ok(CREATE_OUTPUT))
            .on("lxc -q config show", ExecutionResult::failed(1, "Error: instance not found")),
    );
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let err = provisioner(&executor, &clock)
        .provision(&ProvisionRequest::new("images:ubuntu/22.04"), &mut inventory)
        .unwrap_err();

    assert!(matches!(provision_error(&err), Some(ProvisionError::Command { .. })));
    assert_eq!(
        executor.calls(),
        vec![
            "lxc -q remote get-default",
            "lxc -q create images:ubuntu/22.04 local:",
            "lxc -q config show local:sunny-kit -e",
            "lxc -q delete local:sunny-kit -f",
        ]
    );
    assert_eq!(executor.count("lxc -q start"), 0);
    assert!(!path.exists());
    Ok(())
}

#[test]
fn unreadable_instance_configuration_deletes_created_instance() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(
        MockExecutor::new()
            .on("lxc -q create", ExecutionResult::ok(CREATE_OUTPUT))
            .on("lxc -q config show", ExecutionResult::ok("config: [unclosed")),
    );
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let request = ProvisionRequest::new("images:ubuntu/22.04").with_option("remote", "fake");
    let err = provisioner(&executor, &clock)
        .provision(&request, &mut inventory)
        .unwrap_err();

    assert!(matches!(provision_error(&err), Some(ProvisionError::Parse(_))));
    assert_eq!(executor.count("lxc -q delete fake:sunny-kit -f"), 1);
    Ok(())
}

#[test]
fn probe_recovering_after_failures_sleeps_exponentially() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(base_executor().on_each(
        "lxc -q exec",
        [
            ExecutionResult::failed(1, "not ready"),
            ExecutionResult::failed(1, "not ready"),
            ExecutionResult::ok(" 10:00:00 up 1 min"),
        ],
    ));
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let request = ProvisionRequest::new("images:ubuntu/22.04").with_option("retries", 3);
    provisioner(&executor, &clock).provision(&request, &mut inventory)?;

    assert_eq!(clock.total_slept(), Duration::from_secs(2 + 4));
    assert_eq!(executor.count("lxc -q delete"), 0);
    Ok(())
}

#[test]
fn env_defaults_fill_missing_options() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(base_executor());
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;

    let settings = temp_env::with_vars(
        [("LXD_REMOTE", Some("fake")), ("LXD_VM", Some("true")), ("LXD_PROFILES", None)],
        LxdSettings::from_env,
    )?;
    let lxd = LxdProvisioner::new(settings, executor.clone(), clock.clone());
    let request = ProvisionRequest::new("images:debian/12").with_option("remote", "");
    let TaskOutcome::Provisioned { node, .. } = lxd.provision(&request, &mut inventory)? else {
        panic!("expected a provisioned outcome");
    };

    assert_eq!(executor.count("lxc -q create images:debian/12 fake: --vm"), 1);
    assert_eq!(node.fact_str("lxd_vm").as_deref(), Some("true"));
    assert_eq!(node.fact_str("lxd_remote").as_deref(), Some("fake"));
    Ok(())
}

#[test]
fn tear_down_deletes_instance_and_removes_node() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(base_executor());
    let clock = Arc::new(ManualClock::new());
    let lxd = provisioner(&executor, &clock);

    let mut inventory = Inventory::load(&path)?;
    lxd.provision(&ProvisionRequest::new("images:ubuntu/22.04"), &mut inventory)?;

    let mut inventory = reload(&path)?;
    let outcome = lxd.tear_down(&TearDownRequest::new("sunny-kit"), &mut inventory)?;

    assert_eq!(
        outcome,
        TaskOutcome::Removed {
            removed: vec!["sunny-kit".to_string()]
        }
    );
    assert_eq!(executor.count("lxc -q delete local:sunny-kit -f"), 1);
    assert_eq!(reload(&path)?.group(LXD_NODES).map(|g| g.targets.len()), Some(0));
    Ok(())
}

#[test]
fn tear_down_only_looks_in_lxd_nodes() -> Result<()> {
    let (_dir, path) = temp_inventory()?;
    let executor = Arc::new(MockExecutor::new());
    let clock = Arc::new(ManualClock::new());
    let mut inventory = Inventory::load(&path)?;
    inventory.add(&rsprovision::inventory::Node::new("sunny-kit"), "ssh_nodes")?;

    let err = provisioner(&executor, &clock)
        .tear_down(&TearDownRequest::new("sunny-kit"), &mut inventory)
        .unwrap_err();

    assert!(matches!(provision_error(&err), Some(ProvisionError::NotFound(_))));
    assert!(executor.calls().is_empty());
    Ok(())
}
