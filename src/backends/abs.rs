//! ABS: VM allocation from a pooled allocation service.
//!
//! A request is accepted with `202`, then re-posted as a status poll on a
//! linear ramp until the service answers `200` with a non-empty host list.
//! All hosts of one request share a job id, and tearing down any of them
//! returns the whole job in a single call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};
use url::Url;

use super::{Provisioner, remove_and_save};
use crate::config::{env_is, env_parse, env_var, login_user, token_from_fogfile};
use crate::error::ProvisionError;
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::inventory::{Inventory, Lookup, Node, SSH_NODES, TargetConfig, WINRM_NODES};
use crate::platform::uses_ssh;
use crate::protocol::{Clock, LinearBackoff, Poll};
use crate::task::{ProvisionRequest, TaskOutcome, TearDownRequest};

const DEFAULT_SUBDOMAIN: &str = "abs-prod";
const DOMAIN: &str = "k8s.infracore.puppet.net";
const MANUAL_BUILD_URL: &str = "https://litmus_manual";

/// Settings of the ABS backend.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsSettings {
    /// Host name of the service, without scheme.
    pub host: String,
    /// Auth token; read from `~/.fog` when `None`.
    pub token: Option<String>,
    pub poll: LinearBackoff,
    pub priority: u32,
    pub user: String,
    pub build_url: String,
    pub ssh_user: Option<String>,
    pub ssh_private_key: Option<String>,
    pub password: Option<String>,
    pub win_user: Option<String>,
}

impl AbsSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            token: None,
            poll: LinearBackoff::default(),
            priority: 2,
            user: login_user(),
            build_url: MANUAL_BUILD_URL.to_string(),
            ssh_user: None,
            ssh_private_key: None,
            password: None,
            win_user: None,
        }
    }

    pub fn from_env() -> Result<Self, ProvisionError> {
        let subdomain = env_var("ABS_SUBDOMAIN").unwrap_or_else(|| DEFAULT_SUBDOMAIN.to_string());
        let mut settings = Self::new(format!("{}.{}", subdomain, DOMAIN));
        if let Some(secs) = env_parse::<u64>("POLL_ABS_TIMEOUT_SECONDS")? {
            settings.poll = LinearBackoff::with_timeout(Duration::from_secs(secs));
        }
        settings.priority = if env_var("CI").is_some() { 1 } else { 2 };
        settings.build_url = build_url_from_env();
        settings.ssh_user = env_var("ABS_USER");
        settings.ssh_private_key = env_var("ABS_SSH_PRIVATE_KEY");
        settings.password = env_var("ABS_PASSWORD");
        settings.win_user = env_var("ABS_WIN_USER");
        Ok(settings)
    }

    fn auth_token(&self) -> Result<String, ProvisionError> {
        match &self.token {
            Some(token) => Ok(token.clone()),
            None => token_from_fogfile("abs"),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProvisionError> {
        let raw = format!("https://{}{}", self.host, path);
        Url::parse(&raw).map_err(|e| ProvisionError::Config(format!("invalid ABS url {}: {}", raw, e)))
    }
}

/// CI job URL recorded in the job tags.
fn build_url_from_env() -> String {
    if env_is("CI", "true") && env_is("TRAVIS", "true") {
        env_var("TRAVIS_JOB_WEB_URL").unwrap_or_default()
    } else if env_is("CI", "True") && env_is("APPVEYOR", "True") {
        format!(
            "https://ci.appveyor.com/project/{}/build/job/{}",
            env_var("APPVEYOR_REPO_NAME").unwrap_or_default(),
            env_var("APPVEYOR_JOB_ID").unwrap_or_default()
        )
    } else if env_is("GITHUB_ACTIONS", "true") {
        format!(
            "https://github.com/{}/actions/runs/{}",
            env_var("GITHUB_REPOSITORY").unwrap_or_default(),
            env_var("GITHUB_RUN_ID").unwrap_or_default()
        )
    } else {
        MANUAL_BUILD_URL.to_string()
    }
}

/// One allocated host in the `200` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AllocatedHost {
    pub hostname: String,
    #[serde(rename = "type")]
    pub platform: String,
}

fn optional(value: Option<&str>) -> Value {
    value.map_or(Value::Null, Value::from)
}

fn service_error(reply: &HttpResponse, message: impl Into<String>) -> ProvisionError {
    ProvisionError::BackendRequest {
        status: Some(reply.status),
        message: message.into(),
        body: Some(reply.body.clone()),
    }
}

pub struct AbsProvisioner {
    settings: AbsSettings,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
}

impl AbsProvisioner {
    pub fn new(settings: AbsSettings, http: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            http,
            clock,
        }
    }

    fn job_id() -> String {
        format!(
            "iac-task-pid-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        )
    }

    fn request_payload(&self, request: &ProvisionRequest, job_id: &str) -> serde_json::Value {
        json!({
            "resources": request.platform.resource_counts(),
            "priority": self.settings.priority,
            "job": {
                "id": job_id,
                "tags": {
                    "user": self.settings.user,
                    "jenkins_build_url": self.settings.build_url,
                },
            },
        })
    }

    /// Builds the inventory node for an allocated host and returns it with its group.
    fn host_node(
        &self,
        host: &AllocatedHost,
        job_id: &str,
        vars: Option<&Value>,
    ) -> (Node, &'static str) {
        let mut settings = Mapping::new();
        let (transport, group) = if uses_ssh(&host.platform) {
            settings.insert("user".into(), optional(self.settings.ssh_user.as_deref()));
            settings.insert("host-key-check".into(), Value::Bool(false));
            settings.insert("connect-timeout".into(), Value::from(120));
            match &self.settings.ssh_private_key {
                Some(key) => settings.insert("private-key".into(), Value::from(key.as_str())),
                None => settings.insert("password".into(), optional(self.settings.password.as_deref())),
            };
            ("ssh", SSH_NODES)
        } else {
            settings.insert("user".into(), optional(self.settings.win_user.as_deref()));
            settings.insert("password".into(), optional(self.settings.password.as_deref()));
            settings.insert("ssl".into(), Value::Bool(false));
            settings.insert("connect-timeout".into(), Value::from(120));
            ("winrm", WINRM_NODES)
        };

        let node = Node::new(host.hostname.as_str())
            .with_config(TargetConfig::new(transport, settings))
            .with_fact("provisioner", "abs")
            .with_fact("platform", host.platform.as_str())
            .with_fact("job_id", job_id)
            .with_vars(vars.cloned());
        (node, group)
    }
}

impl Provisioner for AbsProvisioner {
    fn name(&self) -> &'static str {
        "abs"
    }

    fn provision(&self, request: &ProvisionRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let token = self.settings.auth_token()?;
        let job_id = Self::job_id();
        let http_request = HttpRequest::new(Method::Post, self.settings.endpoint("/api/v2/request")?)
            .with_header("X-AUTH-TOKEN", token)
            .with_json(&self.request_payload(request, &job_id));

        info!("requesting {} from ABS as job {}", request.platform, job_id);
        let reply = self.http.send(&http_request).context("failed to send ABS request")?;
        if reply.status != 202 {
            return Err(service_error(
                &reply,
                format!("ABS did not accept the request: HTTP {}", reply.status),
            )
            .into());
        }

        let hosts = self.settings.poll.poll(self.clock.as_ref(), |attempt| {
            let reply = self
                .http
                .send(&http_request)
                .with_context(|| format!("failed to poll ABS (attempt {})", attempt))?;
            match reply.status {
                200 => {
                    let hosts: Vec<AllocatedHost> = serde_json::from_str(&reply.body)
                        .map_err(|e| ProvisionError::Parse(format!("unexpected ABS payload: {}", e)))?;
                    if hosts.is_empty() {
                        debug!("ABS answered 200 without hosts, polling again");
                        Ok(Poll::Pending)
                    } else {
                        Ok(Poll::Ready(hosts))
                    }
                }
                404 => Err(service_error(&reply, "ABS API error: received a HTTP 404 response").into()),
                _ => Ok(Poll::Pending),
            }
        })?;

        for host in &hosts {
            let (node, group) = self.host_node(host, &job_id, request.vars.as_ref());
            inventory.add(&node, group)?;
        }
        inventory.save()?;
        info!("registered {} ABS host(s) for job {}", hosts.len(), job_id);

        Ok(TaskOutcome::Allocated { nodes: hosts.len() })
    }

    fn tear_down(&self, request: &TearDownRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let node = inventory.lookup(&Lookup::either(&request.node_name))?.clone();
        let job_id = node.fact_str("job_id").ok_or_else(|| {
            ProvisionError::Validation(format!("target {} has no job_id fact", request.node_name))
        })?;
        let targets = inventory.correlated("job_id", &job_id);

        let hosts: Vec<_> = targets
            .iter()
            .map(|t| {
                json!({
                    "hostname": t.uri,
                    "type": t.fact_str("platform"),
                    "engine": "vmpooler",
                })
            })
            .collect();
        let http_request = HttpRequest::new(Method::Post, self.settings.endpoint("/api/v2/return")?)
            .with_header("X-AUTH-TOKEN", self.settings.auth_token()?)
            .with_json(&json!({ "job_id": job_id, "hosts": hosts }));

        info!("returning {} host(s) of job {} to ABS", targets.len(), job_id);
        let reply = self.http.send(&http_request).context("failed to send ABS return request")?;
        if reply.status != 200 {
            return Err(service_error(
                &reply,
                format!("ABS refused to return job {}: HTTP {}", job_id, reply.status),
            )
            .into());
        }

        remove_and_save(inventory, &targets)
    }
}
