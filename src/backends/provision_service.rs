//! Provision service: a facade that provisions cloud VMs in one request.
//!
//! The reply to a provision request is an inventory fragment (`groups` of
//! `targets`) that is merged into the local inventory as-is. Every target of
//! one request carries the same `uuid` fact, which is what tear-down sends
//! back to release the whole allocation.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use serde_yaml::Value;
use tracing::{info, warn};
use url::Url;

use super::{Provisioner, decode_options, remove_and_save};
use crate::config::{env_var, var_str};
use crate::error::ProvisionError;
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::inventory::{Inventory, Lookup};
use crate::task::{ProvisionRequest, TaskOutcome, TearDownRequest};

pub const DEFAULT_SERVICE_URL: &str = "https://facade-release-6f3kfepqcq-ew.a.run.app/v1/provision";

/// Attempts made when the service answers `200` with an empty payload.
pub const PAYLOAD_ATTEMPTS: u32 = 3;

/// Extra sends after a transport failure unless the request sets `retry_attempts`.
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionServiceSettings {
    pub url: Url,
    /// CI job URL identifying the caller; the GitHub token is sent instead when absent.
    pub job_url: Option<String>,
    pub github_token: Option<String>,
    pub cloud: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub transport_retries: u32,
}

impl ProvisionServiceSettings {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            job_url: None,
            github_token: None,
            cloud: None,
            region: None,
            zone: None,
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
        }
    }

    pub fn from_env() -> Result<Self, ProvisionError> {
        let raw = env_var("SERVICE_URL").unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string());
        let url = Url::parse(&raw)
            .map_err(|e| ProvisionError::Config(format!("invalid SERVICE_URL {}: {}", raw, e)))?;

        let mut settings = Self::new(url);
        settings.job_url = env_var("GITHUB_RUN_ID").map(|run_id| {
            env_var("GITHUB_URL").unwrap_or_else(|| {
                format!(
                    "https://api.github.com/repos/{}/actions/runs/{}",
                    env_var("GITHUB_REPOSITORY").unwrap_or_default(),
                    run_id
                )
            })
        });
        settings.github_token = env_var("GITHUB_TOKEN");
        settings.cloud = env_var("CLOUD");
        settings.region = env_var("REGION");
        settings.zone = env_var("ZONE");
        Ok(settings)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServiceOptions {
    /// Transport retries of each HTTP exchange.
    #[serde(default)]
    retry_attempts: Option<u32>,
}

impl ServiceOptions {
    fn transport_retries(&self, settings: &ProvisionServiceSettings) -> u32 {
        self.retry_attempts.unwrap_or(settings.transport_retries)
    }
}

#[derive(Debug, Deserialize)]
struct Fragment {
    #[serde(default)]
    groups: Vec<FragmentGroup>,
}

#[derive(Debug, Deserialize)]
struct FragmentGroup {
    name: String,
    #[serde(default)]
    targets: Vec<Value>,
}

fn service_error(reply: &HttpResponse) -> ProvisionError {
    ProvisionError::BackendRequest {
        status: Some(reply.status),
        message: "provision service returned an error".to_string(),
        body: Some(reply.body.clone()),
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Mapping(m) => m.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

pub struct ProvisionServiceProvisioner {
    settings: ProvisionServiceSettings,
    http: Arc<dyn HttpClient>,
}

impl ProvisionServiceProvisioner {
    pub fn new(settings: ProvisionServiceSettings, http: Arc<dyn HttpClient>) -> Self {
        Self { settings, http }
    }

    fn base_request(&self, method: Method) -> HttpRequest {
        HttpRequest::new(method, self.settings.url.clone()).with_header("Accept", "application/json")
    }

    /// Sends `request`, repeating it up to `retries` more times while the
    /// transport fails. Any HTTP status counts as an answer.
    fn send(&self, request: &HttpRequest, retries: u32) -> Result<HttpResponse> {
        let mut retried = 0;
        loop {
            match self.http.send(request) {
                Ok(reply) => return Ok(reply),
                Err(e) if retried < retries => {
                    retried += 1;
                    warn!("provision service unreachable, resending ({}/{}): {:#}", retried, retries, e);
                }
                Err(e) => return Err(e.context("failed to reach the provision service")),
            }
        }
    }

    /// Posts the request and decodes the reply.
    ///
    /// A non-200 status is fatal. Exhausted transport retries and empty
    /// payloads come back as retryable errors.
    fn request_once(&self, request: &HttpRequest, retries: u32) -> Result<Result<Value, anyhow::Error>> {
        let reply = match self.send(request, retries) {
            Ok(reply) => reply,
            Err(e) => return Ok(Err(e)),
        };
        if reply.status != 200 {
            return Err(service_error(&reply).into());
        }
        let payload: Value = match serde_yaml::from_str(&reply.body) {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(Err(ProvisionError::Parse(format!(
                    "unexpected provision service payload: {}",
                    e
                ))
                .into()));
            }
        };
        if is_empty_payload(&payload) {
            return Ok(Err(ProvisionError::Parse(
                "provision service returned an empty payload".to_string(),
            )
            .into()));
        }
        Ok(Ok(payload))
    }
}

impl Provisioner for ProvisionServiceProvisioner {
    fn name(&self) -> &'static str {
        "provision_service"
    }

    fn provision(&self, request: &ProvisionRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let options: ServiceOptions = decode_options(&request.options)?;
        let retries = options.transport_retries(&self.settings);

        let vms = vec![request.platform.to_cloud_request(
            self.settings.cloud.as_deref(),
            self.settings.region.as_deref(),
            self.settings.zone.as_deref(),
        )];
        let job_url = self
            .settings
            .job_url
            .as_deref()
            .or_else(|| var_str(request.vars.as_ref(), "job_url"));
        let body = match job_url {
            Some(url) => json!({ "url": url, "VMs": vms }),
            None => {
                info!("no CI job url found, authenticating with GITHUB_TOKEN");
                json!({ "github_token": self.settings.github_token, "VMs": vms })
            }
        };
        let http_request = self.base_request(Method::Post).with_json(&body);

        let mut attempt = 1;
        let payload = loop {
            match self.request_once(&http_request, retries)? {
                Ok(payload) => break payload,
                Err(e) if attempt < PAYLOAD_ATTEMPTS => {
                    warn!("provisioning failed, retrying {} of {}: {:#}", attempt, PAYLOAD_ATTEMPTS, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let fragment: Fragment = serde_yaml::from_value(payload)
            .map_err(|e| ProvisionError::Parse(format!("unexpected provision service payload: {}", e)))?;

        let mut target_names: Vec<String> = Vec::new();
        for group in fragment.groups {
            for mut target in group.targets {
                if let (Some(vars), Value::Mapping(map)) = (&request.vars, &mut target) {
                    map.insert(Value::from("vars"), vars.clone());
                }
                if let Some(uri) = target.get("uri").and_then(Value::as_str)
                    && !target_names.iter().any(|n| n == uri)
                {
                    target_names.push(uri.to_string());
                }
                inventory.add(&target, &group.name)?;
            }
        }
        inventory.save()?;
        info!("registered {} target(s) from the provision service", target_names.len());

        Ok(TaskOutcome::Registered {
            node_name: request.platform.clone(),
            target_names,
        })
    }

    fn tear_down(&self, request: &TearDownRequest, inventory: &mut Inventory) -> Result<TaskOutcome> {
        let node = inventory.lookup(&Lookup::either(&request.node_name))?.clone();
        let uuid = node.fact_str("uuid").ok_or_else(|| {
            ProvisionError::Validation(format!("target {} has no uuid fact", request.node_name))
        })?;
        let targets = inventory.correlated("uuid", &uuid);

        info!("releasing allocation {} ({} target(s))", uuid, targets.len());
        let http_request = self
            .base_request(Method::Delete)
            .with_json(&json!({ "uuid": uuid }));
        let options: ServiceOptions = decode_options(&request.options)?;
        let reply = self.send(&http_request, options.transport_retries(&self.settings))?;
        if reply.status != 200 {
            return Err(service_error(&reply).into());
        }

        remove_and_save(inventory, &targets)
    }
}
