//! HTTP client abstraction for the service-backed provisioners.
//!
//! Backends build an [`HttpRequest`] and hand it to an [`HttpClient`]; every
//! status code comes back as an [`HttpResponse`] so the caller decides what
//! is fatal. Only transport failures (DNS, TLS, connection reset) are errors.

use std::time::Duration;

use anyhow::{Context, Result};
use strum::Display;
use tracing::{debug, warn};
use url::Url;

/// HTTP verbs used by the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Post,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = body.to_string();
        self.with_header("Content-Type", "application/json")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Sends HTTP requests on behalf of a backend.
pub trait HttpClient: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Blocking client backed by `ureq`.
///
/// Transport failures are retried up to `retry_attempts` extra times;
/// HTTP error statuses are returned as responses and never retried here.
#[derive(Debug, Clone)]
pub struct UreqClient {
    agent: ureq::Agent,
    retry_attempts: u32,
}

impl UreqClient {
    pub fn new(read_timeout: Duration, retry_attempts: u32) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(read_timeout)
            .build();
        Self {
            agent,
            retry_attempts,
        }
    }

    fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut call = self
            .agent
            .request_url(&request.method.to_string(), &request.url);
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }

        let response = match call.send_string(&request.body) {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                return Err(anyhow::Error::new(transport))
                    .with_context(|| format!("{} {} failed", request.method, request.url));
            }
        };

        let status = response.status();
        let body = response
            .into_string()
            .with_context(|| format!("failed to read response body from {}", request.url))?;
        Ok(HttpResponse { status, body })
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 0)
    }
}

impl HttpClient for UreqClient {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            debug!("{} {}", request.method, request.url);
            match self.send_once(request) {
                Ok(response) => {
                    debug!("{} {} -> {}", request.method, request.url, response.status);
                    return Ok(response);
                }
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!("transport error, retrying ({}/{}): {:#}", attempt, self.retry_attempts, e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
