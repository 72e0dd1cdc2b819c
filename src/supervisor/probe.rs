//! HTTP probes against the backend's health, configuration, agent, and documentation endpoints
//!
//! Every probe carries its own timeout and returns a [`ProbeOutcome`] instead of an error,
//! so callers decide between retrying and giving up.

use crate::error::{GateError, Result};
use crate::supervisor::discovery::{extract_api_base, normalize_prefix};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome<T> {
    Success(T),
    /// Worth trying again (or against another candidate)
    Retry(ProbeFailure),
    /// Polling will not fix this
    Fatal(String),
}

impl<T> ProbeOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProbeOutcome<U> {
        match self {
            ProbeOutcome::Success(v) => ProbeOutcome::Success(f(v)),
            ProbeOutcome::Retry(e) => ProbeOutcome::Retry(e),
            ProbeOutcome::Fatal(e) => ProbeOutcome::Fatal(e),
        }
    }
}

/// Why a probe should be retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub message: String,
    pub status: Option<u16>,
}

impl ProbeFailure {
    fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    fn status(url: &str, status: StatusCode) -> Self {
        Self {
            message: format!("{} returned {}", url, status),
            status: Some(status.as_u16()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Body of the liveness endpoint; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthBody {
    pub is_open_code_ready: Option<bool>,
}

/// Successful endpoint answer, with the prefix the final URL revealed (after redirects)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probed<T> {
    pub value: T,
    pub effective_prefix: Option<String>,
}

/// HTTP client used for all backend probes
#[derive(Debug, Clone)]
pub struct ProbeClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ProbeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| GateError::config(format!("Failed to build probe client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn url(port: u16, prefix: &str, path: &str) -> String {
        format!("http://127.0.0.1:{}{}{}", port, prefix, path)
    }

    async fn get(&self, url: &str) -> ProbeOutcome<reqwest::Response> {
        match self.client.get(url).send().await {
            Ok(response) => ProbeOutcome::Success(response),
            Err(e) if e.is_builder() => ProbeOutcome::Fatal(format!("invalid probe URL {}: {}", url, e)),
            Err(e) if e.is_timeout() => {
                ProbeOutcome::Retry(ProbeFailure::new(format!("{} timed out after {:?}", url, self.timeout)))
            }
            Err(e) => ProbeOutcome::Retry(ProbeFailure::new(format!("{} unreachable: {}", url, e))),
        }
    }

    /// Liveness: 2xx and not explicitly `isOpenCodeReady: false`
    pub async fn health(&self, port: u16, prefix: &str, path: &str) -> ProbeOutcome<Probed<()>> {
        let url = Self::url(port, prefix, path);
        let response = match self.get(&url).await {
            ProbeOutcome::Success(r) => r,
            ProbeOutcome::Retry(e) => return ProbeOutcome::Retry(e),
            ProbeOutcome::Fatal(e) => return ProbeOutcome::Fatal(e),
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Retry(ProbeFailure::status(&url, status));
        }
        let effective_prefix = prefix_from_response_path(response.url().path(), path);

        // A body that is not the expected JSON still proves the server is alive
        let body = match response.text().await {
            Ok(text) => serde_json::from_str::<HealthBody>(&text).unwrap_or_else(|e| {
                debug!("Health body from {} is not JSON ({}), treating as alive", url, e);
                HealthBody::default()
            }),
            Err(e) => {
                debug!("Could not read health body from {}: {}", url, e);
                HealthBody::default()
            }
        };

        match body.is_open_code_ready {
            Some(false) => ProbeOutcome::Retry(ProbeFailure::new(format!(
                "{} reports isOpenCodeReady=false",
                url
            ))),
            Some(true) | None => ProbeOutcome::Success(Probed {
                value: (),
                effective_prefix,
            }),
        }
    }

    /// Configuration-read endpoint: any 2xx is success; a 404 is kept distinct
    pub async fn config(&self, port: u16, prefix: &str, path: &str) -> ProbeOutcome<Probed<()>> {
        let url = Self::url(port, prefix, path);
        let response = match self.get(&url).await {
            ProbeOutcome::Success(r) => r,
            ProbeOutcome::Retry(e) => return ProbeOutcome::Retry(e),
            ProbeOutcome::Fatal(e) => return ProbeOutcome::Fatal(e),
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Retry(ProbeFailure::status(&url, status));
        }

        // An HTML page here means a SPA fallback answered, not the API
        if is_html(&response) {
            return ProbeOutcome::Retry(ProbeFailure {
                message: format!("{} returned HTML instead of configuration", url),
                status: Some(404),
            });
        }

        ProbeOutcome::Success(Probed {
            value: (),
            effective_prefix: prefix_from_response_path(response.url().path(), path),
        })
    }

    /// Agent-listing endpoint: must be a JSON array; returns the agent names
    pub async fn agents(&self, port: u16, prefix: &str, path: &str) -> ProbeOutcome<Probed<Vec<String>>> {
        let url = Self::url(port, prefix, path);
        let response = match self.get(&url).await {
            ProbeOutcome::Success(r) => r,
            ProbeOutcome::Retry(e) => return ProbeOutcome::Retry(e),
            ProbeOutcome::Fatal(e) => return ProbeOutcome::Fatal(e),
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Retry(ProbeFailure::status(&url, status));
        }
        let effective_prefix = prefix_from_response_path(response.url().path(), path);

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return ProbeOutcome::Retry(ProbeFailure::new(format!(
                    "{} returned invalid JSON: {}",
                    url, e
                )))
            }
        };

        match agent_names(&body) {
            Some(names) => ProbeOutcome::Success(Probed {
                value: names,
                effective_prefix,
            }),
            None => ProbeOutcome::Retry(ProbeFailure::new(format!(
                "{} did not return a JSON array",
                url
            ))),
        }
    }

    /// Documentation endpoint: extract the `__API_BASE__` marker, if any
    pub async fn doc_marker(&self, port: u16, root: &str, path: &str) -> ProbeOutcome<String> {
        let url = Self::url(port, root, path);
        let response = match self.get(&url).await {
            ProbeOutcome::Success(r) => r,
            ProbeOutcome::Retry(e) => return ProbeOutcome::Retry(e),
            ProbeOutcome::Fatal(e) => return ProbeOutcome::Fatal(e),
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Retry(ProbeFailure::status(&url, status));
        }

        match response.text().await {
            Ok(body) => match extract_api_base(&body) {
                Some(prefix) => ProbeOutcome::Success(prefix),
                None => ProbeOutcome::Retry(ProbeFailure::new(format!(
                    "{} has no __API_BASE__ marker",
                    url
                ))),
            },
            Err(e) => ProbeOutcome::Retry(ProbeFailure::new(format!("{} body unreadable: {}", url, e))),
        }
    }
}

fn is_html(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

/// Names from an agent listing; `None` unless the body is an array
pub fn agent_names(body: &serde_json::Value) -> Option<Vec<String>> {
    let items = body.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(name) => Some(name.clone()),
                serde_json::Value::Object(map) => map
                    .get("name")
                    .or_else(|| map.get("id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
    )
}

/// Prefix implied by the final response path, given the endpoint that was requested
pub fn prefix_from_response_path(response_path: &str, endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim_end_matches('/');
    let path = response_path.trim_end_matches('/');
    path.strip_suffix(endpoint).map(normalize_prefix)
}
