//! HTTP client for the image factory and the release feed.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use url::Url;

use super::{ArtifactStream, ImageFactory, ReleaseSource, SchematicId};
use crate::config::FactoryConfig;
use crate::error::ProvisionError;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
/// Bytes of an error body quoted in messages.
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
struct SchematicResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

/// Maps a transport error, flagging connection problems and timeouts as retryable.
fn transport_error(action: &str, url: &str, err: reqwest::Error) -> ProvisionError {
    ProvisionError::Fetch {
        message: format!("{} {}: {}", action, url, err),
        retryable: err.is_timeout() || err.is_connect() || err.is_body(),
    }
}

/// Fails on any non-2xx status, quoting the start of the body.
fn ensure_success(action: &str, url: &str, response: Response) -> Result<Response, ProvisionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let snippet: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
    Err(ProvisionError::fetch(format!(
        "{} {} returned HTTP {}: {}",
        action, url, status, snippet
    )))
}

/// Blocking HTTP client for the image factory API.
pub struct FactoryClient {
    base: Url,
    releases: Url,
    api: Client,
    download: Client,
}

impl FactoryClient {
    pub fn new(config: &FactoryConfig) -> Result<Self, ProvisionError> {
        let parse = |label: &str, value: &str| {
            Url::parse(value)
                .map_err(|e| ProvisionError::Config(format!("invalid {} '{}': {}", label, value, e)))
        };
        let build = |timeout: Duration| {
            Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(Duration::from_secs(config.timeout_secs))
                .timeout(timeout)
                .build()
                .map_err(|e| ProvisionError::Config(format!("failed to build HTTP client: {}", e)))
        };
        Ok(Self {
            base: parse("factory.url", &config.url)?,
            releases: parse("factory.releases_url", &config.releases_url)?,
            api: build(Duration::from_secs(config.timeout_secs))?,
            download: build(Duration::from_secs(config.download_timeout_secs))?,
        })
    }

    fn schematics_url(&self) -> Result<Url, ProvisionError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ProvisionError::Config(format!("factory url '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .push("schematics");
        Ok(url)
    }
}

impl ImageFactory for FactoryClient {
    fn submit_schematic(&self, schematic_yaml: &str) -> Result<SchematicId, ProvisionError> {
        let url = self.schematics_url()?;
        tracing::debug!(url = %url, "submitting schematic:\n{}", schematic_yaml);
        let response = self
            .api
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/yaml")
            .body(schematic_yaml.to_string())
            .send()
            .map_err(|e| transport_error("POST", url.as_str(), e))?;
        let body = ensure_success("POST", url.as_str(), response)?
            .text()
            .map_err(|e| transport_error("POST", url.as_str(), e))?;
        let parsed: SchematicResponse = serde_json::from_str(&body).map_err(|e| {
            ProvisionError::fetch(format!("POST {} returned malformed JSON: {}", url, e))
        })?;
        SchematicId::new(parsed.id)
            .map_err(|e| ProvisionError::fetch(format!("POST {} returned {}", url, e)))
    }

    fn open_artifact(&self, url: &Url) -> Result<ArtifactStream, ProvisionError> {
        let response = self
            .download
            .get(url.clone())
            .send()
            .map_err(|e| transport_error("GET", url.as_str(), e))?;
        let response = ensure_success("GET", url.as_str(), response)?;
        Ok(ArtifactStream {
            content_length: response.content_length(),
            reader: Box::new(response),
        })
    }
}

impl ReleaseSource for FactoryClient {
    fn latest_version(&self) -> Result<String, ProvisionError> {
        let response = self
            .api
            .get(self.releases.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .map_err(|e| transport_error("GET", self.releases.as_str(), e))?;
        let release: ReleaseResponse = ensure_success("GET", self.releases.as_str(), response)?
            .json()
            .map_err(|e| {
                ProvisionError::fetch(format!("GET {} returned malformed JSON: {}", self.releases, e))
            })?;
        Ok(release.tag_name)
    }
}
