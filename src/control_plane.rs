//! Control-plane HTTP client
//!
//! All control-plane traffic is form-encoded POSTs authenticated by the
//! collector secret, plus plain GET downloads attributed with the node
//! hostname. Responses are parsed here into small typed values; nothing in
//! this module touches durable agent state.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Authentication rejected by the control plane. The process must exit:
/// retrying with the same secret can only fail again.
#[derive(Debug)]
pub struct FatalAuthError {
    pub status: u16,
}

impl std::fmt::Display for FatalAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "control plane rejected authentication (status {})", self.status)
    }
}

impl std::error::Error for FatalAuthError {}

/// Status payload sent on every ping.
#[derive(Debug, Clone, Serialize)]
pub struct PingPayload {
    pub collector_secret: String,
    pub cluster_collector: bool,
    pub host: String,
    pub collector_version: String,
    pub vector_version: String,
    pub beyla_version: String,
    pub cluster_agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_information: Option<String>,
}

/// What a ping came back with.
#[derive(Debug, Clone, PartialEq)]
pub enum PingOutcome {
    /// 204: nothing pending.
    NothingPending,
    /// A new configuration version is ready to fetch.
    NewVersion(String),
    /// 200 with some other status; informational only.
    Informational(String),
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    status: String,
    #[serde(default)]
    configuration_version: Option<String>,
}

/// One entry of a version's file list. The control plane sends either a
/// path/name pair or a bare URL string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FileEntry {
    Named { path: String, name: String },
    Url(String),
}

impl FileEntry {
    /// The local file name this entry should be stored under.
    pub fn file_name(&self) -> &str {
        match self {
            FileEntry::Named { name, .. } => name,
            FileEntry::Url(url) => {
                let without_query = url.split('?').next().unwrap_or(url);
                without_query.rsplit('/').next().unwrap_or(without_query)
            }
        }
    }

    fn location(&self) -> &str {
        match self {
            FileEntry::Named { path, .. } => path,
            FileEntry::Url(url) => url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    files: Vec<FileEntry>,
}

pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
    host: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: String, secret: String, host: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url,
            secret,
            host,
        })
    }

    /// Ask the election endpoint whether this node holds the
    /// cluster-collector role. 409 means another node already holds it.
    pub async fn is_cluster_collector(&self) -> Result<bool> {
        let url = format!("{}/collector/cluster-collector", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[("collector_secret", self.secret.as_str()), ("host", self.host.as_str())])
            .send()
            .await
            .context("cluster-collector election request failed")?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FatalAuthError { status: response.status().as_u16() }.into())
            }
            status => Err(anyhow::anyhow!(
                "unexpected cluster-collector status {status}"
            )),
        }
    }

    /// Report status and ask whether a new configuration version exists.
    pub async fn ping(&self, payload: &PingPayload) -> Result<PingOutcome> {
        let url = format!("{}/collector/ping", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(payload)
            .send()
            .await
            .context("ping request failed")?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(PingOutcome::NothingPending),
            StatusCode::OK => {
                let body: PingResponse =
                    response.json().await.context("malformed ping response body")?;
                Ok(parse_ping_body(body)?)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FatalAuthError { status: response.status().as_u16() }.into())
            }
            status => Err(anyhow::anyhow!("unexpected ping status {status}")),
        }
    }

    /// Fetch the file list for an announced version.
    pub async fn fetch_file_list(&self, version: &str) -> Result<Vec<FileEntry>> {
        let url = format!("{}/collector/configuration", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("collector_secret", self.secret.as_str()),
                ("configuration_version", version),
            ])
            .send()
            .await
            .context("configuration file-list request failed")?;

        if response.status() != StatusCode::OK {
            return Err(anyhow::anyhow!(
                "unexpected configuration status {}",
                response.status()
            ));
        }
        let body: FileListResponse = response
            .json()
            .await
            .context("malformed configuration response body")?;
        Ok(body.files)
    }

    /// Download one file into `dest_dir` under its validated name.
    ///
    /// Best-effort, no retries: a failure aborts the whole version upstream.
    pub async fn download(&self, entry: &FileEntry, dest_dir: &Path) -> Result<PathBuf> {
        let name = entry.file_name().to_string();
        validate_file_name(&name)?;

        let url = attributed_url(&self.base_url, entry.location(), &self.host);
        debug!(url = %url, "downloading configuration file");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("download of {name} failed"))?;
        if response.status() != StatusCode::OK {
            return Err(anyhow::anyhow!(
                "download of {name} failed with status {}",
                response.status()
            ));
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("download of {name} was interrupted"))?;

        std::fs::create_dir_all(dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
        let dest = dest_dir.join(&name);
        std::fs::write(&dest, &bytes)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        info!(file = %name, bytes = bytes.len(), "configuration file downloaded");
        Ok(dest)
    }
}

fn parse_ping_body(body: PingResponse) -> Result<PingOutcome> {
    if body.status == "new_version_available" {
        let version = body
            .configuration_version
            .context("new_version_available without configuration_version")?;
        validate_version_id(&version)?;
        Ok(PingOutcome::NewVersion(version))
    } else {
        Ok(PingOutcome::Informational(body.status))
    }
}

/// Resolve a file location against the base URL and append the attribution
/// query parameter.
fn attributed_url(base_url: &str, location: &str, host: &str) -> String {
    let absolute = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}/{}", base_url, location.trim_start_matches('/'))
    };
    let separator = if absolute.contains('?') { '&' } else { '?' };
    format!("{absolute}{separator}host={}", urlencoding::encode(host))
}

/// Reject names that could escape the version directory.
pub fn validate_file_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.contains('/')
        || name.split('.').all(|p| p.is_empty()) // ".", "..", "..."
        || name.contains("..");
    if bad {
        return Err(anyhow::anyhow!("invalid file name \"{name}\""));
    }
    Ok(())
}

/// Reject version identifiers that could escape the versions directory.
pub fn validate_version_id(version: &str) -> Result<()> {
    let bad = version.is_empty()
        || version.contains('/')
        || version.contains('\\')
        || version.contains("..");
    if bad {
        return Err(anyhow::anyhow!("invalid configuration version \"{version}\""));
    }
    Ok(())
}
