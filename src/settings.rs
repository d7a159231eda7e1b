//! Agent settings and working-directory layout
//!
//! Every component receives an explicit [`Settings`] value at construction
//! time; there is no process-wide configuration state. Path helpers below are
//! the single source of truth for the on-disk layout.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default data-plane metrics port (vector's prometheus exporter).
pub fn default_metrics_port() -> u16 {
    9598
}

/// Default local HTTP surface port.
pub fn default_local_port() -> u16 {
    8088
}

/// Default reconciliation interval in seconds.
pub fn default_sync_interval() -> u64 {
    60
}

/// Agent configuration, assembled from CLI flags and environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root of all agent-owned durable state
    pub working_dir: PathBuf,
    /// Control-plane base URL, e.g. `https://app.example.com/api`
    pub base_url: String,
    /// Shared secret identifying this fleet to the control plane
    pub collector_secret: String,
    /// Node hostname reported to the control plane
    pub host: String,
    /// Directory holding enrichment tables and their incoming files
    pub enrichment_dir: PathBuf,
    /// Directory holding TLS certificate/key pairs per domain
    pub cert_dir: PathBuf,
    /// Force the cluster-collector role without asking the control plane
    pub force_cluster_collector: bool,
    /// Node name for discovery node filtering; unset disables the filter
    pub node_name: Option<String>,
    /// Kubernetes service-account credential directory
    pub service_account_dir: PathBuf,
    /// Path to the pipeline engine binary used for validation
    pub engine_binary: PathBuf,
    /// Pid file of the running pipeline engine (reload target)
    pub engine_pid_file: PathBuf,
    /// Pid file of the certificate issuance tool
    pub issuer_pid_file: PathBuf,
    /// Local port of the data-plane metrics exporter
    pub engine_metrics_port: u16,
    /// Port for the agent's own HTTP surface
    pub local_port: u16,
    /// Seconds between reconciliation cycles
    pub sync_interval: u64,
    /// Reported version of the eBPF monitoring agent
    pub beyla_version: String,
    /// Reported version of the companion cluster agent
    pub cluster_agent_version: String,
}

impl Settings {
    /// Build settings from the environment, with CLI-provided overrides.
    pub fn from_env(working_dir: Option<PathBuf>, base_url: Option<String>) -> Result<Self> {
        let working_dir = working_dir
            .or_else(|| std::env::var_os("PIPESYNC_WORKING_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/var/lib/pipesync"));
        let base_url = base_url
            .or_else(|| std::env::var("PIPESYNC_BASE_URL").ok())
            .context("control-plane base URL not set (PIPESYNC_BASE_URL)")?;
        let collector_secret = std::env::var("PIPESYNC_COLLECTOR_SECRET")
            .context("collector secret not set (PIPESYNC_COLLECTOR_SECRET)")?;

        Ok(Self {
            host: resolve_hostname(),
            working_dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            collector_secret,
            enrichment_dir: env_path("PIPESYNC_ENRICHMENT_DIR", "/enrichment"),
            cert_dir: env_path("PIPESYNC_CERT_DIR", "/etc/ssl"),
            force_cluster_collector: std::env::var("PIPESYNC_FORCE_CLUSTER_COLLECTOR")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            node_name: std::env::var("NODE_NAME").ok().filter(|v| !v.is_empty()),
            service_account_dir: env_path(
                "PIPESYNC_SERVICE_ACCOUNT_DIR",
                "/var/run/secrets/kubernetes.io/serviceaccount",
            ),
            engine_binary: env_path("PIPESYNC_ENGINE_BINARY", "vector"),
            engine_pid_file: env_path("PIPESYNC_ENGINE_PID_FILE", "/run/vector.pid"),
            issuer_pid_file: env_path("PIPESYNC_ISSUER_PID_FILE", "/run/cert-issuer.pid"),
            engine_metrics_port: env_parse("PIPESYNC_ENGINE_METRICS_PORT", default_metrics_port()),
            local_port: env_parse("PIPESYNC_LOCAL_PORT", default_local_port()),
            sync_interval: env_parse("PIPESYNC_SYNC_INTERVAL", default_sync_interval()),
            beyla_version: std::env::var("PIPESYNC_BEYLA_VERSION").unwrap_or_default(),
            cluster_agent_version: std::env::var("PIPESYNC_CLUSTER_AGENT_VERSION")
                .unwrap_or_default(),
        })
    }

    /// Settings rooted entirely under one directory, defaults elsewhere.
    ///
    /// Used by tests and by deployments that keep certificates and
    /// enrichment tables inside the working directory.
    pub fn rooted(working_dir: &std::path::Path, base_url: &str, secret: &str) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            base_url: base_url.trim_end_matches('/').to_string(),
            collector_secret: secret.to_string(),
            host: resolve_hostname(),
            enrichment_dir: working_dir.join("enrichment"),
            cert_dir: working_dir.join("ssl"),
            force_cluster_collector: false,
            node_name: None,
            service_account_dir: working_dir.join("serviceaccount"),
            engine_binary: PathBuf::from("vector"),
            engine_pid_file: working_dir.join("vector.pid"),
            issuer_pid_file: working_dir.join("cert-issuer.pid"),
            engine_metrics_port: default_metrics_port(),
            local_port: default_local_port(),
            sync_interval: default_sync_interval(),
            beyla_version: String::new(),
            cluster_agent_version: String::new(),
        }
    }

    /// Raw downloads, one directory per configuration version.
    pub fn versions_dir(&self) -> PathBuf {
        self.working_dir.join("versions")
    }

    /// Parent of the upstream / staging / active configuration directories.
    pub fn vector_config_dir(&self) -> PathBuf {
        self.working_dir.join("vector-config")
    }

    /// Most recently validated raw upstream configuration.
    pub fn latest_valid_upstream(&self) -> PathBuf {
        self.vector_config_dir().join("latest-valid-upstream")
    }

    /// The directory the data-plane engine actually reads.
    pub fn current_config_dir(&self) -> PathBuf {
        self.vector_config_dir().join("current")
    }

    /// Parent of all discovery generations.
    pub fn discovery_dir(&self) -> PathBuf {
        self.working_dir.join("kubernetes-discovery")
    }

    /// Permanent empty generation used when discovery is not needed.
    pub fn default_generation_dir(&self) -> PathBuf {
        self.discovery_dir().join("0-default")
    }

    /// Persisted error message surfaced on the next ping.
    pub fn errors_file(&self) -> PathBuf {
        self.working_dir.join("errors.txt")
    }

    /// Persisted desired TLS domain.
    pub fn domain_file(&self) -> PathBuf {
        self.working_dir.join("domain.txt")
    }

    /// Persisted identifier of the currently promoted configuration version.
    pub fn version_file(&self) -> PathBuf {
        self.working_dir.join("version.txt")
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(anyhow::anyhow!("base_url must not be empty"));
        }
        if self.collector_secret.is_empty() {
            return Err(anyhow::anyhow!("collector_secret must not be empty"));
        }
        if self.sync_interval == 0 {
            return Err(anyhow::anyhow!("sync_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Resolve the node hostname, falling back to `unknown` when the OS call fails.
pub fn resolve_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var_os(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
