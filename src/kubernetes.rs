//! Minimal in-cluster Kubernetes API client
//!
//! The discovery engine needs five read-only endpoints (namespaces,
//! services, pods, endpoints, replicasets), so the API surface is modeled
//! with small typed structs and a reqwest client built from the mounted
//! service-account credentials.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Annotation enabling scraping of a pod or service.
pub const SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";
/// Annotation overriding the scrape port.
pub const PORT_ANNOTATION: &str = "prometheus.io/port";
/// Annotation overriding the scrape path.
pub const PATH_ANNOTATION: &str = "prometheus.io/path";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Whether the scrape annotation is present and truthy.
    pub fn scrape_enabled(&self) -> bool {
        self.annotations
            .get(SCRAPE_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn scrape_port(&self) -> Option<u16> {
        self.annotations.get(PORT_ANNOTATION)?.parse().ok()
    }

    pub fn scrape_path(&self) -> String {
        self.annotations
            .get(PATH_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| "/metrics".to_string())
    }

    /// The controlling owner reference, if any.
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|o| o.controller.unwrap_or(false))
            .or_else(|| self.owner_references.first())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub controller: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Container {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub target_ref: Option<TargetRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointPort {
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicaSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Namespace {
    metadata: ObjectMeta,
}

/// In-cluster credentials mounted by the kubelet.
pub struct KubeCredentials {
    pub token: String,
    pub ca_pem: Vec<u8>,
    pub namespace: String,
    pub api_base: String,
}

impl KubeCredentials {
    /// Load credentials from the service-account mount. `None` when any
    /// piece is missing, which means discovery is not running in a cluster.
    pub fn load(dir: &Path) -> Option<Self> {
        let token = std::fs::read_to_string(dir.join("token")).ok()?;
        let ca_pem = std::fs::read(dir.join("ca.crt")).ok()?;
        let namespace = std::fs::read_to_string(dir.join("namespace")).ok()?;
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        Some(Self {
            token: token.trim().to_string(),
            ca_pem,
            namespace: namespace.trim().to_string(),
            api_base: format!("https://{host}:{port}"),
        })
    }
}

pub struct KubeClient {
    client: reqwest::Client,
    base: String,
    token: String,
    own_namespace: String,
}

impl KubeClient {
    pub fn new(creds: KubeCredentials) -> Result<Self> {
        let ca = reqwest::Certificate::from_pem(&creds.ca_pem)
            .context("invalid service-account CA certificate")?;
        let client = reqwest::Client::builder()
            .add_root_certificate(ca)
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build Kubernetes HTTP client")?;
        Ok(Self {
            client,
            base: creds.api_base,
            token: creds.token,
            own_namespace: creds.namespace,
        })
    }

    pub fn own_namespace(&self) -> &str {
        &self.own_namespace
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Kubernetes API request {path} failed"))?;
        match response.status() {
            StatusCode::OK => Ok(Some(
                response
                    .json()
                    .await
                    .with_context(|| format!("malformed Kubernetes response for {path}"))?,
            )),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN => {
                debug!(path, "Kubernetes API access forbidden");
                Ok(None)
            }
            status => Err(anyhow::anyhow!("Kubernetes API {path} returned {status}")),
        }
    }

    /// All visible namespace names, falling back to the agent's own
    /// namespace when cluster-wide listing is forbidden.
    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        match self.get_json::<ObjectList<Namespace>>("/api/v1/namespaces").await? {
            Some(list) => Ok(list.items.into_iter().map(|n| n.metadata.name).collect()),
            None => {
                warn!("namespace listing forbidden, discovering own namespace only");
                Ok(vec![self.own_namespace.clone()])
            }
        }
    }

    pub async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        Ok(self
            .get_json::<ObjectList<Service>>(&format!("/api/v1/namespaces/{namespace}/services"))
            .await?
            .map(|l| l.items)
            .unwrap_or_default())
    }

    pub async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .get_json::<ObjectList<Pod>>(&format!("/api/v1/namespaces/{namespace}/pods"))
            .await?
            .map(|l| l.items)
            .unwrap_or_default())
    }

    pub async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        self.get_json(&format!("/api/v1/namespaces/{namespace}/endpoints/{name}"))
            .await
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get_json(&format!("/api/v1/namespaces/{namespace}/pods/{name}"))
            .await
    }

    /// Resolve a ReplicaSet one level up to its owning Deployment.
    pub async fn get_replicaset(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        self.get_json(&format!(
            "/apis/apps/v1/namespaces/{namespace}/replicasets/{name}"
        ))
        .await
    }
}
