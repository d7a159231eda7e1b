//! Kubernetes endpoint discovery
//!
//! When the promoted pipeline configuration references discovery sources,
//! this engine probes the Kubernetes API for annotated scrape targets and
//! turns them into one configuration fragment per endpoint. A generation of
//! fragments is only retained when it validates as a whole and differs from
//! the previous retained generation, which keeps the composite-promotion
//! path quiet on stable clusters.

use crate::kubernetes::{KubeClient, KubeCredentials, Pod};
use crate::settings::Settings;
use crate::validator::PipelineValidator;
use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum spacing between discovery runs.
pub const MIN_RUN_INTERVAL: Duration = Duration::from_secs(30);
/// Timestamped generations kept on disk, excluding the permanent default.
pub const RETAINED_GENERATIONS: usize = 5;
/// Name of the permanent empty generation.
pub const DEFAULT_GENERATION: &str = "0-default";
/// Prefix shared by every generated source id; upstream configurations
/// reference discovery through `kubernetes_discovery_*` wildcard inputs.
pub const SOURCE_PREFIX: &str = "kubernetes_discovery";
/// File recording the discovered-target count, present in every generation.
pub const METRICS_FRAGMENT: &str = "kubernetes_discovery_metrics.yaml";

/// One scrape target resolved from the cluster.
#[derive(Debug, Clone)]
pub struct DiscoveredEndpoint {
    pub namespace: String,
    /// Pod name for pod-backed targets, service name otherwise.
    pub name: String,
    pub scrape_url: String,
    pub workload: Option<Workload>,
    pub pod_uid: Option<String>,
    pub node: Option<String>,
    pub started_at: Option<String>,
    pub containers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Workload {
    pub kind: String,
    pub name: String,
}

impl DiscoveredEndpoint {
    /// Stable dedup key: a pod reachable both via a service and via its own
    /// annotation must be emitted once.
    pub fn key(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }
}

/// Insert an endpoint unless its key is already taken.
fn insert_unique(map: &mut BTreeMap<String, DiscoveredEndpoint>, ep: DiscoveredEndpoint) {
    map.entry(ep.key()).or_insert(ep);
}

pub struct KubernetesDiscoveryEngine {
    settings: Settings,
    validator: Arc<dyn PipelineValidator>,
    last_run: Option<Instant>,
}

impl KubernetesDiscoveryEngine {
    pub fn new(settings: Settings, validator: Arc<dyn PipelineValidator>) -> Self {
        Self {
            settings,
            validator,
            last_run: None,
        }
    }

    /// Run discovery if the promoted configuration needs it and the guards
    /// allow it. Returns whether a new generation was retained.
    pub async fn maybe_run(&mut self) -> Result<bool> {
        if !crate::promoter::active_references_discovery(&self.settings) {
            debug!("active configuration does not reference discovery");
            return Ok(false);
        }
        if let Some(last) = self.last_run {
            if last.elapsed() < MIN_RUN_INTERVAL {
                debug!("discovery rate limited");
                return Ok(false);
            }
        }
        let creds = match KubeCredentials::load(&self.settings.service_account_dir) {
            Some(creds) => creds,
            None => {
                debug!("no in-cluster credentials, skipping discovery");
                return Ok(false);
            }
        };
        self.last_run = Some(Instant::now());

        let client = KubeClient::new(creds)?;
        let endpoints =
            discover_endpoints(&client, self.settings.node_name.as_deref()).await?;
        if endpoints.is_empty() {
            debug!("discovery found no targets, keeping previous generation");
            return Ok(false);
        }
        info!(targets = endpoints.len(), "discovery resolved scrape targets");

        let fragments = build_fragments(&endpoints)?;
        if let Some(diagnostic) = self.validate_fragments(&fragments).await? {
            return Err(anyhow::anyhow!(
                "configuration validation failed: discovery fragments rejected: {diagnostic}"
            ));
        }

        let previous = latest_generation_dir(&self.settings);
        if !generation_differs(&fragments, &previous) {
            debug!("discovery generation unchanged, discarding");
            return Ok(false);
        }

        let dir = write_generation(&self.settings, &fragments)?;
        info!(generation = %dir.display(), "new discovery generation retained");
        prune_generations(&self.settings);
        Ok(true)
    }

    /// Validate a fragment set plus a disposable wildcard sink in isolation.
    async fn validate_fragments(
        &self,
        fragments: &BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        let tmp = tempfile::TempDir::new().context("failed to create validation dir")?;
        for (name, contents) in fragments {
            std::fs::write(tmp.path().join(name), contents)
                .with_context(|| format!("failed to stage fragment {name}"))?;
        }
        std::fs::write(tmp.path().join("validate.yaml"), validation_stub_yaml())
            .context("failed to stage validation stub")?;
        self.validator
            .validate(&[tmp.path().join("*.yaml")])
            .await
    }
}

/// Walk the cluster for annotated scrape targets.
///
/// Services are resolved through their live endpoint addresses down to the
/// backing pods; standalone annotated pods are added afterwards, deduplicated
/// by `namespace_name`. When a node filter is configured, a target without a
/// confirmed matching node is excluded on every path.
pub async fn discover_endpoints(
    client: &KubeClient,
    node_filter: Option<&str>,
) -> Result<Vec<DiscoveredEndpoint>> {
    let mut found: BTreeMap<String, DiscoveredEndpoint> = BTreeMap::new();

    for namespace in client.list_namespaces().await? {
        let pods = client.list_pods(&namespace).await?;
        let pods_by_name: BTreeMap<String, &Pod> = pods
            .iter()
            .map(|p| (p.metadata.name.clone(), p))
            .collect();

        for service in client.list_services(&namespace).await? {
            if !service.metadata.scrape_enabled() {
                continue;
            }
            let endpoints = match client.get_endpoints(&namespace, &service.metadata.name).await? {
                Some(eps) => eps,
                None => continue,
            };
            for subset in &endpoints.subsets {
                let port = match service
                    .metadata
                    .scrape_port()
                    .or_else(|| subset.ports.first().map(|p| p.port))
                {
                    Some(port) => port,
                    None => continue,
                };
                for address in &subset.addresses {
                    let backing_pod = match &address.target_ref {
                        Some(target) if target.kind == "Pod" => {
                            match pods_by_name.get(&target.name) {
                                Some(pod) => Some((*pod).clone()),
                                None => client.get_pod(&namespace, &target.name).await?,
                            }
                        }
                        _ => None,
                    };
                    if let Some(filter) = node_filter {
                        let on_node = backing_pod
                            .as_ref()
                            .and_then(|p| p.spec.node_name.as_deref())
                            .map(|n| n == filter)
                            .unwrap_or(false);
                        if !on_node {
                            continue;
                        }
                    }
                    let name = backing_pod
                        .as_ref()
                        .map(|p| p.metadata.name.clone())
                        .unwrap_or_else(|| service.metadata.name.clone());
                    let workload = match &backing_pod {
                        Some(pod) => resolve_workload(client, pod).await?,
                        None => None,
                    };
                    insert_unique(
                        &mut found,
                        DiscoveredEndpoint {
                            namespace: namespace.clone(),
                            name,
                            scrape_url: format!(
                                "http://{}:{}{}",
                                address.ip,
                                port,
                                service.metadata.scrape_path()
                            ),
                            workload,
                            pod_uid: backing_pod.as_ref().map(|p| p.metadata.uid.clone()),
                            node: backing_pod.as_ref().and_then(|p| p.spec.node_name.clone()),
                            started_at: backing_pod
                                .as_ref()
                                .and_then(|p| p.status.start_time.clone()),
                            containers: backing_pod
                                .map(|p| p.spec.containers.into_iter().map(|c| c.name).collect())
                                .unwrap_or_default(),
                        },
                    );
                }
            }
        }

        for pod in &pods {
            if !pod.metadata.scrape_enabled() {
                continue;
            }
            let key = format!("{}_{}", namespace, pod.metadata.name);
            if found.contains_key(&key) {
                continue;
            }
            if let Some(filter) = node_filter {
                if pod.spec.node_name.as_deref() != Some(filter) {
                    continue;
                }
            }
            let ip = match &pod.status.pod_ip {
                Some(ip) => ip.clone(),
                None => continue,
            };
            let port = match pod.metadata.scrape_port() {
                Some(port) => port,
                None => {
                    debug!(pod = %pod.metadata.name, "scrape annotation without port, skipping");
                    continue;
                }
            };
            let workload = resolve_workload(client, pod).await?;
            insert_unique(
                &mut found,
                DiscoveredEndpoint {
                    namespace: namespace.clone(),
                    name: pod.metadata.name.clone(),
                    scrape_url: format!("http://{}:{}{}", ip, port, pod.metadata.scrape_path()),
                    workload,
                    pod_uid: Some(pod.metadata.uid.clone()),
                    node: pod.spec.node_name.clone(),
                    started_at: pod.status.start_time.clone(),
                    containers: pod.spec.containers.iter().map(|c| c.name.clone()).collect(),
                },
            );
        }
    }

    Ok(found.into_values().collect())
}

/// Resolve a pod's owning workload, following ReplicaSets one level up to
/// their Deployment.
async fn resolve_workload(client: &KubeClient, pod: &Pod) -> Result<Option<Workload>> {
    let owner = match pod.metadata.controller() {
        Some(owner) => owner.clone(),
        None => return Ok(None),
    };
    if owner.kind == "ReplicaSet" {
        if let Some(rs) = client
            .get_replicaset(&pod.metadata.namespace, &owner.name)
            .await?
        {
            if let Some(rs_owner) = rs.metadata.controller() {
                if rs_owner.kind == "Deployment" {
                    return Ok(Some(Workload {
                        kind: rs_owner.kind.clone(),
                        name: rs_owner.name.clone(),
                    }));
                }
            }
        }
    }
    Ok(Some(Workload {
        kind: owner.kind,
        name: owner.name,
    }))
}

/// Render the full fragment set for a discovery run: one file per endpoint
/// plus the target-count metrics fragment.
pub fn build_fragments(endpoints: &[DiscoveredEndpoint]) -> Result<BTreeMap<String, String>> {
    let mut fragments = BTreeMap::new();
    for ep in endpoints {
        let (name, contents) = endpoint_fragment(ep)?;
        fragments.insert(name, contents);
    }
    fragments.insert(
        METRICS_FRAGMENT.to_string(),
        metrics_fragment_yaml(endpoints.len()),
    );
    Ok(fragments)
}

/// One source plus a label-enrichment transform for a single endpoint. The
/// filename carries a content hash so identical fragments across runs get
/// identical names.
fn endpoint_fragment(ep: &DiscoveredEndpoint) -> Result<(String, String)> {
    let id = format!("{}_{}", SOURCE_PREFIX, sanitize(&ep.key()));

    let mut source = Mapping::new();
    source.insert("type".into(), "prometheus_scrape".into());
    source.insert(
        "endpoints".into(),
        Value::Sequence(vec![ep.scrape_url.clone().into()]),
    );
    source.insert("scrape_interval_secs".into(), 30.into());

    let mut transform = Mapping::new();
    transform.insert("type".into(), "remap".into());
    transform.insert("inputs".into(), Value::Sequence(vec![id.clone().into()]));
    transform.insert("source".into(), remap_program(ep).into());

    let mut sources = Mapping::new();
    sources.insert(id.clone().into(), Value::Mapping(source));
    let mut transforms = Mapping::new();
    transforms.insert(format!("{id}_labels").into(), Value::Mapping(transform));

    let mut root = Mapping::new();
    root.insert("sources".into(), Value::Mapping(sources));
    root.insert("transforms".into(), Value::Mapping(transforms));

    let contents = serde_yaml::to_string(&Value::Mapping(root))
        .context("failed to serialize discovery fragment")?;
    let hash = format!("{:x}", Sha256::digest(contents.as_bytes()));
    let name = format!("{}-{}.yaml", sanitize(&ep.key()), &hash[..12]);
    Ok((name, contents))
}

/// The label-enrichment program attached to every discovered source.
fn remap_program(ep: &DiscoveredEndpoint) -> String {
    let mut lines = vec![
        format!(".tags.namespace = \"{}\"", ep.namespace),
        format!(".tags.pod = \"{}\"", ep.name),
    ];
    if let Some(workload) = &ep.workload {
        lines.push(format!(
            ".tags.workload = \"{}/{}\"",
            workload.kind, workload.name
        ));
    }
    if let Some(uid) = &ep.pod_uid {
        lines.push(format!(".tags.pod_uid = \"{uid}\""));
    }
    if let Some(node) = &ep.node {
        lines.push(format!(".tags.node = \"{node}\""));
    }
    if let Some(started) = &ep.started_at {
        lines.push(format!(".tags.pod_start_time = \"{started}\""));
    }
    if !ep.containers.is_empty() {
        lines.push(format!(".tags.containers = \"{}\"", ep.containers.join(",")));
    }
    lines.join("\n")
}

/// The synthetic fragment recording how many targets a run discovered.
/// Always present so `kubernetes_discovery_*` wildcard inputs match even
/// when the cluster has no scrape targets.
pub fn metrics_fragment_yaml(count: usize) -> String {
    format!(
        "sources:\n  {SOURCE_PREFIX}_metrics:\n    type: static_metrics\n    metrics:\n      - name: {SOURCE_PREFIX}_targets\n        kind: absolute\n        value:\n          gauge:\n            value: {count}\n"
    )
}

/// Disposable configuration that only references discovery sources, used to
/// validate a fragment set on its own.
fn validation_stub_yaml() -> String {
    format!(
        "sinks:\n  {SOURCE_PREFIX}_validate:\n    type: blackhole\n    inputs:\n      - \"{SOURCE_PREFIX}_*\"\n"
    )
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Create the permanent empty generation if it does not exist yet.
pub fn ensure_default_generation(settings: &Settings) -> Result<()> {
    let dir = settings.default_generation_dir();
    let fragment = dir.join(METRICS_FRAGMENT);
    if fragment.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    std::fs::write(&fragment, metrics_fragment_yaml(0))
        .with_context(|| format!("failed to write {}", fragment.display()))?;
    Ok(())
}

/// The newest retained generation, falling back to the permanent default.
pub fn latest_generation_dir(settings: &Settings) -> PathBuf {
    let mut names: Vec<String> = generation_names(settings);
    names.sort();
    match names.pop() {
        Some(newest) => settings.discovery_dir().join(newest),
        None => settings.default_generation_dir(),
    }
}

fn generation_names(settings: &Settings) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(entries) = std::fs::read_dir(settings.discovery_dir()) else {
        return names;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name != DEFAULT_GENERATION && entry.path().is_dir() {
            names.push(name);
        }
    }
    names
}

/// Whether a rendered fragment set differs from what a generation directory
/// holds, by file-name set and byte-for-byte contents.
pub fn generation_differs(fragments: &BTreeMap<String, String>, previous: &Path) -> bool {
    let existing = match read_generation(previous) {
        Ok(existing) => existing,
        Err(_) => return true,
    };
    if existing.len() != fragments.len() {
        return true;
    }
    for (name, contents) in fragments {
        match existing.get(name) {
            Some(bytes) if bytes == contents.as_bytes() => {}
            _ => return true,
        }
    }
    false
}

fn read_generation(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read generation {}", dir.display()))?
    {
        let entry = entry?;
        if entry.path().is_file() {
            files.insert(
                entry.file_name().to_string_lossy().to_string(),
                std::fs::read(entry.path())?,
            );
        }
    }
    Ok(files)
}

/// Write a new timestamped generation directory.
fn write_generation(
    settings: &Settings,
    fragments: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let name = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string();
    let dir = settings.discovery_dir().join(name);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    for (file, contents) in fragments {
        std::fs::write(dir.join(file), contents)
            .with_context(|| format!("failed to write fragment {file}"))?;
    }
    Ok(dir)
}

/// Remove generations beyond the retention count, never the default.
fn prune_generations(settings: &Settings) {
    let mut names = generation_names(settings);
    names.sort();
    while names.len() > RETAINED_GENERATIONS {
        let victim = names.remove(0);
        let path = settings.discovery_dir().join(&victim);
        if let Err(e) = std::fs::remove_dir_all(&path) {
            warn!(generation = %victim, "failed to prune generation: {e:#}");
        }
    }
}
