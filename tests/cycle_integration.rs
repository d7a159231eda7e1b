//! End-to-end reconciliation cycle tests
//!
//! A mock control plane served by axum on an ephemeral port stands in for
//! the remote service; the validator and process-control collaborators are
//! scripted mocks. Each test drives [`ConfigSyncAgent::run_cycle`] directly
//! against a temporary working directory.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Form, Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use pipesync::agent::ConfigSyncAgent;
use pipesync::settings::Settings;
use pipesync::validator::{PipelineValidator, ProcessControl};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Scripted control plane: one announced version, files served by name.
#[derive(Default)]
struct MockPlane {
    version: Mutex<Option<String>>,
    files: Mutex<HashMap<String, String>>,
    last_ping: Mutex<Option<HashMap<String, String>>>,
}

impl MockPlane {
    fn announce(&self, version: &str, files: &[(&str, &str)]) {
        *self.version.lock().unwrap() = Some(version.to_string());
        *self.files.lock().unwrap() = files
            .iter()
            .map(|(name, contents)| (name.to_string(), contents.to_string()))
            .collect();
    }

    fn quiesce(&self) {
        *self.version.lock().unwrap() = None;
    }

    fn last_ping_field(&self, field: &str) -> Option<String> {
        self.last_ping
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|p| p.get(field).cloned())
    }
}

async fn handle_election() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_ping(
    State(plane): State<Arc<MockPlane>>,
    Form(payload): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    *plane.last_ping.lock().unwrap() = Some(payload);
    match plane.version.lock().unwrap().clone() {
        Some(version) => (
            StatusCode::OK,
            Json(json!({
                "status": "new_version_available",
                "configuration_version": version,
            })),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn handle_configuration(State(plane): State<Arc<MockPlane>>) -> impl IntoResponse {
    let files: Vec<_> = plane
        .files
        .lock()
        .unwrap()
        .keys()
        .map(|name| json!({ "path": format!("files/{name}"), "name": name }))
        .collect();
    Json(json!({ "files": files }))
}

async fn handle_file(
    State(plane): State<Arc<MockPlane>>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    match plane.files.lock().unwrap().get(&name) {
        Some(contents) => (StatusCode::OK, contents.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve the mock plane on an ephemeral port, returning its base URL.
async fn spawn_plane(plane: Arc<MockPlane>) -> String {
    let router = Router::new()
        .route("/collector/cluster-collector", post(handle_election))
        .route("/collector/ping", post(handle_ping))
        .route("/collector/configuration", post(handle_configuration))
        .route("/files/{name}", get(handle_file))
        .with_state(plane);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Validator that optionally rejects composite (staged) validations only.
#[derive(Default)]
struct ScriptedValidator {
    reject_composites: AtomicBool,
}

#[async_trait]
impl PipelineValidator for ScriptedValidator {
    async fn validate(&self, paths: &[PathBuf]) -> Result<Option<String>> {
        let staged = paths
            .iter()
            .any(|p| p.to_string_lossy().contains("/new_"));
        if staged && self.reject_composites.load(Ordering::SeqCst) {
            return Ok(Some("unknown sink type".to_string()));
        }
        Ok(None)
    }

    async fn engine_version(&self) -> Option<String> {
        Some("0.39.0".to_string())
    }
}

#[derive(Default)]
struct CountingControl {
    reloads: AtomicUsize,
    issuer_restarts: AtomicUsize,
}

impl ProcessControl for CountingControl {
    fn reload_pipeline(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn restart_cert_issuer(&self) -> Result<()> {
        self.issuer_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    plane: Arc<MockPlane>,
    agent: ConfigSyncAgent,
    settings: Settings,
    validator: Arc<ScriptedValidator>,
    control: Arc<CountingControl>,
    _work: TempDir,
}

async fn harness() -> Harness {
    let work = TempDir::new().unwrap();
    let plane = Arc::new(MockPlane::default());
    let base_url = spawn_plane(plane.clone()).await;
    let settings = Settings::rooted(work.path(), &base_url, "secret");
    let validator = Arc::new(ScriptedValidator::default());
    let control = Arc::new(CountingControl::default());
    let agent = ConfigSyncAgent::new(settings.clone(), validator.clone(), control.clone()).unwrap();
    Harness {
        plane,
        agent,
        settings,
        validator,
        control,
        _work: work,
    }
}

const DISCOVERY_CONFIG: &str =
    "sinks:\n  out:\n    type: blackhole\n    inputs: [\"kubernetes_discovery_*\"]\n";

#[tokio::test]
async fn bootstrap_promotes_with_default_discovery_generation() {
    let mut h = harness().await;
    h.plane
        .announce("2025-01-01T00:00:00", &[("vector.yaml", DISCOVERY_CONFIG)]);

    h.agent.run_cycle().await.unwrap();

    // Active directory holds exactly the uploaded configuration plus the
    // default generation behind the discovery link.
    let current = h.settings.current_config_dir();
    assert_eq!(
        std::fs::read_to_string(current.join("vector.yaml")).unwrap(),
        DISCOVERY_CONFIG
    );
    let link = current.join("kubernetes-discovery");
    assert_eq!(
        std::fs::read_link(&link).unwrap(),
        h.settings.default_generation_dir()
    );
    assert!(link.join("kubernetes_discovery_metrics.yaml").exists());

    assert_eq!(h.agent.current_version(), Some("2025-01-01T00:00:00"));
    assert_eq!(h.control.reloads.load(Ordering::SeqCst), 1);
    assert!(!h.settings.errors_file().exists());

    // The next ping reports the promoted version back.
    h.plane.quiesce();
    h.agent.run_cycle().await.unwrap();
    assert_eq!(
        h.plane.last_ping_field("configuration_version").as_deref(),
        Some("2025-01-01T00:00:00")
    );
}

#[tokio::test]
async fn domain_change_without_certificate_defers_promotion() {
    let mut h = harness().await;
    h.plane.announce(
        "2025-02-01T00:00:00",
        &[
            ("vector.yaml", DISCOVERY_CONFIG),
            ("domain.txt", "ingest.example.com"),
        ],
    );

    h.agent.run_cycle().await.unwrap();

    // Domain persisted and issuance requested, but nothing promoted and the
    // version directory removed so the control plane resends it.
    assert_eq!(h.control.issuer_restarts.load(Ordering::SeqCst), 1);
    assert!(!h.settings.current_config_dir().exists());
    assert!(!h
        .settings
        .versions_dir()
        .join("2025-02-01T00:00:00")
        .exists());
    assert_eq!(h.agent.current_version(), None);
    // Deferral is a soft condition, not an error.
    assert!(!h.settings.errors_file().exists());

    // Issuance catches up; the same version promotes on a later cycle.
    std::fs::create_dir_all(&h.settings.cert_dir).unwrap();
    std::fs::write(h.settings.cert_dir.join("ingest.example.com.pem"), "cert").unwrap();
    std::fs::write(h.settings.cert_dir.join("ingest.example.com.key"), "key").unwrap();

    h.agent.run_cycle().await.unwrap();
    assert!(h.settings.current_config_dir().join("vector.yaml").exists());
    assert_eq!(h.agent.current_version(), Some("2025-02-01T00:00:00"));
    assert_eq!(h.control.reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn traversal_file_name_aborts_version_with_zero_writes() {
    let mut h = harness().await;
    h.plane.announce(
        "2025-03-01T00:00:00",
        &[
            ("vector.yaml", DISCOVERY_CONFIG),
            ("../../etc/passwd", "owned"),
        ],
    );

    h.agent.run_cycle().await.unwrap();

    assert!(!h.settings.versions_dir().exists() || {
        std::fs::read_dir(h.settings.versions_dir()).unwrap().count() == 0
    });
    assert!(!h.settings.current_config_dir().exists());
    let error = std::fs::read_to_string(h.settings.errors_file()).unwrap();
    assert!(error.starts_with("invalid file name"), "got: {error}");

    // The invalid-filename class is sticky: a clean cycle keeps it, and the
    // next ping still reports it.
    h.plane.quiesce();
    h.agent.run_cycle().await.unwrap();
    assert!(h.settings.errors_file().exists());
    assert_eq!(
        h.plane.last_ping_field("error").as_deref(),
        Some(error.as_str())
    );
}

#[tokio::test]
async fn rejected_composite_leaves_active_config_and_engine_untouched() {
    let mut h = harness().await;
    h.plane
        .announce("2025-04-01T00:00:00", &[("vector.yaml", DISCOVERY_CONFIG)]);
    h.agent.run_cycle().await.unwrap();
    assert_eq!(h.control.reloads.load(Ordering::SeqCst), 1);

    // A later version validates upstream but fails composite validation.
    let changed = "sinks:\n  out:\n    type: blackhole\n    inputs: [\"kubernetes_discovery_*\"]\n  audit:\n    type: console\n    inputs: [\"kubernetes_discovery_*\"]\n    encoding:\n      codec: json\n";
    h.validator.reject_composites.store(true, Ordering::SeqCst);
    h.plane
        .announce("2025-04-02T00:00:00", &[("vector.yaml", changed)]);
    h.agent.run_cycle().await.unwrap();

    // Previous active content unchanged, no reload signaled, staging gone.
    assert_eq!(
        std::fs::read_to_string(h.settings.current_config_dir().join("vector.yaml")).unwrap(),
        DISCOVERY_CONFIG
    );
    assert_eq!(h.control.reloads.load(Ordering::SeqCst), 1);
    let stray: Vec<_> = std::fs::read_dir(h.settings.vector_config_dir())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("new_"))
        .collect();
    assert!(stray.is_empty());
    let error = std::fs::read_to_string(h.settings.errors_file()).unwrap();
    assert!(error.starts_with("configuration validation failed"), "got: {error}");

    // Once the validator recovers, the pending composite is re-staged and
    // promoted without a re-download.
    h.plane.quiesce();
    h.validator.reject_composites.store(false, Ordering::SeqCst);
    h.agent.run_cycle().await.unwrap();
    assert_eq!(
        std::fs::read_to_string(h.settings.current_config_dir().join("vector.yaml")).unwrap(),
        changed
    );
    assert_eq!(h.control.reloads.load(Ordering::SeqCst), 2);
    // The successful promotion resolves the sticky validation error.
    assert!(!h.settings.errors_file().exists());
}

#[tokio::test]
async fn database_table_rides_along_a_version() {
    let mut h = harness().await;
    let csv = "host,port,engine,database\ndb-1,5432,postgres,app\n";
    h.plane.announce(
        "2025-05-01T00:00:00",
        &[("vector.yaml", DISCOVERY_CONFIG), ("databases.csv", csv)],
    );

    h.agent.run_cycle().await.unwrap();

    assert_eq!(
        std::fs::read_to_string(h.settings.enrichment_dir.join("databases.csv")).unwrap(),
        csv
    );
    assert!(!h
        .settings
        .enrichment_dir
        .join("databases.csv.incoming")
        .exists());
}
