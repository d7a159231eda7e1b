//! Local HTTP surface
//!
//! Two endpoints for on-node collaborators: the eBPF agent's supervisory
//! loop asks `/monitoring-agent` whether it should be running, and
//! `/vector-metrics/*` reverse-proxies to the data-plane metrics exporter
//! so scrapers never need direct access to the engine's port.

use crate::settings::Settings;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{OriginalUri, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Source-id prefix that marks an active configuration as wanting the
/// companion eBPF monitoring agent.
const EBPF_SOURCE_PREFIX: &str = "ebpf_";

#[derive(Clone)]
struct ServerState {
    settings: Settings,
    client: reqwest::Client,
}

pub fn router(settings: Settings) -> Router {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();
    Router::new()
        .route("/monitoring-agent", get(monitoring_agent))
        .route("/vector-metrics", any(proxy_metrics))
        .route("/vector-metrics/{*path}", any(proxy_metrics))
        .layer(CorsLayer::permissive())
        .with_state(ServerState { settings, client })
}

/// Bind and serve the local surface until the process exits.
pub async fn serve(settings: Settings) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.local_port));
    info!(%addr, "starting local HTTP surface");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router(settings))
        .await
        .context("local HTTP surface terminated")
}

async fn monitoring_agent(State(state): State<ServerState>) -> &'static str {
    monitoring_answer(&state.settings)
}

/// `yes` iff the active configuration exists and references eBPF sources.
pub fn monitoring_answer(settings: &Settings) -> &'static str {
    let wanted = crate::promoter::recognized_in(&settings.current_config_dir())
        .iter()
        .any(|file| {
            std::fs::read_to_string(file)
                .map(|contents| contents.contains(EBPF_SOURCE_PREFIX))
                .unwrap_or(false)
        });
    if wanted {
        "yes"
    } else {
        "no"
    }
}

/// Forward a request to the engine's metrics port, preserving method,
/// headers (minus host) and body. Any proxy failure maps to 502.
async fn proxy_metrics(
    State(state): State<ServerState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().trim_start_matches("/vector-metrics");
    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let target = format!(
        "http://127.0.0.1:{}{}{}",
        state.settings.engine_metrics_port,
        if path.is_empty() { "/" } else { path },
        query
    );

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut request = state.client.request(method, &target);
    for (name, value) in headers.iter() {
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.header(name.as_str(), value);
        }
    }

    match request.body(body.to_vec()).send().await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response_headers = HeaderMap::new();
            for (name, value) in upstream.headers().iter() {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::try_from(name.as_str()),
                    axum::http::HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    response_headers.insert(name, value);
                }
            }
            let bytes = upstream.bytes().await.unwrap_or_default();
            (status, response_headers, bytes.to_vec()).into_response()
        }
        Err(e) => {
            warn!("metrics proxy failure: {e}");
            (StatusCode::BAD_GATEWAY, "metrics proxy failure").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn monitoring_answer_tracks_active_configuration() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::rooted(tmp.path(), "http://cp", "s");

        // Pre-bootstrap: no active directory.
        assert_eq!(monitoring_answer(&settings), "no");

        std::fs::create_dir_all(settings.current_config_dir()).unwrap();
        std::fs::write(
            settings.current_config_dir().join("vector.yaml"),
            "sources:\n  in:\n    type: internal_metrics\n",
        )
        .unwrap();
        assert_eq!(monitoring_answer(&settings), "no");

        std::fs::write(
            settings.current_config_dir().join("vector.yaml"),
            "sources:\n  ebpf_net:\n    type: socket\n    mode: unix\n    path: /run/ebpf.sock\n",
        )
        .unwrap();
        assert_eq!(monitoring_answer(&settings), "yes");
    }

    #[test]
    fn router_builds() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::rooted(tmp.path(), "http://cp", "s");
        let _ = router(settings);
    }
}
