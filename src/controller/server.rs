//! # HTTP Server
//!
//! Metrics, probes and the read-only status surface.
//!
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness probe (always 200)
//! - `/readyz` - Readiness probe (200 once the server is bound)
//! - `GET /status` - Merged status view of every unit
//! - `GET /status/{scope}/{name}` - One unit's status
//! - `POST /units/{scope}/{name}/reconcile` - Force a unit's next pass
//!
//! Runs on port 5000 by default (`METRICS_PORT`).

use crate::controller::runtime::{Controller, ControllerError};
use crate::crd::UnitId;
use crate::observability::metrics::REGISTRY;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct ServerState {
    pub is_ready: Arc<AtomicBool>,
    pub controller: Arc<Controller>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("is_ready", &self.is_ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/status", get(status_handler))
        .route("/status/{scope}/{name}", get(unit_status_handler))
        .route("/units/{scope}/{name}/reconcile", post(reconcile_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve; marks the state ready once the listener is bound
pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let app = router(Arc::clone(&state));

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);
    state.is_ready.store(true, Ordering::Relaxed);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.controller.status().view())
}

async fn unit_status_handler(
    State(state): State<Arc<ServerState>>,
    Path((scope, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let id = UnitId::new(scope, name);
    match state.controller.status().unit_view(&id) {
        Some(view) => (StatusCode::OK, Json(json!(view))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown unit {id}") })),
        ),
    }
}

async fn reconcile_handler(
    State(state): State<Arc<ServerState>>,
    Path((scope, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let id = UnitId::new(scope, name);
    match state.controller.request_reconcile(&id) {
        Ok(generation) => (
            StatusCode::ACCEPTED,
            Json(json!({ "unit": id.to_string(), "generation": generation })),
        ),
        Err(e @ ControllerError::UnknownUnit(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() })))
        }
        Err(e @ ControllerError::NotLoaded) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::reconciler::Reconciler;
    use crate::controller::runtime::ControllerSettings;
    use crate::controller::secrets::SecretPipeline;
    use crate::provider::memory::{InMemoryTarget, StaticSecretSource};
    use crate::provider::{SecretSourceProvider, TargetProvider};
    use crate::source::Snapshot;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(ready: bool) -> Arc<ServerState> {
        let target = Arc::new(InMemoryTarget::new()) as Arc<dyn TargetProvider>;
        let secrets = Arc::new(SecretPipeline::new(
            Arc::new(StaticSecretSource::new()) as Arc<dyn SecretSourceProvider>,
            Arc::clone(&target),
            Duration::from_secs(5),
        ));
        let reconciler = Arc::new(Reconciler::new(
            target,
            secrets,
            Duration::from_secs(5),
            Duration::from_millis(100),
        ));
        let controller = Arc::new(Controller::new(
            reconciler,
            ControllerSettings {
                tick_interval: Duration::from_secs(1),
                max_concurrent_reconciliations: 2,
                stall_factor: 3,
                default_unit_interval: Duration::from_secs(300),
            },
        ));
        Arc::new(ServerState {
            is_ready: Arc::new(AtomicBool::new(ready)),
            controller,
        })
    }

    fn load(state: &ServerState) {
        let snapshot = Snapshot::from_files([(
            "units.yaml",
            "apiVersion: reconcile.gitops.io/v1\nkind: Unit\nmetadata:\n  name: web\n  namespace: apps\nspec:\n  sourcePath: web\n",
        )])
        .unwrap();
        state.controller.load_snapshot(Arc::new(snapshot)).unwrap();
    }

    async fn call(state: Arc<ServerState>, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_readyz_follows_state() {
        let (status, _) = call(state(false), "GET", "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = call(state(true), "GET", "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(state(false), "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_view() {
        let state = state(true);
        load(&state);

        let (status, body) = call(Arc::clone(&state), "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["units"][0]["id"], "apps/web");
        assert_eq!(body["units"][0]["state"], "Pending");

        let (status, body) = call(Arc::clone(&state), "GET", "/status/apps/web").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generation"], 1);

        let (status, _) = call(state, "GET", "/status/apps/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reconcile_endpoint() {
        let state = state(true);
        let (status, _) = call(Arc::clone(&state), "POST", "/units/apps/web/reconcile").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        load(&state);
        let (status, body) = call(Arc::clone(&state), "POST", "/units/apps/web/reconcile").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["generation"], 2);

        let (status, _) = call(state, "POST", "/units/apps/other/reconcile").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
