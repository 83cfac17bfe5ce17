//! HTTP server: swap API, health probes and Prometheus metrics

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use htlc_core::SwapCoordinator;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::api;
use crate::ingest::{shutdown_requested, PollingDispatcher};
use crate::metrics::Metrics;

pub type SharedMetrics = Arc<Metrics>;

/// Combined app state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SwapCoordinator>,
    pub metrics: SharedMetrics,
    /// Absent when no polling adapters are configured
    pub dispatcher: Option<Arc<PollingDispatcher>>,
    pub instance_id: String,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<SwapCoordinator>,
        metrics: SharedMetrics,
        dispatcher: Option<Arc<PollingDispatcher>>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            metrics,
            dispatcher,
            instance_id: instance_id.into(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip readiness once startup recovery has finished
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub instance_id: String,
    pub ready: bool,
    pub breaker_active: bool,
    pub emergency_pause: bool,
    pub polling_adapters: bool,
}

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let breaker = state.coordinator.breaker_status().await;
    let status = if breaker.halted() { "halted" } else { "healthy" };
    Json(HealthResponse {
        status: status.to_string(),
        instance_id: state.instance_id.clone(),
        ready: state.is_ready(),
        breaker_active: breaker.active,
        emergency_pause: breaker.emergency_pause,
        polling_adapters: state.dispatcher.as_ref().is_some_and(|d| !d.is_empty()),
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness probe (open swaps re-registered with the consensus verifier)
async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let breaker = state.coordinator.breaker_status().await;
    state.metrics.observe_breaker(&breaker);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

/// All routes over `state`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/swaps", post(api::initiate_swap).get(api::list_swaps))
        .route("/swaps/{swap_id}", get(api::swap_status))
        .route("/swaps/{swap_id}/claim", post(api::claim_swap))
        .route("/swaps/{swap_id}/refund", post(api::refund_swap))
        .route("/attestations", post(api::report_attestation))
        .route("/breaker", get(api::breaker_status))
        .route("/breaker/emergency", post(api::emergency_approval))
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve until the shutdown channel flips
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);
    info!("  /swaps   - Initiate, list, claim and refund");
    info!("  /health  - Full health status (JSON)");
    info!("  /metrics - Prometheus metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;

    info!("API server stopped");
    Ok(())
}
