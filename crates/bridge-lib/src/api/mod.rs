//! HTTP surface of the bridge
//!
//! The app routes used by the platform controller share one listener with
//! the health probes and the Prometheus scrape endpoint.

mod apps;
mod error;


pub use apps::{DesiredLrpResponse, InstancesResponse, SchedulingInfosResponse};
pub use error::ApiError;

use crate::bifrost::Bifrost;
use crate::health::{ComponentStatus, HealthRegistry};
use crate::observability::BridgeMetrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Consecutive platform failures after which bifrost is reported unhealthy
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub bifrost: Arc<dyn Bifrost>,
    pub health_registry: HealthRegistry,
    pub metrics: BridgeMetrics,
    /// Platform failures since the last successful bifrost call
    platform_failures: Arc<AtomicU32>,
}

impl AppState {
    pub fn new(bifrost: Arc<dyn Bifrost>, health_registry: HealthRegistry, metrics: BridgeMetrics) -> Self {
        Self {
            bifrost,
            health_registry,
            metrics,
            platform_failures: Arc::new(AtomicU32::new(0)),
        }
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, [("content-type", "text/plain; charset=utf-8")], Vec::new());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/apps", get(apps::list))
        .route("/apps/:guid", put(apps::desire).post(apps::update_by_guid))
        .route("/apps/:guid/:version", get(apps::get_app).post(apps::update))
        .route("/apps/:guid/:version/instances", get(apps::get_instances))
        .route("/apps/:guid/:version/stop", put(apps::stop))
        .route("/apps/:guid/:version/stop/:index", put(apps::stop_instance))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until a shutdown signal arrives
pub async fn serve(port: u16, state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
