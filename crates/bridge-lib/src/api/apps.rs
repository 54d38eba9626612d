//! App handlers: HTTP requests in, Bifrost calls out

use super::{ApiError, AppState, UNHEALTHY_AFTER_FAILURES};
use crate::error::{BifrostError, WorkloadError};
use crate::health::components;
use crate::models::{DesireLrpRequest, DesiredLrp, Identifier, Instance, SchedulingInfo, UpdateRequest};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulingInfosResponse {
    pub desired_lrp_scheduling_infos: Vec<SchedulingInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DesiredLrpResponse {
    pub desired_lrp: DesiredLrp,
}

/// Instances together with the lookup error, if any
#[derive(Debug, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub process_guid: String,
    pub instances: Vec<Instance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppState {
    /// Count the response and hand it back to axum
    fn finish<T: IntoResponse>(&self, endpoint: &str, result: Result<T, ApiError>) -> Response {
        let response = result.into_response();
        self.metrics
            .inc_http_request(endpoint, response.status().as_u16());
        response
    }

    /// Platform failures degrade the bifrost component, and a run of them
    /// marks it unhealthy; anything else resets it to healthy
    async fn observe<T>(&self, result: &Result<T, BifrostError>) {
        match result {
            Err(BifrostError::Workload(e @ (WorkloadError::Api(_) | WorkloadError::Timeout(_)))) => {
                let failures = self.platform_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= UNHEALTHY_AFTER_FAILURES {
                    self.health_registry
                        .set_unhealthy(components::BIFROST, e.to_string())
                        .await;
                } else {
                    self.health_registry
                        .set_degraded(components::BIFROST, e.to_string())
                        .await;
                }
            }
            _ => {
                self.platform_failures.store(0, Ordering::Relaxed);
                self.health_registry.set_healthy(components::BIFROST).await;
            }
        }
    }
}

pub async fn desire(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
    body: Bytes,
) -> Response {
    let result = async {
        let mut request: DesireLrpRequest = serde_json::from_slice(&body).map_err(|e| {
            error!(
                event = "request-body-decoding-failed",
                session = "desire-app",
                guid = %guid,
                error = %e,
                "Failed to decode desire request"
            );
            ApiError::InvalidRequest(e.to_string())
        })?;
        request.lrp = String::from_utf8_lossy(&body).into_owned();

        debug!(session = "desire-app", guid = %guid, process_guid = %request.process_guid, "Desiring app");
        let outcome = state.bifrost.transfer(request).await;
        state.observe(&outcome).await;
        outcome.map_err(|e| {
            error!(event = "bifrost-failed", session = "desire-app", guid = %guid, error = %e, "Failed to desire app");
            ApiError::InvalidRequest(e.to_string())
        })?;

        Ok::<_, ApiError>(StatusCode::OK)
    }
    .await;

    state.finish("desire_app", result)
}

pub async fn list(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.bifrost.list().await;
    state.observe(&outcome).await;

    let result = outcome
        .map(|infos| {
            Json(SchedulingInfosResponse {
                desired_lrp_scheduling_infos: infos,
            })
        })
        .map_err(|e| {
            error!(event = "bifrost-failed", session = "list-apps", guid = "", error = %e, "Failed to list apps");
            ApiError::Internal(e.to_string())
        });

    state.finish("list_apps", result)
}

pub async fn get_app(
    State(state): State<Arc<AppState>>,
    Path((guid, version)): Path<(String, String)>,
) -> Response {
    let identifier = Identifier::new(guid, version);
    let outcome = state.bifrost.get_app(&identifier).await;
    state.observe(&outcome).await;

    let result = outcome
        .map(|desired_lrp| Json(DesiredLrpResponse { desired_lrp }))
        .map_err(|e| {
            debug!(session = "get-app", guid = %identifier.guid, error = %e, "App not available");
            ApiError::NotFound(e.to_string())
        });

    state.finish("get_app", result)
}

/// Always 200: a lookup error travels in the body next to the instances found
pub async fn get_instances(
    State(state): State<Arc<AppState>>,
    Path((guid, version)): Path<(String, String)>,
) -> Response {
    let identifier = Identifier::new(guid, version);
    let query = state.bifrost.get_instances(&identifier).await;

    if let Some(e) = &query.error {
        error!(
            event = "bifrost-failed",
            session = "get-app-instances",
            guid = %identifier.guid,
            error = %e,
            "Failed to get app instances"
        );
    }

    let response = InstancesResponse {
        process_guid: identifier.process_guid(),
        instances: query.instances,
        error: query.error.map(|e| e.to_string()),
    };
    state.finish("get_app_instances", Ok::<_, ApiError>(Json(response)))
}

/// Update addressed by guid and version in the path
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path((guid, version)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = run_update(&state, &guid, Some(&version), &body).await;
    state.finish("update_app", result)
}

/// Update addressed by guid only, with the version in the body
pub async fn update_by_guid(
    State(state): State<Arc<AppState>>,
    Path(guid): Path<String>,
    body: Bytes,
) -> Response {
    let result = run_update(&state, &guid, None, &body).await;
    state.finish("update_app", result)
}

async fn run_update(
    state: &AppState,
    guid: &str,
    version: Option<&str>,
    body: &[u8],
) -> Result<StatusCode, ApiError> {
    let mut request: UpdateRequest = serde_json::from_slice(body).map_err(|e| {
        error!(
            event = "json-decoding-failed",
            session = "update-app",
            guid = %guid,
            error = %e,
            "Failed to decode update request"
        );
        ApiError::InvalidRequest(e.to_string())
    })?;

    if request.guid.is_empty() {
        request.guid = guid.to_string();
    }
    if let Some(version) = version.filter(|_| request.version.is_empty()) {
        request.version = version.to_string();
    }

    let outcome = state.bifrost.update(request).await;
    state.observe(&outcome).await;
    outcome.map_err(|e| {
        error!(event = "bifrost-failed", session = "update-app", guid = %guid, error = %e, "Failed to update app");
        ApiError::Internal(e.to_string())
    })?;

    Ok(StatusCode::OK)
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path((guid, version)): Path<(String, String)>,
) -> Response {
    let identifier = Identifier::new(guid, version);
    let outcome = state.bifrost.stop(&identifier).await;
    state.observe(&outcome).await;

    let result = outcome.map(|()| StatusCode::OK).map_err(|e| {
        error!(event = "bifrost-failed", session = "stop-app", guid = %identifier.guid, error = %e, "Failed to stop app");
        ApiError::Internal(e.to_string())
    });

    state.finish("stop_app", result)
}

pub async fn stop_instance(
    State(state): State<Arc<AppState>>,
    Path((guid, version, index)): Path<(String, String, String)>,
) -> Response {
    let identifier = Identifier::new(guid, version);

    let result = async {
        let index: u32 = index.parse().map_err(|e| {
            error!(
                event = "parsing-instance-index-failed",
                session = "stop-app-instance",
                guid = %identifier.guid,
                index = %index,
                error = %e,
                "Instance index is not a non-negative integer"
            );
            ApiError::InvalidRequest(format!("invalid instance index {:?}", index))
        })?;

        let outcome = state.bifrost.stop_instance(&identifier, index).await;
        state.observe(&outcome).await;
        outcome.map_err(|e| {
            error!(
                event = "bifrost-failed",
                session = "stop-app-instance",
                guid = %identifier.guid,
                index,
                error = %e,
                "Failed to stop app instance"
            );
            ApiError::Internal(e.to_string())
        })?;

        Ok::<_, ApiError>(StatusCode::OK)
    }
    .await;

    state.finish("stop_app_instance", result)
}
