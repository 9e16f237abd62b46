//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::app::state::AppState;
use crate::deploy::BatchSnapshot;
use crate::errors::FleetError;
use crate::models::progress::DeployRequest;
use crate::models::rollback::RollbackResult;
use crate::models::target::{NewTarget, ServerTarget, ServerTestResult};
use crate::utils::version_info;

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = match &self {
            FleetError::ValidationError { .. } | FleetError::JsonError(_) => {
                StatusCode::BAD_REQUEST
            }
            FleetError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Conflict(_) => StatusCode::CONFLICT,
            FleetError::ConnectionError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }

        let field = match &self {
            FleetError::ValidationError { field, .. } => Some(field.to_string()),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.to_string(),
            field,
        };
        (status, Json(body)).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "fleetd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

// ===== Servers =====

pub async fn list_servers_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ServerTarget>> {
    Json(state.registry.list().await)
}

pub async fn add_server_handler(
    State(state): State<Arc<AppState>>,
    Json(new_target): Json<NewTarget>,
) -> Result<(StatusCode, Json<ServerTarget>), FleetError> {
    let target = state.registry.add(new_target).await?;
    Ok((StatusCode::CREATED, Json(target)))
}

/// Remove response
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub removed: bool,
}

/// Removing an unknown id succeeds with `removed: false`; a busy server is
/// a conflict
pub async fn remove_server_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RemoveResponse>, FleetError> {
    let removed = state.remove_server(&id).await?;
    Ok(Json(RemoveResponse { removed }))
}

pub async fn test_server_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ServerTestResult>, FleetError> {
    Ok(Json(state.test_server(&id).await?))
}

/// Tests every pending or failed server
pub async fn test_pending_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ServerTestResult>>, FleetError> {
    Ok(Json(state.test_pending().await?))
}

pub async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RollbackResult>, FleetError> {
    Ok(Json(state.rollback.rollback(&id).await?))
}

// ===== Batches =====

/// Batch started response
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchStartedResponse {
    pub batch_id: String,
}

pub async fn start_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> Result<(StatusCode, Json<BatchStartedResponse>), FleetError> {
    let handle = state.coordinator.start_batch(request.server_ids).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchStartedResponse {
            batch_id: handle.batch_id,
        }),
    ))
}

pub async fn batch_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BatchSnapshot>, FleetError> {
    Ok(Json(state.coordinator.snapshot(&id).await?))
}

pub async fn cancel_batch_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<BatchSnapshot>), FleetError> {
    state.coordinator.cancel_batch(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(state.coordinator.snapshot(&id).await?)))
}
