use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use crate::coordinator::WorkspaceRouter;
use crate::models::{HealthResponse, ReadyResponse};
use tracing::{debug, error};

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint; ready once the storage backend answers
pub async fn ready_check(
    State(router): State<Arc<WorkspaceRouter>>,
) -> (StatusCode, Json<ReadyResponse>) {
    debug!("Readiness check requested");
    match router.check_storage().await {
        Ok(()) => (StatusCode::OK, Json(ReadyResponse::ready())),
        Err(e) => {
            error!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse::unavailable(format!("Storage is not reachable: {}", e))),
            )
        }
    }
}
