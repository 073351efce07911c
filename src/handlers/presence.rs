use crate::{coordinator::WorkspaceRouter, models::{ErrorResponse, PresenceResponse, WorkspaceId}, routes::auth_middleware::Principal};
use axum::{extract::{State, Path, Extension}, http::StatusCode, Json};
use std::sync::Arc;
use tracing::{debug, error};

/// Current presence of a workspace. A workspace without a live coordinator
/// has nobody present; it is not started just to answer.
pub async fn workspace_presence(
    State(router): State<Arc<WorkspaceRouter>>,
    Extension(principal): Extension<Principal>,
    Path(workspace_id): Path<String>,
) -> Result<(StatusCode, Json<PresenceResponse>), (StatusCode, Json<ErrorResponse>)> {
    debug!("{} requested presence of workspace {}", principal.subject, workspace_id);
    let workspace = WorkspaceId::new(workspace_id.clone());

    let Some(handle) = router.get(&workspace).await else {
        return Ok((StatusCode::OK, Json(PresenceResponse {
            workspace_id,
            live: false,
            presence: Vec::new(),
        })));
    };

    match handle.list_presence().await {
        Ok(presence) => Ok((StatusCode::OK, Json(PresenceResponse {
            workspace_id,
            live: true,
            presence,
        }))),
        Err(e) => {
            error!("Failed to list presence of workspace {}: {}", workspace, e);
            let status = StatusCode::SERVICE_UNAVAILABLE;
            Err((status, Json(ErrorResponse::new(status, format!("Workspace '{}' is not available", workspace)))))
        }
    }
}
