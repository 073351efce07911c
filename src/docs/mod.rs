use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Storage is reachable", body = ReadyResponse),
        (status = 503, description = "Storage is not reachable", body = ReadyResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Who is present in a workspace
#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{workspace_id}/presence",
    params(
        ("workspace_id" = String, Path, description = "Workspace identifier")
    ),
    responses(
        (status = 200, description = "Current presence, empty when no coordinator is live", body = PresenceResponse),
        (status = 401, description = "Missing or invalid token"),
        (status = 503, description = "Coordinator stopped while answering", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn workspace_presence_doc() {}

/// Counters over all live coordinators
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics", body = DiagnosticsResponse),
        (status = 401, description = "Missing or invalid token")
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        workspace_presence_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            ErrorResponse,
            Identity,
            PresenceEntry,
            PresenceResponse,
            DiagnosticsResponse,
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
