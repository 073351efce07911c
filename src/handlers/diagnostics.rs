use crate::{coordinator::WorkspaceRouter, models::DiagnosticsResponse, routes::auth_middleware::Principal, services::auth_service};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::Arc;
use tracing::info;

/// Aggregate counters over every live coordinator
pub async fn diagnostics(
    State(router): State<Arc<WorkspaceRouter>>,
    Extension(principal): Extension<Principal>,
) -> (StatusCode, Json<DiagnosticsResponse>) {
    let stats = router.stats().await;
    let n_workspaces = stats.len() as u32;
    let n_conn: u32 = stats.iter().map(|s| s.connections as u32).sum();
    let n_present_users: u32 = stats.iter().map(|s| s.present_users as u32).sum();
    let n_pending_alarms = stats.iter().filter(|s| s.alarm.is_some()).count() as u32;
    let n_identity_cache = auth_service::identity_cache().entry_count() as u32;

    info!(
        "Diagnostics for {} ({}): Workspaces: {}, Conn: {}, Users: {}, Alarms: {}",
        principal.subject,
        principal.token_type,
        n_workspaces,
        n_conn,
        n_present_users,
        n_pending_alarms
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_workspaces,
            n_conn,
            n_present_users,
            n_pending_alarms,
            n_identity_cache,
        }),
    )
}
