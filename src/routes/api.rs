use crate::{
    config::Config,
    coordinator::WorkspaceRouter,
    handlers::{diagnostics, health_check, ready_check, workspace_presence},
    routes::auth_middleware::auth_middleware,
    websocket::websocket_handler,
};
use axum::{routing::get, Extension, Router, middleware};
use std::sync::Arc;

/// Create API routes
pub fn create_api_routes(router: Arc<WorkspaceRouter>, config: &'static Config) -> Router {
    let protected = Router::<Arc<WorkspaceRouter>>::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/workspaces/:workspace_id/presence", get(workspace_presence))
        .route_layer(middleware::from_fn(auth_middleware)); // Applies to all routes added above

    // The socket authenticates itself, browsers can't set headers on an upgrade
    Router::<Arc<WorkspaceRouter>>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/workspaces/:workspace_id/ws", get(websocket_handler))
        .merge(protected)
        .layer(Extension(config))
        .with_state(router)
}
