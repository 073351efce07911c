mod models;
mod handlers;
mod routes;
mod docs;
mod websocket;
mod config;
mod store;
mod coordinator;
mod services;
mod utils;

use axum::{http::HeaderValue, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use routes::create_api_routes;
use docs::ApiDoc;
use config::{Config, init_config};
use coordinator::{CoordinatorSettings, WorkspaceRouter};
use store::{MemoryBackend, PostgresBackend, StorageBackend};
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use std::panic;

async fn open_backend(config: &Config) -> Arc<dyn StorageBackend> {
    let Some(db_url) = &config.db_url else {
        warn!("No database URL configured - workspace state will not survive a restart");
        return Arc::new(MemoryBackend::new());
    };

    match PostgresBackend::connect(db_url).await {
        Ok(backend) => {
            info!("Database initialized successfully");
            Arc::new(backend)
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            warn!("Falling back to in-memory storage");
            Arc::new(MemoryBackend::new())
        }
    }
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any))
}

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "colabri_workspace=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = init_config(Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    }));
    info!(
        "Service {} ({} environment, pod {}, log level {})",
        config.cloud_service_name,
        config.environment,
        config.cloud_pod.as_deref().unwrap_or("local"),
        config.log_level
    );
    if config.allows_dev_identities() {
        warn!("DEV_AUTH_BYPASS is on - sockets accept unauthenticated ?user= identities");
    } else if config.cloud_auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - every connection will be refused");
    }

    let backend = open_backend(config).await;
    let router = WorkspaceRouter::new(backend, CoordinatorSettings::from(config));

    // Combine all routes
    let mut app_routes = Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(router, config))
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http());
    if let Some(cors) = cors_layer(config) {
        app_routes = app_routes.layer(cors);
    }

    // Start the HTTP/API server
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 Workspace sockets at ws://{}/api/v1/workspaces/{{workspace_id}}/ws", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    if let Err(e) = axum::serve(listener, app_routes).await {
        error!("Server failed: {}", e);
    }
}
