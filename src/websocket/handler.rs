use std::sync::Arc;
use axum::{
    extract::{Extension, Path, Query, State, ws::{Message, WebSocket, WebSocketUpgrade}},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::coordinator::{CoordinatorHandle, WorkspaceRouter};
use crate::models::{ConnectionId, ErrorResponse, Identity, ReceivedMessage, SendMessage, WorkspaceId};
use crate::services::auth_service::{dev_identity, get_auth_token_from_headers, resolve_identity};
use crate::store::Bookmark;
use crate::utils::scope_guard::ScopeGuard;

/// Query parameters accepted on the upgrade request
#[derive(Deserialize, Debug, Default)]
pub struct ConnectQuery {
    pub token: Option<String>,
    /// Bookmark of the last data frame the client saw
    pub resume: Option<String>,
    /// Only honoured when development identities are enabled
    pub user: Option<String>,
    pub name: Option<String>,
}

fn reject(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse::new(status, error))).into_response()
}

/// Work out who is connecting: a query token first, then the Authorization
/// header or auth_token cookie. Development setups that opted in may name
/// the user in the query instead.
pub fn connection_identity(config: &Config, headers: &HeaderMap, query: &ConnectQuery) -> Result<Identity, String> {
    match config.cloud_auth_jwt_secret.as_deref() {
        Some(secret) => {
            let token = match &query.token {
                Some(token) => token.clone(),
                None => get_auth_token_from_headers(headers)?,
            };
            resolve_identity(&token, secret)
        }
        None if config.allows_dev_identities() => dev_identity(query.user.as_deref(), query.name.as_deref()),
        None => Err("No JWT secret configured".to_string()),
    }
}

fn error_frame(message: impl Into<String>) -> String {
    let frame = SendMessage::Error { message: message.into() };
    serde_json::to_string(&frame).unwrap_or_default()
}

/// WebSocket handler
pub async fn websocket_handler(
    Path(workspace_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(router): State<Arc<WorkspaceRouter>>,
    Extension(config): Extension<&'static Config>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    debug!("New WebSocket connection attempt for workspace {}", workspace_id);

    let identity = match connection_identity(config, &headers, &query) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected connection to workspace {}: {}", workspace_id, e);
            return reject(StatusCode::UNAUTHORIZED, e);
        }
    };

    let resume = match query.resume.as_deref().map(Bookmark::decode).transpose() {
        Ok(resume) => resume,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let workspace = WorkspaceId::new(workspace_id);
    let outbox_capacity = config.outbox_capacity.max(1);
    ws.on_upgrade(move |socket| handle_socket(socket, router, workspace, identity, resume, outbox_capacity))
}

/// Handle WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    router: Arc<WorkspaceRouter>,
    workspace: WorkspaceId,
    identity: Identity,
    resume: Option<Bookmark>,
    outbox_capacity: usize,
) {
    let id = router.next_connection_id();
    let (outbox, mut outbox_rx) = mpsc::channel::<String>(outbox_capacity);
    let (mut sender, receiver) = socket.split();

    let handle = match router.connect(&workspace, id, identity.clone(), outbox.clone(), resume).await {
        Ok((handle, report)) => {
            if let Some(e) = &report.storage_error {
                warn!("Connection {} joined workspace {} but presence was not persisted: {}", id, workspace, e);
            }
            handle
        }
        Err(e) => {
            error!("Connection {} to workspace {} refused: {}", id, workspace, e);
            let _ = sender.send(Message::Text(error_frame(e.to_string()))).await;
            let _ = sender.close().await;
            return;
        }
    };
    info!("WebSocket connection {} established for {} in workspace {}", id, identity.user_id, workspace);

    // Covers panics and aborted futures; the normal path disconnects below
    let guard = {
        let handle = handle.clone();
        ScopeGuard::new(move || handle.disconnect_detached(id))
    };

    // Drain the outbox into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(read_frames(receiver, handle.clone(), id, outbox));

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    guard.disarm();
    match handle.disconnect(id).await {
        Ok(report) => {
            if let Some(e) = report.storage_error {
                warn!("Connection {} left workspace {} but presence was not persisted: {}", id, workspace, e);
            }
        }
        Err(e) => debug!("Disconnect of {} not delivered: {}", id, e),
    }
    info!("WebSocket connection {} terminated", id);
}

async fn read_frames(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    handle: CoordinatorHandle,
    id: ConnectionId,
    reply: mpsc::Sender<String>,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ReceivedMessage>(&text) {
            Ok(ReceivedMessage::Data { payload }) => {
                if let Err(e) = handle.relay(id, payload).await {
                    warn!("Relay from {} failed: {}", id, e);
                    let _ = reply.try_send(error_frame(e.to_string()));
                }
            }
            Ok(ReceivedMessage::Ping) => {
                let pong = SendMessage::Pong { date: Utc::now().to_rfc3339() };
                if let Ok(frame) = serde_json::to_string(&pong) {
                    let _ = reply.try_send(frame);
                }
            }
            Err(e) => {
                debug!("Unreadable frame from {}: {}", id, e);
                let _ = reply.try_send(error_frame(format!("Unreadable message: {}", e)));
            }
        }
    }
}
