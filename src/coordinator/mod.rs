//! Per-workspace realtime coordination.
//!
//! Every workspace with live connections is served by exactly one
//! [`Coordinator`], a tokio task that owns the connection registry and the
//! presence ledger and processes its commands strictly one at a time. The
//! [`WorkspaceRouter`] creates coordinators lazily and evicts them once idle.

pub mod actor;
pub mod broadcast;
pub mod presence;
pub mod registry;
pub mod router;

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::models::{ConnectionId, WorkspaceId};
use crate::store::StoreError;

pub use actor::{Coordinator, CoordinatorHandle};
pub use broadcast::FanoutReport;
pub use registry::ConnectionSender;
pub use router::WorkspaceRouter;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Mirror presence entries into durable storage
    pub presence_mirror: bool,
    /// Delay between the last disconnect and the idle alarm
    pub idle_grace: Duration,
    /// Number of data messages kept for bookmark replay (0 disables the log)
    pub data_log_retention: usize,
    pub command_queue_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            presence_mirror: true,
            idle_grace: Duration::from_secs(60),
            data_log_retention: 256,
            command_queue_capacity: 256,
        }
    }
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            presence_mirror: config.presence_mirror,
            idle_grace: Duration::from_secs(config.idle_grace_secs),
            data_log_retention: config.data_log_retention,
            command_queue_capacity: config.command_queue_capacity.max(1),
        }
    }
}

#[derive(Debug)]
pub enum CoordinatorError {
    /// The connection id is already live; the caller broke the connect contract.
    AlreadyRegistered(ConnectionId),
    UnknownConnection(ConnectionId),
    Storage(StoreError),
    /// The coordinator task is gone.
    Unavailable(WorkspaceId),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::AlreadyRegistered(id) => write!(f, "Connection {} is already registered", id),
            CoordinatorError::UnknownConnection(id) => write!(f, "Connection {} is not registered", id),
            CoordinatorError::Storage(e) => write!(f, "Storage failure: {}", e),
            CoordinatorError::Unavailable(ws) => write!(f, "Coordinator for workspace '{}' is not running", ws),
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        CoordinatorError::Storage(e)
    }
}

/// Outcome of a connect. A storage failure on the presence mirror does not
/// undo the registration; it is reported here instead.
#[derive(Debug)]
pub struct ConnectReport {
    pub joined: bool,
    pub user_connections: usize,
    pub storage_error: Option<StoreError>,
}

#[derive(Debug)]
pub struct DisconnectReport {
    /// False when the connection was unknown (already closed).
    pub found: bool,
    pub left: bool,
    pub user_connections: usize,
    pub storage_error: Option<StoreError>,
}

impl DisconnectReport {
    fn unknown() -> Self {
        Self {
            found: false,
            left: false,
            user_connections: 0,
            storage_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    pub workspace: WorkspaceId,
    pub incarnation: uuid::Uuid,
    pub connections: usize,
    pub present_users: usize,
    pub alarm: Option<DateTime<Utc>>,
}
