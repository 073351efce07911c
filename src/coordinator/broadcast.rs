use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use super::registry::ConnectionRegistry;
use crate::models::{BroadcastMessage, ConnectionId};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: Vec<ConnectionId>,
}

/// Deliver `message` to every live connection not in `exclude`.
///
/// Each target gets a non-blocking enqueue on its own outbox, so a slow or
/// dead peer costs nothing to the others. Failed targets are only reported;
/// removing them stays with the transport's close path.
pub fn broadcast(registry: &ConnectionRegistry, message: &BroadcastMessage, exclude: &[ConnectionId]) -> FanoutReport {
    let frame = match serde_json::to_string(message) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to serialize broadcast message: {}", e);
            return FanoutReport::default();
        }
    };

    let mut report = FanoutReport::default();
    for record in registry.iter().filter(|r| !exclude.contains(&r.id)) {
        match record.outbox.try_send(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!("Outbox of {} ({}) is full, dropping frame", record.id, record.identity.user_id);
                report.failed.push(record.id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbox of {} is closed, skipping", record.id);
                report.failed.push(record.id);
            }
        }
    }
    report
}

/// Send a frame to a single connection; same failure policy as [`broadcast`].
pub fn send_to(registry: &ConnectionRegistry, id: ConnectionId, frame: String) -> bool {
    let Some(record) = registry.get(id) else {
        return false;
    };
    match record.outbox.try_send(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send frame to {}: {}", id, e);
            false
        }
    }
}
