use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::models::{ConnectionId, Identity};

/// Outbound frame queue of one connection. Frames are pre-serialized JSON.
pub type ConnectionSender = mpsc::Sender<String>;

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub identity: Identity,
    pub outbox: ConnectionSender,
    pub connected_at: DateTime<Utc>,
}

/// Live connections of the current coordinator incarnation. Never persisted.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: HashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with the rejected record if the id is already live.
    pub fn insert(&mut self, record: ConnectionRecord) -> Result<(), ConnectionRecord> {
        if self.records.contains_key(&record.id) {
            return Err(record);
        }
        self.records.insert(record.id, record);
        Ok(())
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, user: &str) -> ConnectionRecord {
        let (outbox, _rx) = mpsc::channel(1);
        ConnectionRecord {
            id: ConnectionId::new(id),
            identity: Identity::new(user, user),
            outbox,
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected_without_replacing() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(record(1, "u1")).unwrap();

        let rejected = registry.insert(record(1, "u2")).unwrap_err();
        assert_eq!(rejected.identity.user_id, "u2");
        assert_eq!(registry.get(ConnectionId::new(1)).unwrap().identity.user_id, "u1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(record(1, "u1")).unwrap();
        assert!(registry.remove(ConnectionId::new(1)).is_some());
        assert!(registry.remove(ConnectionId::new(1)).is_none());
        assert!(registry.is_empty());
    }
}
