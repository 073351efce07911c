//! Durable key/value storage consumed by the workspace coordinators.
//!
//! A [`DurableStore`] is always scoped to one workspace: keys written through it
//! can never collide with another workspace's keys. Besides plain key/value
//! access it offers atomic transactions, a single-slot alarm and bookmarks,
//! which are monotonically increasing tokens marking a point in the write
//! history of the store.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::models::WorkspaceId;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// Opaque resume token. Every write performed after a bookmark was taken is
/// strictly "newer" than it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bookmark(u64);

impl Bookmark {
    pub(crate) fn from_version(version: u64) -> Self {
        Self(version)
    }

    pub(crate) fn version(&self) -> u64 {
        self.0
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_be_bytes())
    }

    pub fn decode(token: &str) -> Result<Self, StoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| StoreError::InvalidBookmark(format!("{}: {}", token, e)))?;
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StoreError::InvalidBookmark(format!("{}: wrong length", token)))?;
        Ok(Self(u64::from_be_bytes(raw)))
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for Bookmark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Bookmark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Bookmark::decode(&token).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Database(sqlx::Error),
    Serialization(serde_json::Error),
    InvalidBookmark(String),
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::InvalidBookmark(token) => write!(f, "Invalid bookmark '{}'", token),
            StoreError::Unavailable(reason) => write!(f, "Storage unavailable: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e)
    }
}

/// Workspace-scoped durable storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Entries under `prefix` written after `since`, ordered by key.
    async fn list_since(&self, prefix: &str, since: Bookmark) -> Result<Vec<(String, Value)>, StoreError>;

    /// Starts an atomic read-modify-write. Nothing is visible to other
    /// readers until [`StoreTxn::commit`]; dropping the transaction discards it.
    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError>;

    /// Replaces any pending alarm.
    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn delete_alarm(&self) -> Result<(), StoreError>;

    async fn bookmark(&self) -> Result<Bookmark, StoreError>;
}

#[async_trait]
pub trait StoreTxn: Send {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError>;

    async fn delete(&mut self, key: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Hands out the store of a workspace.
pub trait StorageBackend: Send + Sync {
    fn open(&self, workspace: &WorkspaceId) -> Arc<dyn DurableStore>;

    fn name(&self) -> &'static str;
}

/// Key layout inside a workspace store
pub mod keys {
    pub const PRESENCE_PREFIX: &str = "presence/";
    pub const LOG_PREFIX: &str = "log/";
    pub const LOG_SEQ: &str = "meta/log_seq";
    /// Bookmark below which compaction may have removed log entries
    pub const LOG_FLOOR: &str = "meta/log_floor";

    pub fn presence(user_id: &str) -> String {
        format!("{}{}", PRESENCE_PREFIX, user_id)
    }

    /// Zero padded so that key order equals append order.
    pub fn log_entry(seq: u64) -> String {
        format!("{}{:020}", LOG_PREFIX, seq)
    }
}
