use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::models::PresenceEntry;
use crate::store::Bookmark;

/// Events fanned out to every live connection of a workspace
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum BroadcastMessage {
    #[serde(rename = "join", rename_all = "camelCase")]
    Join { user_id: String, display_name: String },
    #[serde(rename = "leave", rename_all = "camelCase")]
    Leave { user_id: String },
    /// Application data, routed without inspection
    #[serde(rename = "data")]
    Data { payload: Value },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ReceivedMessage {
    #[serde(rename = "data")]
    Data { payload: Value },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeMessage {
    pub connection_id: u64,
    pub incarnation: uuid::Uuid,
    /// Absent when storage could not be read
    pub bookmark: Option<Bookmark>,
    pub presence: Vec<PresenceEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReplayMessage {
    pub bookmark: Option<Bookmark>,
    /// Entries the client never saw were compacted away; it has to resync.
    pub truncated: bool,
    pub entries: Vec<Value>,
}

/// Frames addressed to a single connection
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum SendMessage {
    #[serde(rename = "welcome")]
    Welcome(WelcomeMessage),
    #[serde(rename = "replay")]
    Replay(ReplayMessage),
    #[serde(rename = "pong")]
    Pong { date: String },
    #[serde(rename = "error")]
    Error { message: String },
}
