//! JSON wire frames exchanged with clients: `{"event": "...", "data": ...}`.

use serde::{Deserialize, Serialize};

use super::snapshot::SnapshotEntry;

pub const ROOM_UPDATE_EVENT: &str = "room-update";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(String),
    Snapshot(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent<'a> {
    RoomUpdate(&'a str),
    Snapshot(&'a [SnapshotEntry]),
    Error(&'a str),
}

impl ServerEvent<'_> {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to encode server event");
            String::new()
        })
    }
}
