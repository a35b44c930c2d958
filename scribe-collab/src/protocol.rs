//! JSON wire protocol for the collaboration relay.
//!
//! Every WebSocket text frame carries exactly one event object, tagged by
//! its `event` field:
//!
//! ```text
//! {"event":"collab:join","roomId":"f1"}
//! {"event":"collab:leave","roomId":"f1"}
//! {"event":"collab:sync:request","roomId":"f1","from":"<connection uuid>"}
//! {"event":"collab:sync","roomId":"f1","content":"...","to":"<connection uuid>"}
//! {"event":"collab:op","roomId":"f1","op":{"type":"insert","index":6,"text":"there "}}
//! ```
//!
//! `from` is stamped by the relay when it forwards a sync request; a
//! responder copies it into `to` so the snapshot reaches only the requester.
//! Both are optional on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::diff::Operation;

/// Identifies one file. Doubles as the room id on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies the project that owns a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Relay-assigned identity of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Top-level protocol event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum CollabEvent {
    #[serde(rename = "collab:join", rename_all = "camelCase")]
    Join { room_id: DocumentId },

    #[serde(rename = "collab:leave", rename_all = "camelCase")]
    Leave { room_id: DocumentId },

    #[serde(rename = "collab:sync:request", rename_all = "camelCase")]
    SyncRequest {
        room_id: DocumentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
    },

    #[serde(rename = "collab:sync", rename_all = "camelCase")]
    Sync {
        room_id: DocumentId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<ConnectionId>,
    },

    #[serde(rename = "collab:op", rename_all = "camelCase")]
    Op { room_id: DocumentId, op: Operation },
}

impl CollabEvent {
    pub fn join(room_id: DocumentId) -> Self {
        CollabEvent::Join { room_id }
    }

    pub fn leave(room_id: DocumentId) -> Self {
        CollabEvent::Leave { room_id }
    }

    pub fn sync_request(room_id: DocumentId) -> Self {
        CollabEvent::SyncRequest {
            room_id,
            from: None,
        }
    }

    pub fn sync(room_id: DocumentId, content: impl Into<String>, to: Option<ConnectionId>) -> Self {
        CollabEvent::Sync {
            room_id,
            content: content.into(),
            to,
        }
    }

    pub fn op(room_id: DocumentId, op: Operation) -> Self {
        CollabEvent::Op { room_id, op }
    }

    /// Room this event is addressed to.
    pub fn room_id(&self) -> &DocumentId {
        match self {
            CollabEvent::Join { room_id }
            | CollabEvent::Leave { room_id }
            | CollabEvent::SyncRequest { room_id, .. }
            | CollabEvent::Sync { room_id, .. }
            | CollabEvent::Op { room_id, .. } => room_id,
        }
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            CollabEvent::Join { .. } => "collab:join",
            CollabEvent::Leave { .. } => "collab:leave",
            CollabEvent::SyncRequest { .. } => "collab:sync:request",
            CollabEvent::Sync { .. } => "collab:sync",
            CollabEvent::Op { .. } => "collab:op",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let event = CollabEvent::join("file-1".into());
        let value: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "collab:join", "roomId": "file-1"}));
    }

    #[test]
    fn test_op_wire_shape() {
        let event = CollabEvent::op("file-1".into(), Operation::insert(6, "there "));
        let value: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "collab:op",
                "roomId": "file-1",
                "op": {"type": "insert", "index": 6, "text": "there "}
            })
        );
    }

    #[test]
    fn test_optional_routing_fields_omitted() {
        let event = CollabEvent::sync_request("f".into());
        assert_eq!(
            event.encode().unwrap(),
            r#"{"event":"collab:sync:request","roomId":"f"}"#
        );

        let event = CollabEvent::sync("f".into(), "body", None);
        assert_eq!(
            event.encode().unwrap(),
            r#"{"event":"collab:sync","roomId":"f","content":"body"}"#
        );
    }

    #[test]
    fn test_decode_browser_frames() {
        let event = CollabEvent::decode(
            r#"{"event":"collab:op","roomId":"abc","op":{"type":"delete","index":3,"text":"","length":2}}"#,
        )
        .unwrap();
        assert_eq!(event, CollabEvent::op("abc".into(), Operation::delete(3, 2)));

        let event = CollabEvent::decode(r#"{"event":"collab:sync","roomId":"abc","content":"x"}"#)
            .unwrap();
        assert_eq!(event, CollabEvent::sync("abc".into(), "x", None));
    }

    #[test]
    fn test_sync_routing_roundtrip() {
        let requester = ConnectionId::new();
        let event = CollabEvent::sync("doc".into(), "full text", Some(requester));
        let decoded = CollabEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(CollabEvent::decode("not json").is_err());
        assert!(CollabEvent::decode(r#"{"event":"collab:unknown","roomId":"a"}"#).is_err());
        assert!(CollabEvent::decode(r#"{"event":"collab:join"}"#).is_err());
    }

    #[test]
    fn test_room_id_and_name() {
        let event = CollabEvent::leave("room".into());
        assert_eq!(event.room_id().as_str(), "room");
        assert_eq!(event.name(), "collab:leave");
        assert_eq!(
            CollabEvent::sync_request("room".into()).name(),
            "collab:sync:request"
        );
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ProtocolError::ConnectionClosed.to_string(), "Connection closed");
        assert!(ProtocolError::DeserializationError("eof".into())
            .to_string()
            .contains("eof"));
    }
}
