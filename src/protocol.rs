//! Wire protocol for differential synchronization.
//!
//! Every socket message is a single JSON text frame:
//! ```text
//! ┌──────────┬──────────┬──────────────────────────┐
//! │ event    │ seq      │ data                     │
//! │ command  │ optional │ payload (varies by event)│
//! └──────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Inbound events carry a `seq` when the sender wants an acknowledgement;
//! the reply frame echoes the same `seq`. Field names on the wire are
//! camelCase, matching what browser clients produce.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::diff::Delta;

/// Wire event identifiers.
///
/// These strings are the public contract between server and clients;
/// changing any of them is a protocol break.
pub mod commands {
    /// Client joins a room and asks for the initial document.
    pub const JOIN: &str = "diffsync-join";
    /// Client ships a batch of edits and expects the server's changes back.
    pub const SYNC_WITH_SERVER: &str = "diffsync-send-edit";
    /// Broadcast to a room when one of its members pushed an edit.
    pub const REMOTE_UPDATE_INCOMING: &str = "diffsync-update-incoming";
    /// Error notification to a single connection.
    pub const ERROR: &str = "diffsync-error";
}

/// One step of change: a diff plus the versions it was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    /// Server version the diff was computed against.
    pub server_version: u64,
    /// Client version the diff was computed against.
    pub local_version: u64,
    /// The structural diff itself (may be empty).
    pub diff: Delta,
}

/// Inbound sync payload: a batch of edits for one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub room: String,
    /// When present and equal to the shadow's server version, the client
    /// has acknowledged everything up to it and the pending queue is
    /// flushed before the edits are applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u64>,
    #[serde(default)]
    pub edits: Vec<Edit>,
}

/// Reply to a sync: the server's pending edits for this client.
///
/// Sent even when no diff was produced — clients use empty replies as
/// acknowledgements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReply {
    pub local_version: u64,
    pub server_version: u64,
    pub edits: Vec<Edit>,
}

/// Join payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room: String,
    /// Identity forwarded to the adapter for load/store authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Build a frame with no sequence number (server-initiated events).
    pub fn event(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            seq: None,
            data,
        }
    }

    /// Build a reply frame echoing the request's sequence number.
    pub fn reply(event: &str, seq: Option<u64>, data: Value) -> Self {
        Self {
            event: event.to_string(),
            seq,
            data,
        }
    }

    /// Serialize to the JSON text wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON text wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the data payload as a join request.
    pub fn join_payload(&self) -> Result<JoinPayload, ProtocolError> {
        if self.event != commands::JOIN {
            return Err(ProtocolError::UnexpectedEvent(self.event.clone()));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the data payload as an edit message.
    pub fn edit_message(&self) -> Result<EditMessage, ProtocolError> {
        if self.event != commands::SYNC_WITH_SERVER {
            return Err(ProtocolError::UnexpectedEvent(self.event.clone()));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected event: {0}")]
    UnexpectedEvent(String),
}
