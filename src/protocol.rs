//! Wire data model shared with the server of record.
//!
//! Everything here is plain serde JSON: the RPC request/response payloads and
//! the messages pushed on a session's subscription topic. Field names follow
//! the server's camelCase convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::Version;
use crate::operation::Operation;

/// One atomic batch of edits attributable to one user, applied in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChange {
    pub document_id: String,
    pub user_id: String,
    pub version: Version,
    pub operations: Vec<Operation>,
    pub timestamp: DateTime<Utc>,
}

/// A user currently participating in a document session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub user_id: String,
    pub username: String,
    /// Opaque cursor/selection payload; the engine relays it untouched.
    #[serde(default)]
    pub cursor_position: String,
    pub last_active: DateTime<Utc>,
}

impl ActiveUser {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            cursor_position: String::new(),
            last_active: Utc::now(),
        }
    }
}

/// Roster-changed message pushed on the subscription topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PresenceUpdate {
    Join {
        user: ActiveUser,
    },
    Leave {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Cursor {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "cursorPosition")]
        cursor_position: String,
    },
}

/// Any message the subscription stream may deliver.
///
/// Untagged: a document change is just a serialized [`DocumentChange`], and
/// presence updates carry their own `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Change(DocumentChange),
    Presence(PresenceUpdate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    pub session_id: String,
    pub active_users: Vec<ActiveUser>,
    /// Subscription key for this document's change feed.
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSessionRequest {
    pub session_id: String,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSessionResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetActiveUsersRequest {
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetActiveUsersResponse {
    pub active_users: Vec<ActiveUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDocumentRequest {
    pub document_id: String,
    pub operations: Vec<Operation>,
    pub base_version: Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDocumentResponse {
    /// False means the base version was stale; `concurrent_changes` then holds
    /// everything accepted since it and `new_version` is the server's current.
    pub success: bool,
    pub new_version: Version,
    pub concurrent_changes: Vec<DocumentChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateActivityRequest {
    pub document_id: String,
    pub cursor_position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateActivityResponse {
    pub success: bool,
}

/// Serialize a topic message to JSON bytes.
pub fn encode_message(msg: &ServerMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Deserialize a topic payload. Callers drop (and log) malformed payloads.
pub fn decode_message(data: &[u8]) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_slice(data)
}
