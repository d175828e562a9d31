//! Server-side change and push outcome models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RecordKey;

/// Rejection reason meaning the server already holds a newer version
pub const REJECTION_CONFLICT: &str = "conflict";

/// A change pulled from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub table: String,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
    pub server_updated_at: i64,
    /// The server deleted the record
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteChange {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }
}

/// Per-entry result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    Accepted,
    Rejected,
}

/// Server verdict for one pushed outbox entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub table: String,
    pub id: String,
    pub outcome: PushStatus,
    /// Version the server recorded (accepted) or currently holds (rejected)
    #[serde(default)]
    pub server_updated_at: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Current server payload, when the server embeds it in a conflict rejection
    #[serde(default)]
    pub server_payload: Option<Value>,
    #[serde(default)]
    pub server_deleted: bool,
}

impl PushOutcome {
    pub fn accepted(key: &RecordKey, server_updated_at: i64) -> Self {
        Self {
            table: key.table.clone(),
            id: key.id.clone(),
            outcome: PushStatus::Accepted,
            server_updated_at: Some(server_updated_at),
            reason: None,
            server_payload: None,
            server_deleted: false,
        }
    }

    pub fn rejected(key: &RecordKey, reason: impl Into<String>) -> Self {
        Self {
            table: key.table.clone(),
            id: key.id.clone(),
            outcome: PushStatus::Rejected,
            server_updated_at: None,
            reason: Some(reason.into()),
            server_payload: None,
            server_deleted: false,
        }
    }

    /// Conflict rejection carrying the server's current version
    #[must_use]
    pub fn with_server_version(mut self, payload: Value, server_updated_at: i64) -> Self {
        self.server_payload = Some(payload);
        self.server_updated_at = Some(server_updated_at);
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }

    pub fn is_conflict(&self) -> bool {
        self.outcome == PushStatus::Rejected && self.reason.as_deref() == Some(REJECTION_CONFLICT)
    }
}
