//! Outbox entry model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::RecordKey;

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Upsert,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert => f.write_str("upsert"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// A queued local mutation awaiting push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Idempotency key sent with the push; regenerated whenever the entry is replaced
    pub mutation_id: Uuid,
    pub table: String,
    pub id: String,
    pub operation: Operation,
    /// Local payload at enqueue time
    pub payload_snapshot: Value,
    /// Server version the local edit was made against; `None` means initial creation
    pub based_on_server_updated_at: Option<i64>,
    /// Failed push attempts, drives backoff
    pub attempts: u32,
    /// FIFO ordering key (Unix ms)
    pub enqueued_at: i64,
    /// Time of the last failed attempt (Unix ms)
    pub last_attempt_at: Option<i64>,
    /// Kept out of push batches until its conflict is resolved
    #[serde(default)]
    pub held: bool,
}

impl OutboxEntry {
    pub fn new(
        key: &RecordKey,
        operation: Operation,
        payload_snapshot: Value,
        based_on_server_updated_at: Option<i64>,
        enqueued_at: i64,
    ) -> Self {
        Self {
            mutation_id: Uuid::now_v7(),
            table: key.table.clone(),
            id: key.id.clone(),
            operation,
            payload_snapshot,
            based_on_server_updated_at,
            attempts: 0,
            enqueued_at,
            last_attempt_at: None,
            held: false,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }
}
