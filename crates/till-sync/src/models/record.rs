//! Sync record model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Address of a record: table name plus an id that is unique within the table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Flattened `table/id` form, used as the id of bookkeeping rows
    pub fn storage_id(&self) -> String {
        format!("{}/{}", self.table, self.id)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// Where a record stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local copy matches the last version acknowledged by the server
    #[default]
    Synced,
    /// A local mutation is queued in the outbox
    Pending,
    /// Local and server diverged; waiting for a human decision
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// The unit of synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Logical entity collection
    pub table: String,
    /// Stable identifier, never reused within `table`
    pub id: String,
    /// Business entity; never inspected by the engine
    pub payload: Value,
    /// Last local mutation (Unix ms)
    pub local_updated_at: Option<i64>,
    /// Last version recorded by the server (Unix ms)
    pub server_updated_at: Option<i64>,
    pub sync_status: SyncStatus,
    /// Tombstone for a local delete awaiting acknowledgement
    #[serde(default)]
    pub deleted: bool,
}

impl SyncRecord {
    /// A record as received from the server
    pub fn from_server(
        table: impl Into<String>,
        id: impl Into<String>,
        payload: Value,
        server_updated_at: i64,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            payload,
            local_updated_at: None,
            server_updated_at: Some(server_updated_at),
            sync_status: SyncStatus::Synced,
            deleted: false,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }

    /// Whether a local mutation exists that the server has not acknowledged
    pub fn has_pending_mutation(&self) -> bool {
        self.sync_status != SyncStatus::Synced
    }
}
