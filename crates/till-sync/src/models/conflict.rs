//! Conflict case model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{Operation, RecordKey};
use crate::error::Error;

/// A record changed both locally and on the server since the last common version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCase {
    pub table: String,
    pub id: String,
    /// Pending local payload (the outbox snapshot)
    pub local_payload: Value,
    /// Newest server payload seen for this record
    pub server_payload: Value,
    pub local_updated_at: Option<i64>,
    pub server_updated_at: Option<i64>,
    /// What the local side wants to do with the record
    #[serde(default)]
    pub local_operation: Operation,
    /// The server side deleted the record
    #[serde(default)]
    pub server_deleted: bool,
    /// When the engine first raised the case (Unix ms)
    pub detected_at: i64,
    /// Set by a `skip` decision; cleared when the case is raised again
    #[serde(default)]
    pub deferred: bool,
}

impl ConflictCase {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }
}

/// Human decision for a conflict case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the terminal's version and push it again
    Local,
    /// Take the server's version and drop the local mutation
    Server,
    /// Decide later; the case is raised again on the next cycle
    Skip,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Server => f.write_str("server"),
            Self::Skip => f.write_str("skip"),
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "server" => Ok(Self::Server),
            "skip" => Ok(Self::Skip),
            other => Err(Error::InvalidInput(format!("unknown resolution: {other}"))),
        }
    }
}

/// Payload of the `conflictResolved` topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionDecision {
    pub table: String,
    pub id: String,
    pub resolution: Resolution,
}

impl ResolutionDecision {
    pub fn new(key: &RecordKey, resolution: Resolution) -> Self {
        Self {
            table: key.table.clone(),
            id: key.id.clone(),
            resolution,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }
}
