//! Persisted engine bookkeeping: open conflict cases and the pull checkpoint

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ConflictCase, RecordKey, SyncRecord, SyncStatus};
use crate::store::{RecordStore, CONFLICTS_TABLE, SYNC_STATE_TABLE};

const CHECKPOINT_ID: &str = "checkpoint";

/// Pull position committed after each fully reconciled page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    pub cursor: Option<String>,
    pub last_synced_at: Option<i64>,
}

#[derive(Clone)]
pub(crate) struct Ledger {
    store: Arc<dyn RecordStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn conflict(&self, key: &RecordKey) -> Result<Option<ConflictCase>> {
        self.store
            .get(CONFLICTS_TABLE, &key.storage_id())?
            .map(|row| decode(&row))
            .transpose()
    }

    pub fn save_conflict(&self, case: &ConflictCase) -> Result<()> {
        let row = SyncRecord {
            table: CONFLICTS_TABLE.to_string(),
            id: case.key().storage_id(),
            payload: serde_json::to_value(case)?,
            local_updated_at: case.local_updated_at,
            server_updated_at: case.server_updated_at,
            sync_status: SyncStatus::Conflict,
            deleted: false,
        };
        self.store.put(CONFLICTS_TABLE, &row)
    }

    pub fn remove_conflict(&self, key: &RecordKey) -> Result<()> {
        self.store.delete(CONFLICTS_TABLE, &key.storage_id())
    }

    /// Open cases, oldest first
    pub fn conflicts(&self) -> Result<Vec<ConflictCase>> {
        let mut cases: Vec<ConflictCase> = self
            .store
            .list_by_status(CONFLICTS_TABLE, SyncStatus::Conflict)?
            .iter()
            .filter_map(|row| match decode(row) {
                Ok(case) => Some(case),
                Err(error) => {
                    tracing::warn!("Skipping unreadable conflict case: {error}");
                    None
                }
            })
            .collect();
        cases.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.key().cmp(&b.key()))
        });
        Ok(cases)
    }

    /// Last committed checkpoint; an unreadable one restarts from a full pull
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        match self.store.get(SYNC_STATE_TABLE, CHECKPOINT_ID) {
            Ok(Some(row)) => Ok(decode(&row).unwrap_or_else(|error| {
                tracing::warn!("Discarding unreadable sync checkpoint: {error}");
                Checkpoint::default()
            })),
            Ok(None) => Ok(Checkpoint::default()),
            Err(Error::MalformedRecord { reason, .. }) => {
                tracing::warn!("Discarding unreadable sync checkpoint: {reason}");
                Ok(Checkpoint::default())
            }
            Err(error) => Err(error),
        }
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let row = SyncRecord {
            table: SYNC_STATE_TABLE.to_string(),
            id: CHECKPOINT_ID.to_string(),
            payload: serde_json::to_value(checkpoint)?,
            local_updated_at: checkpoint.last_synced_at,
            server_updated_at: None,
            sync_status: SyncStatus::Synced,
            deleted: false,
        };
        self.store.put(SYNC_STATE_TABLE, &row)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(row: &SyncRecord) -> Result<T> {
    serde_json::from_value::<T>(row.payload.clone()).map_err(|error| {
        Error::malformed(format!("{}/{}", row.table, row.id), error.to_string())
    })
}
