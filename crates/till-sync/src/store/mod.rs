//! Local record store layer

#[cfg(test)]
mod flaky;
mod migrations;
mod sqlite;

#[cfg(test)]
pub(crate) use flaky::FlakyStore;
pub use sqlite::SqliteRecordStore;

use crate::error::{Error, Result};
use crate::models::{SyncRecord, SyncStatus};

/// Prefix reserved for the engine's own bookkeeping tables
pub const RESERVED_TABLE_PREFIX: char = '_';

/// Outbox entries, one row per `(table, id)`
pub(crate) const OUTBOX_TABLE: &str = "_outbox";
/// Open conflict cases
pub(crate) const CONFLICTS_TABLE: &str = "_conflicts";
/// Cursor and last-synced checkpoint
pub(crate) const SYNC_STATE_TABLE: &str = "_sync_state";

/// Typed access to the local embedded store, keyed by `(table, id)`.
///
/// Every operation is atomic for the addressed record: a failed `put` leaves
/// the previous value intact. Implementations never change `sync_status` on
/// their own.
pub trait RecordStore: Send + Sync {
    /// Get a record by table and id
    fn get(&self, table: &str, id: &str) -> Result<Option<SyncRecord>>;

    /// Insert or replace a record
    fn put(&self, table: &str, record: &SyncRecord) -> Result<()>;

    /// Remove a record; missing records are not an error
    fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// All records of a table with the given status
    fn list_by_status(&self, table: &str, status: SyncStatus) -> Result<Vec<SyncRecord>>;
}

/// Reject empty identifiers and business tables that collide with bookkeeping.
pub fn validate_business_key(table: &str, id: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(Error::InvalidInput("table must not be empty".into()));
    }
    if id.trim().is_empty() {
        return Err(Error::InvalidInput("id must not be empty".into()));
    }
    if table.starts_with(RESERVED_TABLE_PREFIX) {
        return Err(Error::InvalidInput(format!(
            "table names starting with '{RESERVED_TABLE_PREFIX}' are reserved: {table}"
        )));
    }
    Ok(())
}
