//! `SQLite` implementation of `RecordStore`

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::{migrations, RecordStore};
use crate::error::{Error, Result};
use crate::models::{SyncRecord, SyncStatus};

/// Record store backed by a single `SQLite` connection
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

/// Row as stored, before payload and status are decoded
struct RawRecord {
    table: String,
    id: String,
    payload: String,
    local_updated_at: Option<i64>,
    server_updated_at: Option<i64>,
    sync_status: String,
    deleted: bool,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            table: row.get(0)?,
            id: row.get(1)?,
            payload: row.get(2)?,
            local_updated_at: row.get(3)?,
            server_updated_at: row.get(4)?,
            sync_status: row.get(5)?,
            deleted: row.get::<_, i32>(6)? != 0,
        })
    }

    fn decode(self) -> Result<SyncRecord> {
        let key = format!("{}/{}", self.table, self.id);
        let payload = serde_json::from_str(&self.payload)
            .map_err(|error| Error::malformed(&key, format!("payload: {error}")))?;
        let sync_status = self
            .sync_status
            .parse::<SyncStatus>()
            .map_err(|error| Error::malformed(&key, error.to_string()))?;

        Ok(SyncRecord {
            table: self.table,
            id: self.id,
            payload,
            local_updated_at: self.local_updated_at,
            server_updated_at: self.server_updated_at,
            sync_status,
            deleted: self.deleted,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT table_name, id, payload, local_updated_at, server_updated_at, sync_status, deleted FROM records";

impl SqliteRecordStore {
    /// Open a store at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        Self::configure(&conn)?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Configure `SQLite` for a single-writer terminal workload
    fn configure(conn: &Connection) -> Result<()> {
        // In-memory databases report "memory" and ignore WAL; that's fine
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", 10_000)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("record store connection lock poisoned".into()))
    }
}

impl RecordStore for SqliteRecordStore {
    fn get(&self, table: &str, id: &str) -> Result<Option<SyncRecord>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE table_name = ? AND id = ?"),
                params![table, id],
                RawRecord::from_row,
            )
            .optional()?;

        raw.map(RawRecord::decode).transpose()
    }

    fn put(&self, table: &str, record: &SyncRecord) -> Result<()> {
        if record.table != table {
            return Err(Error::InvalidInput(format!(
                "record {}/{} does not belong to table {table}",
                record.table, record.id
            )));
        }

        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO records
                (table_name, id, payload, local_updated_at, server_updated_at, sync_status, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                table,
                record.id,
                payload,
                record.local_updated_at,
                record.server_updated_at,
                record.sync_status.as_str(),
                i32::from(record.deleted)
            ],
        )?;
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM records WHERE table_name = ? AND id = ?",
            params![table, id],
        )?;
        Ok(())
    }

    fn list_by_status(&self, table: &str, status: SyncStatus) -> Result<Vec<SyncRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE table_name = ? AND sync_status = ? ORDER BY id"
        ))?;

        let rows = stmt
            .query_map(params![table, status.as_str()], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let records = rows
            .into_iter()
            .filter_map(|raw| match raw.decode() {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!("Skipping unreadable local record: {error}");
                    None
                }
            })
            .collect();

        Ok(records)
    }
}
