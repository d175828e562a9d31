//! Store wrapper that fails chosen writes, for exercising store error paths

use std::sync::Mutex;

use super::{RecordStore, SqliteRecordStore};
use crate::error::{Error, Result};
use crate::models::{SyncRecord, SyncStatus};

struct Fault {
    table: String,
    skip: usize,
}

/// In-memory SQLite store whose next matching `put` fails once
pub(crate) struct FlakyStore {
    inner: SqliteRecordStore,
    fault: Mutex<Option<Fault>>,
}

impl FlakyStore {
    pub fn open_in_memory() -> Self {
        Self {
            inner: SqliteRecordStore::open_in_memory().unwrap(),
            fault: Mutex::new(None),
        }
    }

    /// Let `skip` puts to `table` through, then fail the next one.
    pub fn fail_put(&self, table: &str, skip: usize) {
        *self.fault.lock().unwrap() = Some(Fault {
            table: table.to_string(),
            skip,
        });
    }

    /// Whether an armed fault has not fired yet
    pub fn is_armed(&self) -> bool {
        self.fault.lock().unwrap().is_some()
    }
}

impl RecordStore for FlakyStore {
    fn get(&self, table: &str, id: &str) -> Result<Option<SyncRecord>> {
        self.inner.get(table, id)
    }

    fn put(&self, table: &str, record: &SyncRecord) -> Result<()> {
        let mut fault = self.fault.lock().unwrap();
        if let Some(armed) = fault.as_mut().filter(|armed| armed.table == table) {
            if armed.skip == 0 {
                *fault = None;
                return Err(Error::Store("disk full".to_string()));
            }
            armed.skip -= 1;
        }
        drop(fault);
        self.inner.put(table, record)
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.inner.delete(table, id)
    }

    fn list_by_status(&self, table: &str, status: SyncStatus) -> Result<Vec<SyncRecord>> {
        self.inner.list_by_status(table, status)
    }
}
