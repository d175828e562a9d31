//! Durable outbox of pending local mutations
//!
//! Entries are persisted through the [`RecordStore`] contract in a reserved
//! bookkeeping table, one row per `(table, id)`. The outbox is the only code
//! that creates or removes those rows.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::models::{Operation, OutboxEntry, RecordKey, SyncRecord, SyncStatus};
use crate::store::{RecordStore, OUTBOX_TABLE};
use crate::util::now_millis;

/// Server acknowledgement for one pushed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub key: RecordKey,
    /// Mutation the server accepted
    pub mutation_id: Uuid,
    /// Version the server echoed back
    pub server_updated_at: Option<i64>,
}

/// Queue of at most one pending mutation per record
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn RecordStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Queue a local mutation and mark the record `pending`.
    ///
    /// An existing entry for the same record is replaced: the snapshot and
    /// operation are overwritten, `attempts` resets to 0 and a new mutation id
    /// is issued. The entry keeps its original base version and queue position.
    pub fn enqueue(
        &self,
        key: &RecordKey,
        operation: Operation,
        payload: Value,
    ) -> Result<OutboxEntry> {
        let now = now_millis();
        let record = self.store.get(&key.table, &key.id)?;

        let entry = match self.get(key)? {
            Some(existing) => OutboxEntry {
                mutation_id: Uuid::now_v7(),
                operation,
                payload_snapshot: payload.clone(),
                attempts: 0,
                last_attempt_at: None,
                ..existing
            },
            None => {
                let base = record.as_ref().and_then(|record| record.server_updated_at);
                OutboxEntry::new(key, operation, payload.clone(), base, now)
            }
        };

        // Entry first: a crash between the two writes never leaves a pending
        // record without its entry.
        self.write_entry(&entry)?;

        let record = match record {
            Some(existing) => SyncRecord {
                payload: if operation == Operation::Delete {
                    existing.payload
                } else {
                    payload
                },
                local_updated_at: Some(now),
                sync_status: SyncStatus::Pending,
                deleted: operation == Operation::Delete,
                ..existing
            },
            None => SyncRecord {
                table: key.table.clone(),
                id: key.id.clone(),
                payload,
                local_updated_at: Some(now),
                server_updated_at: None,
                sync_status: SyncStatus::Pending,
                deleted: operation == Operation::Delete,
            },
        };
        self.store.put(&key.table, &record)?;

        tracing::debug!(
            "Queued {} for {key} (mutation {})",
            entry.operation,
            entry.mutation_id
        );
        Ok(entry)
    }

    /// Remove acknowledged entries and mark their records `synced`.
    ///
    /// An ack only drains the entry it was issued for. When a newer local
    /// edit replaced the entry while the push was in flight, the entry stays
    /// queued and its base moves to the acknowledged server version.
    pub fn drain(&self, acks: &[Ack]) -> Result<usize> {
        let mut drained = 0;

        for ack in acks {
            let Some(mut entry) = self.get(&ack.key)? else {
                tracing::debug!("Ack for {} has no outbox entry; ignoring", ack.key);
                continue;
            };
            let record = self.store.get(&ack.key.table, &ack.key.id)?;

            if entry.mutation_id != ack.mutation_id {
                entry.based_on_server_updated_at =
                    ack.server_updated_at.or(entry.based_on_server_updated_at);
                self.write_entry(&entry)?;
                if let Some(mut record) = record {
                    record.server_updated_at = ack.server_updated_at.or(record.server_updated_at);
                    self.store.put(&ack.key.table, &record)?;
                }
                tracing::debug!(
                    "Entry for {} was replaced during push; keeping it queued",
                    ack.key
                );
                continue;
            }

            // Entry goes last and carries the acknowledged version as its base
            // until then. A partial drain is finished by re-pushing the same
            // mutation id.
            if ack.server_updated_at.is_some()
                && ack.server_updated_at != entry.based_on_server_updated_at
            {
                entry.based_on_server_updated_at = ack.server_updated_at;
                self.write_entry(&entry)?;
            }

            if let Some(mut record) = record {
                if entry.operation == Operation::Delete {
                    self.store.delete(&ack.key.table, &ack.key.id)?;
                } else {
                    record.sync_status = SyncStatus::Synced;
                    record.server_updated_at = ack.server_updated_at.or(record.server_updated_at);
                    self.store.put(&ack.key.table, &record)?;
                }
            }

            self.store.delete(OUTBOX_TABLE, &ack.key.storage_id())?;
            drained += 1;
        }

        Ok(drained)
    }

    /// Up to `max_size` pushable entries, oldest first.
    ///
    /// Entries held for conflict resolution are not pushable.
    pub fn peek_batch(&self, max_size: usize) -> Result<Vec<OutboxEntry>> {
        let mut entries: Vec<_> = self
            .entries()?
            .into_iter()
            .filter(|entry| !entry.held)
            .collect();
        entries.truncate(max_size);
        Ok(entries)
    }

    /// Like [`Outbox::peek_batch`], skipping entries still waiting out their backoff.
    pub fn peek_ready(
        &self,
        max_size: usize,
        now: i64,
        policy: &RetryPolicy,
    ) -> Result<Vec<OutboxEntry>> {
        let mut entries: Vec<_> = self
            .entries()?
            .into_iter()
            .filter(|entry| !entry.held && is_ready(entry, now, policy))
            .collect();
        entries.truncate(max_size);
        Ok(entries)
    }

    /// Count a failed push attempt for the entry.
    pub fn record_failure(&self, key: &RecordKey) -> Result<u32> {
        let mut entry = self.require(key)?;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_attempt_at = Some(now_millis());
        self.write_entry(&entry)?;
        Ok(entry.attempts)
    }

    /// Keep the entry out of push batches until its conflict is resolved.
    pub fn hold(&self, key: &RecordKey) -> Result<()> {
        let mut entry = self.require(key)?;
        if !entry.held {
            entry.held = true;
            self.write_entry(&entry)?;
        }
        Ok(())
    }

    /// Re-queue a conflicted local version as a fresh mutation.
    ///
    /// The entry moves to the back of the queue and is based on the server
    /// version the user chose to override.
    pub fn requeue(
        &self,
        key: &RecordKey,
        operation: Operation,
        payload: Value,
        based_on_server_updated_at: Option<i64>,
    ) -> Result<OutboxEntry> {
        let entry = OutboxEntry::new(
            key,
            operation,
            payload,
            based_on_server_updated_at,
            now_millis(),
        );
        self.write_entry(&entry)?;
        Ok(entry)
    }

    /// Drop the entry without pushing it.
    pub fn remove(&self, key: &RecordKey) -> Result<()> {
        self.store.delete(OUTBOX_TABLE, &key.storage_id())
    }

    /// The entry for a record, if any
    pub fn get(&self, key: &RecordKey) -> Result<Option<OutboxEntry>> {
        self.store
            .get(OUTBOX_TABLE, &key.storage_id())?
            .map(|row| decode_entry(&row))
            .transpose()
    }

    /// All entries ordered by `enqueued_at`, held ones included
    pub fn entries(&self) -> Result<Vec<OutboxEntry>> {
        let mut entries: Vec<_> = self
            .store
            .list_by_status(OUTBOX_TABLE, SyncStatus::Pending)?
            .iter()
            .filter_map(|row| match decode_entry(row) {
                Ok(entry) => Some(entry),
                Err(error) => {
                    tracing::warn!("Skipping unreadable outbox entry: {error}");
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.mutation_id.cmp(&b.mutation_id))
        });
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn require(&self, key: &RecordKey) -> Result<OutboxEntry> {
        self.get(key)?
            .ok_or_else(|| Error::InvalidInput(format!("no outbox entry for {key}")))
    }

    fn write_entry(&self, entry: &OutboxEntry) -> Result<()> {
        let key = entry.key();
        let row = SyncRecord {
            table: OUTBOX_TABLE.to_string(),
            id: key.storage_id(),
            payload: serde_json::to_value(entry)?,
            local_updated_at: Some(entry.enqueued_at),
            server_updated_at: entry.based_on_server_updated_at,
            sync_status: SyncStatus::Pending,
            deleted: false,
        };
        self.store.put(OUTBOX_TABLE, &row)
    }
}

fn decode_entry(row: &SyncRecord) -> Result<OutboxEntry> {
    serde_json::from_value(row.payload.clone())
        .map_err(|error| Error::malformed(format!("{OUTBOX_TABLE}/{}", row.id), error.to_string()))
}

fn is_ready(entry: &OutboxEntry, now: i64, policy: &RetryPolicy) -> bool {
    match entry.last_attempt_at {
        Some(last_attempt) if entry.attempts > 0 => {
            let wait = i64::try_from(policy.delay_for(entry.attempts).as_millis())
                .unwrap_or(i64::MAX);
            now.saturating_sub(last_attempt) >= wait
        }
        _ => true,
    }
}
