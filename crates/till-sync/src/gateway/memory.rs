//! In-process sync server
//!
//! Behaves like the real sync API: a logical clock issues strictly
//! increasing `server_updated_at` values, pulls page through an append-only
//! change log by numeric cursor, and pushes are deduplicated by
//! `mutation_id` and rejected with `conflict` when the entry's base is older
//! than the stored version. Used for offline demos and engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{PullBatch, RemoteGateway};
use crate::error::{Error, Result};
use crate::models::{
    Operation, OutboxEntry, PushOutcome, PushStatus, RecordKey, RemoteChange, REJECTION_CONFLICT,
};
use crate::util::now_millis;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct StoredRecord {
    payload: Value,
    server_updated_at: i64,
    deleted: bool,
}

#[derive(Debug)]
struct ServerState {
    clock: i64,
    records: BTreeMap<RecordKey, StoredRecord>,
    log: Vec<RemoteChange>,
    seen_mutations: HashMap<Uuid, PushOutcome>,
    forced_rejections: HashMap<RecordKey, String>,
    page_size: usize,
    embed_conflicts: bool,
    online: bool,
    failing_pulls: usize,
    failing_pushes: usize,
    push_requests: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            clock: 0,
            records: BTreeMap::new(),
            log: Vec::new(),
            seen_mutations: HashMap::new(),
            forced_rejections: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            embed_conflicts: true,
            online: true,
            failing_pulls: 0,
            failing_pushes: 0,
            push_requests: 0,
        }
    }
}

impl ServerState {
    /// Next version: wall clock when it moves forward, otherwise last + 1
    fn tick(&mut self, at_least: i64) -> i64 {
        self.clock = at_least.max(self.clock + 1);
        self.clock
    }

    fn store(&mut self, key: RecordKey, payload: Value, deleted: bool, at_least: i64) -> i64 {
        let server_updated_at = self.tick(at_least);
        self.log.push(RemoteChange {
            table: key.table.clone(),
            id: key.id.clone(),
            payload: payload.clone(),
            server_updated_at,
            deleted,
        });
        self.records.insert(
            key,
            StoredRecord {
                payload,
                server_updated_at,
                deleted,
            },
        );
        server_updated_at
    }

    fn apply_mutation(&mut self, entry: &OutboxEntry) -> PushOutcome {
        let key = entry.key();

        if let Some(reason) = self.forced_rejections.remove(&key) {
            return PushOutcome::rejected(&key, reason);
        }

        if let Some(current) = self.records.get(&key) {
            let stale = match entry.based_on_server_updated_at {
                Some(base) => current.server_updated_at > base,
                None => true,
            };
            if stale {
                let outcome = PushOutcome::rejected(&key, REJECTION_CONFLICT);
                if !self.embed_conflicts {
                    return outcome;
                }
                let mut outcome =
                    outcome.with_server_version(current.payload.clone(), current.server_updated_at);
                outcome.server_deleted = current.deleted;
                return outcome;
            }
        }

        let deleted = entry.operation == Operation::Delete;
        let server_updated_at =
            self.store(key.clone(), entry.payload_snapshot.clone(), deleted, now_millis());
        PushOutcome::accepted(&key, server_updated_at)
    }
}

/// Authoritative record store shared by any number of [`MemoryGateway`]s
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Gateway for one terminal
    pub fn gateway(self: &Arc<Self>) -> MemoryGateway {
        MemoryGateway {
            server: Arc::clone(self),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| Error::transport("memory server state poisoned"))
    }

    /// Write a record as another client would; returns the new version
    pub fn write(&self, table: &str, id: &str, payload: Value) -> Result<i64> {
        self.write_at(table, id, payload, now_millis())
    }

    /// Write a record with a version of at least `server_updated_at`
    pub fn write_at(
        &self,
        table: &str,
        id: &str,
        payload: Value,
        server_updated_at: i64,
    ) -> Result<i64> {
        let mut state = self.lock()?;
        Ok(state.store(RecordKey::new(table, id), payload, false, server_updated_at))
    }

    /// Delete a record as another client would; returns the tombstone version
    pub fn delete(&self, table: &str, id: &str) -> Result<i64> {
        let mut state = self.lock()?;
        Ok(state.store(RecordKey::new(table, id), Value::Null, true, now_millis()))
    }

    /// Current server copy: payload, version and deleted flag
    pub fn get(&self, table: &str, id: &str) -> Result<Option<(Value, i64, bool)>> {
        let state = self.lock()?;
        Ok(state
            .records
            .get(&RecordKey::new(table, id))
            .map(|record| (record.payload.clone(), record.server_updated_at, record.deleted)))
    }

    /// Live (non-deleted) records keyed by `table/id`
    pub fn snapshot(&self) -> Result<BTreeMap<RecordKey, Value>> {
        let state = self.lock()?;
        Ok(state
            .records
            .iter()
            .filter(|(_, record)| !record.deleted)
            .map(|(key, record)| (key.clone(), record.payload.clone()))
            .collect())
    }

    /// Toggle connectivity; offline calls fail with a transport error
    pub fn set_online(&self, online: bool) -> Result<()> {
        self.lock()?.online = online;
        Ok(())
    }

    /// Fail the next `count` pulls
    pub fn fail_next_pulls(&self, count: usize) -> Result<()> {
        self.lock()?.failing_pulls = count;
        Ok(())
    }

    /// Fail the next `count` pushes
    pub fn fail_next_pushes(&self, count: usize) -> Result<()> {
        self.lock()?.failing_pushes = count;
        Ok(())
    }

    /// Reject the next push for `key` with `reason`
    pub fn reject_next(&self, key: &RecordKey, reason: &str) -> Result<()> {
        self.lock()?
            .forced_rejections
            .insert(key.clone(), reason.to_string());
        Ok(())
    }

    /// Maximum changes returned per pull
    pub fn set_page_size(&self, page_size: usize) -> Result<()> {
        self.lock()?.page_size = page_size.max(1);
        Ok(())
    }

    /// Whether conflict rejections carry the server's current version
    pub fn embed_conflict_payloads(&self, embed: bool) -> Result<()> {
        self.lock()?.embed_conflicts = embed;
        Ok(())
    }

    /// Number of push requests that reached the server
    pub fn push_requests(&self) -> Result<usize> {
        Ok(self.lock()?.push_requests)
    }

    fn pull(&self, since_cursor: Option<&str>) -> Result<PullBatch> {
        let mut state = self.lock()?;
        if !state.online {
            return Err(Error::transport("server unreachable"));
        }
        if state.failing_pulls > 0 {
            state.failing_pulls -= 1;
            return Err(Error::transport("injected pull failure"));
        }

        let start = match since_cursor {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| Error::transport(format!("invalid cursor: {cursor}")))?,
        };
        let start = start.min(state.log.len());
        let end = start.saturating_add(state.page_size).min(state.log.len());

        Ok(PullBatch {
            changes: state.log[start..end].to_vec(),
            next_cursor: Some(end.to_string()),
            has_more: end < state.log.len(),
            skipped: 0,
        })
    }

    fn push(&self, batch: &[OutboxEntry]) -> Result<Vec<PushOutcome>> {
        let mut state = self.lock()?;
        if !state.online {
            return Err(Error::transport("server unreachable"));
        }
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(Error::transport("injected push failure"));
        }
        state.push_requests += 1;

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut in_request = HashSet::new();
        for entry in batch {
            if !in_request.insert(entry.mutation_id) {
                return Err(Error::transport(format!(
                    "duplicate mutation {} in push",
                    entry.mutation_id
                )));
            }
            let outcome = match state.seen_mutations.get(&entry.mutation_id) {
                Some(previous) => previous.clone(),
                None => {
                    let outcome = state.apply_mutation(entry);
                    if outcome.outcome == PushStatus::Accepted {
                        state.seen_mutations.insert(entry.mutation_id, outcome.clone());
                    }
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}

/// [`RemoteGateway`] backed by a shared [`MemoryServer`]
#[derive(Debug, Clone)]
pub struct MemoryGateway {
    server: Arc<MemoryServer>,
}

impl MemoryGateway {
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn pull(&self, since_cursor: Option<&str>) -> Result<PullBatch> {
        self.server.pull(since_cursor)
    }

    async fn push(&self, batch: &[OutboxEntry]) -> Result<Vec<PushOutcome>> {
        self.server.push(batch)
    }
}
