//! Sync engine
//!
//! One engine per terminal. A cycle walks `Idle → Pulling → Reconciling →
//! Pushing → Idle`; any failure moves it to `ErrorBackoff`, from which the
//! failed phase is retried once the backoff delay elapses.
//!
//! Cycles are serialized by an async lock held across the network calls.
//! Everything that reads and then rewrites a record or its outbox entry runs
//! synchronously under a separate write gate, so local edits from the UI can
//! interleave with a running cycle without ever observing half of an update.

mod ledger;
mod runner;
mod state;
#[cfg(test)]
mod tests;

pub use runner::SyncHandle;
pub use state::{SyncPhase, SyncStatusSnapshot, SyncTrigger};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch};

use self::ledger::Ledger;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::gateway::{check_outcomes, RemoteGateway};
use crate::models::{
    ConflictCase, Operation, OutboxEntry, PushOutcome, PushStatus, RecordKey, RemoteChange,
    Resolution, ResolutionDecision, SyncRecord, SyncStatus,
};
use crate::outbox::{Ack, Outbox};
use crate::resolver::{self, Decision};
use crate::store::{validate_business_key, RecordStore};
use crate::util::now_millis;

/// Summary of one completed cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    pub started_at: i64,
    pub finished_at: i64,
    /// Pull pages reconciled
    pub pull_pages: usize,
    /// Server changes received
    pub pulled: usize,
    /// Server changes written locally
    pub applied: usize,
    /// Server changes already reflected locally
    pub kept_local: usize,
    /// Conflict cases raised or refreshed
    pub flagged: usize,
    /// Server changes dropped as malformed
    pub skipped: usize,
    /// Outbox entries sent
    pub pushed: usize,
    pub accepted: usize,
    /// Non-conflict rejections, retried with backoff
    pub rejected: usize,
    /// Pushes rejected because the server held a newer version
    pub push_conflicts: usize,
}

impl CycleReport {
    const fn new(trigger: SyncTrigger, started_at: i64) -> Self {
        Self {
            trigger,
            started_at,
            finished_at: started_at,
            pull_pages: 0,
            pulled: 0,
            applied: 0,
            kept_local: 0,
            flagged: 0,
            skipped: 0,
            pushed: 0,
            accepted: 0,
            rejected: 0,
            push_conflicts: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    consecutive_failures: u32,
    /// Phase a `Retry` cycle starts from
    resume_from: Option<SyncPhase>,
}

/// Offline-first sync engine for one terminal
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn RecordStore>,
    outbox: Outbox,
    ledger: Ledger,
    gateway: Arc<dyn RemoteGateway>,
    events: EventBus,
    cycle_lock: tokio::sync::Mutex<()>,
    write_gate: Mutex<()>,
    rerun_requested: AtomicBool,
    in_flight: Mutex<HashSet<RecordKey>>,
    progress: Mutex<Progress>,
    status: watch::Sender<SyncStatusSnapshot>,
}

impl SyncEngine {
    /// Build an engine over an injected store and gateway.
    ///
    /// Validates the configuration and restores the last-synced checkpoint.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn RemoteGateway>,
    ) -> Result<Self> {
        config.validate()?;

        let outbox = Outbox::new(Arc::clone(&store));
        let ledger = Ledger::new(Arc::clone(&store));
        let snapshot = SyncStatusSnapshot {
            last_synced_at: ledger.checkpoint()?.last_synced_at,
            pending: outbox.len()?,
            open_conflicts: ledger.conflicts()?.len(),
            ..SyncStatusSnapshot::default()
        };
        let (status, _) = watch::channel(snapshot);

        tracing::info!("Sync engine ready for device {}", config.device_id);
        Ok(Self {
            events: EventBus::new(config.event_capacity),
            config,
            store,
            outbox,
            ledger,
            gateway,
            cycle_lock: tokio::sync::Mutex::new(()),
            write_gate: Mutex::new(()),
            rerun_requested: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            progress: Mutex::new(Progress::default()),
            status,
        })
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Subscribe to conflict and cycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Watch the status snapshot
    pub fn status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.status.subscribe()
    }

    pub fn snapshot(&self) -> SyncStatusSnapshot {
        self.status.borrow().clone()
    }

    /// Cases still waiting for a decision, oldest first
    pub fn open_conflicts(&self) -> Result<Vec<ConflictCase>> {
        self.ledger.conflicts()
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.outbox.len()
    }

    /// Delay before the next `Retry` cycle, if the last cycle failed
    pub fn retry_delay(&self) -> Option<Duration> {
        let failures = self.progress().consecutive_failures;
        (failures > 0).then(|| self.config.retry.delay_for(failures - 1))
    }

    /// Record a local edit and queue it for push.
    ///
    /// Deleting a record the server has never seen cancels its pending
    /// creation instead and returns `None`. Edits to a record awaiting
    /// conflict resolution are refused.
    pub fn record_local_change(
        &self,
        table: &str,
        id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<Option<OutboxEntry>> {
        validate_business_key(table, id)?;
        let key = RecordKey::new(table, id);

        let entry = {
            let _gate = self.gate()?;
            let local = self.store.get(table, id)?;
            let in_conflict = local
                .as_ref()
                .is_some_and(|record| record.sync_status == SyncStatus::Conflict);
            if in_conflict || self.ledger.conflict(&key)?.is_some() {
                return Err(Error::RecordInConflict(key.to_string()));
            }

            let never_pushed = local
                .as_ref()
                .is_some_and(|record| record.server_updated_at.is_none());
            if operation == Operation::Delete && never_pushed && !self.is_in_flight(&key) {
                self.outbox.remove(&key)?;
                self.store.delete(table, id)?;
                tracing::debug!("Cancelled unpushed creation of {key}");
                None
            } else {
                Some(self.outbox.enqueue(&key, operation, payload)?)
            }
        };

        self.refresh_counts();
        Ok(entry)
    }

    /// Apply a human decision for an open conflict case.
    pub fn resolve(&self, decision: &ResolutionDecision) -> Result<()> {
        let key = decision.key();
        {
            let _gate = self.gate()?;
            let mut case = self
                .ledger
                .conflict(&key)?
                .ok_or_else(|| Error::ConflictNotFound(key.to_string()))?;

            match decision.resolution {
                Resolution::Local => self.keep_local_version(&case)?,
                Resolution::Server => self.take_server_version(&case)?,
                Resolution::Skip => {
                    case.deferred = true;
                    self.ledger.save_conflict(&case)?;
                }
            }
            if decision.resolution != Resolution::Skip {
                self.ledger.remove_conflict(&key)?;
            }
        }

        tracing::info!("Conflict on {key} resolved: {}", decision.resolution);
        self.events
            .publish(SyncEvent::ConflictResolved(decision.clone()));
        self.refresh_counts();
        Ok(())
    }

    /// Run one cycle now.
    ///
    /// Returns `Ok(None)` when another cycle is already running; that cycle
    /// runs once more after it finishes instead.
    pub async fn sync_now(&self, trigger: SyncTrigger) -> Result<Option<CycleReport>> {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            self.rerun_requested.store(true, Ordering::SeqCst);
            tracing::debug!("Sync cycle already running; coalescing {trigger} trigger");
            return Ok(None);
        };

        loop {
            let report = self.run_cycle(trigger).await?;
            if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                return Ok(Some(report));
            }
            tracing::debug!("Running follow-up cycle for triggers received during sync");
        }
    }

    async fn run_cycle(&self, trigger: SyncTrigger) -> Result<CycleReport> {
        let mut report = CycleReport::new(trigger, now_millis());
        let resume_from = self.take_resume_phase(trigger);
        tracing::debug!("Starting sync cycle ({trigger})");

        if resume_from == Some(SyncPhase::Pushing) {
            tracing::debug!("Resuming failed cycle at push");
        } else if let Err(error) = self.pull_phase(&mut report).await {
            return Err(self.fail_cycle(SyncPhase::Pulling, error));
        }

        if let Err(error) = self.push_phase(&mut report).await {
            return Err(self.fail_cycle(SyncPhase::Pushing, error));
        }

        self.complete_cycle(report)
            .map_err(|error| self.fail_cycle(SyncPhase::Pushing, error))
    }

    async fn pull_phase(&self, report: &mut CycleReport) -> Result<()> {
        self.set_phase(SyncPhase::Pulling);
        let mut checkpoint = self.ledger.checkpoint()?;

        for _ in 0..self.config.max_pull_pages {
            self.set_phase(SyncPhase::Pulling);
            let batch = self.gateway.pull(checkpoint.cursor.as_deref()).await?;

            self.set_phase(SyncPhase::Reconciling);
            report.pull_pages += 1;
            report.pulled += batch.changes.len();
            report.skipped += batch.skipped;
            for change in &batch.changes {
                self.reconcile_change(change, report)?;
            }

            let advanced = batch.next_cursor.is_some();
            if advanced {
                checkpoint.cursor = batch.next_cursor;
            }
            self.ledger.save_checkpoint(&checkpoint)?;

            if !batch.has_more {
                break;
            }
            if !advanced {
                tracing::warn!("Server reported more changes without a cursor; stopping pull");
                break;
            }
        }

        self.republish_deferred()
    }

    fn reconcile_change(&self, change: &RemoteChange, report: &mut CycleReport) -> Result<()> {
        if let Err(error) = validate_business_key(&change.table, &change.id) {
            report.skipped += 1;
            tracing::warn!(
                "Skipping server change for {}/{}: {error}",
                change.table,
                change.id
            );
            return Ok(());
        }

        let key = change.key();
        let _gate = self.gate()?;
        let (local, pending) = match self.local_state(&key) {
            Ok(state) => state,
            Err(Error::MalformedRecord { key, reason }) => {
                report.skipped += 1;
                tracing::warn!("Skipping server change for {key}: local copy unreadable: {reason}");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let decision = resolver::decide(local.as_ref(), pending.as_ref(), change);
        tracing::debug!("{key} at {}: {decision}", change.server_updated_at);

        match decision {
            Decision::Apply => {
                self.apply_server_version(
                    &key,
                    &change.payload,
                    Some(change.server_updated_at),
                    change.deleted,
                )?;
                report.applied += 1;
            }
            Decision::KeepLocal => report.kept_local += 1,
            Decision::Flag => {
                let local = local
                    .or_else(|| pending.as_ref().map(record_from_entry))
                    .ok_or_else(|| Error::Store(format!("no local state for {key}")))?;
                let raised = self.raise_conflict(
                    &local,
                    pending.as_ref(),
                    change.payload.clone(),
                    Some(change.server_updated_at),
                    change.deleted,
                )?;
                if raised {
                    report.flagged += 1;
                }
            }
        }

        Ok(())
    }

    async fn push_phase(&self, report: &mut CycleReport) -> Result<()> {
        for _ in 0..self.config.max_push_batches {
            let batch = self.claim_batch()?;
            if batch.is_empty() {
                break;
            }

            self.set_phase(SyncPhase::Pushing);
            report.pushed += batch.len();
            let pushed = self
                .gateway
                .push(&batch)
                .await
                .and_then(|outcomes| check_outcomes(&batch, &outcomes).map(|()| outcomes));
            let applied = pushed.and_then(|outcomes| self.apply_outcomes(&batch, &outcomes, report));
            self.release_batch(&batch);
            applied?;
        }

        Ok(())
    }

    /// Next ready batch, marked in flight so a concurrent delete does not
    /// cancel a creation the server may already be applying.
    fn claim_batch(&self) -> Result<Vec<OutboxEntry>> {
        let _gate = self.gate()?;
        let batch = self.outbox.peek_ready(
            self.config.push_batch_size,
            now_millis(),
            &self.config.retry,
        )?;
        self.in_flight_keys()
            .extend(batch.iter().map(OutboxEntry::key));
        Ok(batch)
    }

    fn release_batch(&self, batch: &[OutboxEntry]) {
        let mut in_flight = self.in_flight_keys();
        for entry in batch {
            in_flight.remove(&entry.key());
        }
    }

    fn apply_outcomes(
        &self,
        batch: &[OutboxEntry],
        outcomes: &[PushOutcome],
        report: &mut CycleReport,
    ) -> Result<()> {
        let _gate = self.gate()?;
        let mut acks = Vec::new();

        for (entry, outcome) in batch.iter().zip(outcomes) {
            let key = entry.key();
            match outcome.outcome {
                PushStatus::Accepted => acks.push(Ack {
                    key,
                    mutation_id: entry.mutation_id,
                    server_updated_at: outcome.server_updated_at,
                }),
                PushStatus::Rejected if outcome.is_conflict() => {
                    report.push_conflicts += 1;
                    self.handle_push_conflict(&key, outcome)?;
                }
                PushStatus::Rejected => {
                    report.rejected += 1;
                    let reason = outcome.reason.as_deref().unwrap_or("unspecified");
                    let current = self.outbox.get(&key)?;
                    if current.is_some_and(|current| current.mutation_id == entry.mutation_id) {
                        let attempts = self.outbox.record_failure(&key)?;
                        tracing::warn!("Push of {key} rejected ({reason}); attempt {attempts}");
                    }
                }
            }
        }

        report.accepted += acks.len();
        self.outbox.drain(&acks)?;
        Ok(())
    }

    fn handle_push_conflict(&self, key: &RecordKey, outcome: &PushOutcome) -> Result<()> {
        // The entry may have been coalesced while in flight; the conflict
        // covers the newest local version.
        let Some(current) = self.outbox.get(key)? else {
            return Ok(());
        };
        let local = self
            .store
            .get(&key.table, &key.id)?
            .unwrap_or_else(|| record_from_entry(&current));

        match &outcome.server_payload {
            Some(server_payload) => {
                self.raise_conflict(
                    &local,
                    Some(&current),
                    server_payload.clone(),
                    outcome.server_updated_at,
                    outcome.server_deleted,
                )?;
            }
            None => {
                self.outbox.hold(key)?;
                self.mark_conflict(local)?;
                tracing::info!(
                    "Push of {key} rejected as conflict; waiting for the server version"
                );
            }
        }
        Ok(())
    }

    /// Persist and publish a conflict case. Returns false when an open case
    /// already covers this server version.
    fn raise_conflict(
        &self,
        local: &SyncRecord,
        pending: Option<&OutboxEntry>,
        server_payload: Value,
        server_updated_at: Option<i64>,
        server_deleted: bool,
    ) -> Result<bool> {
        let key = local.key();
        let existing = self.ledger.conflict(&key)?;
        if existing
            .as_ref()
            .is_some_and(|case| case.server_updated_at >= server_updated_at)
        {
            return Ok(false);
        }

        let mut case = resolver::conflict_case(
            local,
            pending,
            server_payload,
            server_updated_at,
            server_deleted,
            now_millis(),
        );
        if let Some(existing) = existing {
            case.detected_at = existing.detected_at;
        }

        self.ledger.save_conflict(&case)?;
        if pending.is_some() {
            self.outbox.hold(&key)?;
        }
        self.mark_conflict(local.clone())?;

        tracing::info!(
            "Conflict on {key}: local based on {:?}, server at {:?}",
            pending.and_then(|entry| entry.based_on_server_updated_at),
            server_updated_at
        );
        self.events.publish(SyncEvent::Conflict(case));
        Ok(true)
    }

    fn mark_conflict(&self, mut record: SyncRecord) -> Result<()> {
        if record.sync_status != SyncStatus::Conflict {
            record.sync_status = SyncStatus::Conflict;
            self.store.put(&record.table, &record)?;
        }
        Ok(())
    }

    /// Raise skipped cases again.
    fn republish_deferred(&self) -> Result<()> {
        let _gate = self.gate()?;
        for mut case in self.ledger.conflicts()? {
            if !case.deferred {
                continue;
            }
            case.deferred = false;
            self.ledger.save_conflict(&case)?;
            tracing::debug!("Re-raising deferred conflict on {}", case.key());
            self.events.publish(SyncEvent::Conflict(case));
        }
        Ok(())
    }

    fn keep_local_version(&self, case: &ConflictCase) -> Result<()> {
        let key = case.key();
        let entry = self.outbox.requeue(
            &key,
            case.local_operation,
            case.local_payload.clone(),
            case.server_updated_at,
        )?;

        let deleted = entry.operation == Operation::Delete;
        let record = match self.store.get(&key.table, &key.id)? {
            Some(existing) => SyncRecord {
                payload: if deleted {
                    existing.payload
                } else {
                    case.local_payload.clone()
                },
                local_updated_at: Some(entry.enqueued_at),
                server_updated_at: case.server_updated_at,
                sync_status: SyncStatus::Pending,
                deleted,
                ..existing
            },
            None => SyncRecord {
                sync_status: SyncStatus::Pending,
                server_updated_at: case.server_updated_at,
                ..record_from_entry(&entry)
            },
        };
        self.store.put(&key.table, &record)
    }

    fn take_server_version(&self, case: &ConflictCase) -> Result<()> {
        let key = case.key();
        self.apply_server_version(
            &key,
            &case.server_payload,
            case.server_updated_at,
            case.server_deleted,
        )?;
        self.outbox.remove(&key)
    }

    fn apply_server_version(
        &self,
        key: &RecordKey,
        payload: &Value,
        server_updated_at: Option<i64>,
        deleted: bool,
    ) -> Result<()> {
        if deleted {
            return self.store.delete(&key.table, &key.id);
        }
        let record = SyncRecord {
            table: key.table.clone(),
            id: key.id.clone(),
            payload: payload.clone(),
            local_updated_at: None,
            server_updated_at,
            sync_status: SyncStatus::Synced,
            deleted: false,
        };
        self.store.put(&key.table, &record)
    }

    fn local_state(&self, key: &RecordKey) -> Result<(Option<SyncRecord>, Option<OutboxEntry>)> {
        Ok((self.store.get(&key.table, &key.id)?, self.outbox.get(key)?))
    }

    fn complete_cycle(&self, mut report: CycleReport) -> Result<CycleReport> {
        let finished_at = now_millis();
        let mut checkpoint = self.ledger.checkpoint()?;
        checkpoint.last_synced_at = Some(finished_at);
        self.ledger.save_checkpoint(&checkpoint)?;
        report.finished_at = finished_at;

        *self.progress() = Progress::default();
        self.status.send_modify(|status| {
            status.phase = SyncPhase::Idle;
            status.last_synced_at = Some(finished_at);
            status.consecutive_failures = 0;
            status.last_error = None;
            status.offline = false;
        });
        self.refresh_counts();

        tracing::info!(
            "Sync cycle complete: pulled {} (applied {}, flagged {}), pushed {} (accepted {})",
            report.pulled,
            report.applied,
            report.flagged,
            report.pushed,
            report.accepted
        );
        self.events.publish(SyncEvent::CycleCompleted(report.clone()));
        Ok(report)
    }

    fn fail_cycle(&self, resume_from: SyncPhase, error: Error) -> Error {
        let failed_in = match self.status.borrow().phase {
            phase if phase.is_active() => phase,
            _ => resume_from,
        };
        let failures = {
            let mut progress = self.progress();
            progress.consecutive_failures = progress.consecutive_failures.saturating_add(1);
            progress.resume_from = Some(resume_from);
            progress.consecutive_failures
        };
        let retry_in = self.config.retry.delay_for(failures - 1);
        let message = error.to_string();

        tracing::warn!("Sync failed during {failed_in}: {message}; retrying in {retry_in:?}");
        self.status.send_modify(|status| {
            status.phase = SyncPhase::ErrorBackoff;
            status.consecutive_failures = failures;
            status.last_error = Some(message.clone());
            status.offline = error.is_transport();
        });
        self.refresh_counts();
        self.events.publish(SyncEvent::CycleFailed {
            phase: failed_in,
            error: message,
            retry_in,
        });
        error
    }

    fn take_resume_phase(&self, trigger: SyncTrigger) -> Option<SyncPhase> {
        let resume_from = self.progress().resume_from.take();
        (trigger == SyncTrigger::Retry).then_some(resume_from).flatten()
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.send_if_modified(|status| {
            let changed = status.phase != phase;
            status.phase = phase;
            changed
        });
    }

    fn refresh_counts(&self) {
        let counts = self
            .outbox
            .len()
            .and_then(|pending| Ok((pending, self.ledger.conflicts()?.len())));
        match counts {
            Ok((pending, open_conflicts)) => {
                self.status.send_if_modified(|status| {
                    let changed =
                        status.pending != pending || status.open_conflicts != open_conflicts;
                    status.pending = pending;
                    status.open_conflicts = open_conflicts;
                    changed
                });
            }
            Err(error) => tracing::warn!("Could not refresh sync counters: {error}"),
        }
    }

    fn is_in_flight(&self, key: &RecordKey) -> bool {
        self.in_flight_keys().contains(key)
    }

    fn gate(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_gate
            .lock()
            .map_err(|_| Error::Store("write gate poisoned".into()))
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight_keys(&self) -> MutexGuard<'_, HashSet<RecordKey>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Local state reconstructed from an outbox entry whose record row is missing
fn record_from_entry(entry: &OutboxEntry) -> SyncRecord {
    SyncRecord {
        table: entry.table.clone(),
        id: entry.id.clone(),
        payload: entry.payload_snapshot.clone(),
        local_updated_at: Some(entry.enqueued_at),
        server_updated_at: entry.based_on_server_updated_at,
        sync_status: SyncStatus::Pending,
        deleted: entry.operation == Operation::Delete,
    }
}
