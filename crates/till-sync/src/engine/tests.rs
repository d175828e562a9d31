use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

use super::*;
use crate::config::RetryPolicy;
use crate::gateway::{MemoryServer, PullBatch};
use crate::models::REJECTION_CONFLICT;
use crate::store::{FlakyStore, SqliteRecordStore, SYNC_STATE_TABLE};

type PushScript = Box<dyn Fn(&[OutboxEntry]) -> Result<Vec<PushOutcome>> + Send + Sync>;

/// Gateway with queued pull pages and a programmable push response
#[derive(Default)]
struct ScriptedGateway {
    pulls: Mutex<VecDeque<Result<PullBatch>>>,
    push_script: Mutex<Option<PushScript>>,
    pushed: Mutex<Vec<Vec<OutboxEntry>>>,
}

impl ScriptedGateway {
    fn queue_pull(&self, changes: Vec<RemoteChange>) {
        self.pulls.lock().unwrap().push_back(Ok(PullBatch {
            changes,
            ..PullBatch::default()
        }));
    }

    fn on_push(
        &self,
        script: impl Fn(&[OutboxEntry]) -> Result<Vec<PushOutcome>> + Send + Sync + 'static,
    ) {
        *self.push_script.lock().unwrap() = Some(Box::new(script));
    }

    fn push_count(&self) -> usize {
        self.pushed.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn pull(&self, _since_cursor: Option<&str>) -> Result<PullBatch> {
        self.pulls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PullBatch::default()))
    }

    async fn push(&self, batch: &[OutboxEntry]) -> Result<Vec<PushOutcome>> {
        self.pushed.lock().unwrap().push(batch.to_vec());
        match &*self.push_script.lock().unwrap() {
            Some(script) => script(batch),
            None => Ok(batch
                .iter()
                .map(|entry| PushOutcome::accepted(&entry.key(), 400))
                .collect()),
        }
    }
}

/// Gateway whose first pull parks until released
#[derive(Default)]
struct BlockingGateway {
    entered: Notify,
    release: Notify,
    pulls: AtomicUsize,
}

#[async_trait]
impl RemoteGateway for BlockingGateway {
    async fn pull(&self, _since_cursor: Option<&str>) -> Result<PullBatch> {
        if self.pulls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(PullBatch::default())
    }

    async fn push(&self, batch: &[OutboxEntry]) -> Result<Vec<PushOutcome>> {
        Ok(batch
            .iter()
            .map(|entry| PushOutcome::accepted(&entry.key(), 1))
            .collect())
    }
}

fn test_config(device_id: &str) -> SyncConfig {
    SyncConfig::new(device_id)
        .without_auto_sync()
        .with_retry_policy(RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_exponent: 3,
        })
}

fn open_store() -> Arc<dyn RecordStore> {
    Arc::new(SqliteRecordStore::open_in_memory().unwrap())
}

fn terminal(server: &Arc<MemoryServer>, device_id: &str) -> SyncEngine {
    SyncEngine::new(
        test_config(device_id),
        open_store(),
        Arc::new(server.gateway()),
    )
    .unwrap()
}

fn flaky_terminal(server: &Arc<MemoryServer>) -> (Arc<FlakyStore>, SyncEngine) {
    let store = Arc::new(FlakyStore::open_in_memory());
    let engine = SyncEngine::new(
        test_config("till-1"),
        store.clone(),
        Arc::new(server.gateway()),
    )
    .unwrap();
    (store, engine)
}

fn scripted_terminal() -> (Arc<ScriptedGateway>, SyncEngine) {
    let gateway = Arc::new(ScriptedGateway::default());
    let engine = SyncEngine::new(test_config("till-1"), open_store(), gateway.clone()).unwrap();
    (gateway, engine)
}

fn local(engine: &SyncEngine, table: &str, id: &str) -> Option<SyncRecord> {
    engine.store().get(table, id).unwrap()
}

fn change(table: &str, id: &str, payload: Value, server_updated_at: i64) -> RemoteChange {
    RemoteChange {
        table: table.to_string(),
        id: id.to_string(),
        payload,
        server_updated_at,
        deleted: false,
    }
}

fn drain_events(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

fn conflicts_in(events: &[SyncEvent]) -> Vec<ConflictCase> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::Conflict(case) => Some(case.clone()),
            _ => None,
        })
        .collect()
}

async fn sync(engine: &SyncEngine) -> CycleReport {
    engine
        .sync_now(SyncTrigger::Manual)
        .await
        .unwrap()
        .expect("cycle should not be coalesced")
}

async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    predicate: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(error) => panic!("event stream ended: {error}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Invoice edited locally against version 5 while the server moved to 12.
async fn invoice_conflict() -> (Arc<MemoryServer>, SyncEngine) {
    let server = MemoryServer::new();
    server
        .write_at("invoices", "INV-1", json!({"total": 100, "note": "original"}), 5)
        .unwrap();
    let engine = terminal(&server, "till-1");
    sync(&engine).await;

    engine
        .record_local_change(
            "invoices",
            "INV-1",
            Operation::Upsert,
            json!({"total": 110, "note": "terminal"}),
        )
        .unwrap();
    server
        .write_at("invoices", "INV-1", json!({"total": 90, "note": "office"}), 12)
        .unwrap();

    (server, engine)
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edit_raises_exactly_one_conflict_without_writes() {
    let (server, engine) = invoice_conflict().await;
    let mut events = engine.subscribe();

    let report = sync(&engine).await;
    assert_eq!(report.flagged, 1);
    assert_eq!(report.pushed, 0);

    let cases = conflicts_in(&drain_events(&mut events));
    assert_eq!(cases.len(), 1);
    let case = &cases[0];
    assert_eq!(case.key(), RecordKey::new("invoices", "INV-1"));
    assert_eq!(case.local_payload, json!({"total": 110, "note": "terminal"}));
    assert_eq!(case.server_payload, json!({"total": 90, "note": "office"}));
    assert_eq!(case.server_updated_at, Some(12));

    let record = local(&engine, "invoices", "INV-1").unwrap();
    assert_eq!(record.payload, json!({"total": 110, "note": "terminal"}));
    assert_eq!(record.sync_status, SyncStatus::Conflict);
    assert_eq!(
        server.get("invoices", "INV-1").unwrap(),
        Some((json!({"total": 90, "note": "office"}), 12, false))
    );
    assert_eq!(server.push_requests().unwrap(), 0);
    assert!(engine.outbox().get(&case.key()).unwrap().unwrap().held);

    sync(&engine).await;
    assert!(conflicts_in(&drain_events(&mut events)).is_empty());
    assert_eq!(engine.open_conflicts().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_push_drains_and_syncs_record() {
    let server = MemoryServer::new();
    let engine = terminal(&server, "till-1");

    engine
        .record_local_change("products", "PROD-7", Operation::Upsert, json!({"price": 7}))
        .unwrap();
    assert_eq!(engine.snapshot().pending, 1);

    let report = sync(&engine).await;
    assert_eq!(report.accepted, 1);
    assert!(engine.outbox().is_empty().unwrap());

    let (payload, version, _) = server.get("products", "PROD-7").unwrap().unwrap();
    assert_eq!(payload, json!({"price": 7}));
    let record = local(&engine, "products", "PROD-7").unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.server_updated_at, Some(version));

    let echo = sync(&engine).await;
    assert_eq!(echo.kept_local, 1);
    assert_eq!(echo.applied, 0);
    assert_eq!(engine.snapshot().pending, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_rejection_in_batch_only_holds_that_entry() {
    let (gateway, engine) = scripted_terminal();
    let mut events = engine.subscribe();
    for id in ["A", "B", "C"] {
        engine
            .record_local_change("products", id, Operation::Upsert, json!({"id": id}))
            .unwrap();
    }
    gateway.on_push(|batch| {
        Ok(batch
            .iter()
            .map(|entry| {
                if entry.id == "B" {
                    PushOutcome::rejected(&entry.key(), REJECTION_CONFLICT)
                        .with_server_version(json!({"id": "B", "price": 99}), 500)
                } else {
                    PushOutcome::accepted(&entry.key(), 400)
                }
            })
            .collect())
    });

    let report = sync(&engine).await;
    assert_eq!(report.pushed, 3);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.push_conflicts, 1);

    for id in ["A", "C"] {
        let record = local(&engine, "products", id).unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.server_updated_at, Some(400));
    }
    let remaining = engine.outbox().entries().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "B");
    assert!(remaining[0].held);
    assert_eq!(
        local(&engine, "products", "B").unwrap().sync_status,
        SyncStatus::Conflict
    );

    let cases = conflicts_in(&drain_events(&mut events));
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].server_payload, json!({"id": "B", "price": 99}));
    assert_eq!(cases[0].local_payload, json!({"id": "B"}));

    sync(&engine).await;
    assert_eq!(gateway.push_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_without_server_payload_waits_for_next_pull() {
    let (gateway, engine) = scripted_terminal();
    let mut events = engine.subscribe();
    engine
        .record_local_change("products", "B", Operation::Upsert, json!({"price": 1}))
        .unwrap();
    gateway.on_push(|batch| {
        Ok(batch
            .iter()
            .map(|entry| PushOutcome::rejected(&entry.key(), REJECTION_CONFLICT))
            .collect())
    });

    sync(&engine).await;
    assert!(conflicts_in(&drain_events(&mut events)).is_empty());
    assert!(engine.outbox().entries().unwrap()[0].held);
    assert_eq!(
        local(&engine, "products", "B").unwrap().sync_status,
        SyncStatus::Conflict
    );

    gateway.queue_pull(vec![change("products", "B", json!({"price": 2}), 500)]);
    let report = sync(&engine).await;
    assert_eq!(report.flagged, 1);

    let cases = conflicts_in(&drain_events(&mut events));
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].server_payload, json!({"price": 2}));
    assert_eq!(cases[0].local_payload, json!({"price": 1}));
}

#[tokio::test(flavor = "multi_thread")]
async fn other_rejections_back_off_per_entry() {
    let gateway = Arc::new(ScriptedGateway::default());
    let config = test_config("till-1").with_retry_policy(RetryPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        max_exponent: 3,
    });
    let engine = SyncEngine::new(config, open_store(), gateway.clone()).unwrap();
    engine
        .record_local_change("products", "A", Operation::Upsert, json!({}))
        .unwrap();
    gateway.on_push(|batch| {
        Ok(batch
            .iter()
            .map(|entry| PushOutcome::rejected(&entry.key(), "validation"))
            .collect())
    });

    let report = sync(&engine).await;
    assert_eq!(report.rejected, 1);
    let entry = engine.outbox().entries().unwrap().remove(0);
    assert_eq!(entry.attempts, 1);
    assert!(!entry.held);

    // Still inside the entry's backoff window.
    let report = sync(&engine).await;
    assert_eq!(report.pushed, 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = sync(&engine).await;
    assert_eq!(report.pushed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_pull_of_same_changes_is_idempotent() {
    let (gateway, engine) = scripted_terminal();
    let changes = vec![
        change("products", "P1", json!({"price": 1}), 10),
        change("products", "P2", json!({"price": 2}), 11),
    ];
    gateway.queue_pull(changes.clone());
    gateway.queue_pull(changes);

    let first = sync(&engine).await;
    assert_eq!(first.applied, 2);
    let after_first = (
        local(&engine, "products", "P1"),
        local(&engine, "products", "P2"),
    );

    let second = sync(&engine).await;
    assert_eq!(second.applied, 0);
    assert_eq!(second.kept_local, 2);
    assert_eq!(
        (
            local(&engine, "products", "P1"),
            local(&engine, "products", "P2"),
        ),
        after_first
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_edit_survives_older_server_change() {
    let (gateway, engine) = scripted_terminal();
    gateway.queue_pull(vec![change("products", "P1", json!({"price": 1}), 10)]);
    sync(&engine).await;

    gateway.on_push(|_| Err(Error::transport("offline")));
    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 5}))
        .unwrap();
    let _ = engine.sync_now(SyncTrigger::Manual).await;

    gateway.queue_pull(vec![change("products", "P1", json!({"price": 1}), 10)]);
    let _ = engine.sync_now(SyncTrigger::Manual).await;

    let record = local(&engine, "products", "P1").unwrap();
    assert_eq!(record.payload, json!({"price": 5}));
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert_eq!(engine.outbox().len().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_server_changes_are_skipped() {
    let (gateway, engine) = scripted_terminal();
    gateway.queue_pull(vec![
        change("", "P0", json!({}), 9),
        change("_outbox", "products/P1", json!({}), 10),
        change("products", "P2", json!({"price": 2}), 11),
    ]);

    let report = sync(&engine).await;
    assert_eq!(report.skipped, 2);
    assert_eq!(report.applied, 1);
    assert!(local(&engine, "products", "P2").is_some());
    assert!(engine.outbox().is_empty().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn edits_before_sync_coalesce_into_one_push() {
    let server = MemoryServer::new();
    let engine = terminal(&server, "till-1");

    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();
    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 2}))
        .unwrap();
    assert_eq!(engine.outbox().len().unwrap(), 1);

    let report = sync(&engine).await;
    assert_eq!(report.pushed, 1);
    assert_eq!(server.push_requests().unwrap(), 1);
    assert_eq!(
        server.get("products", "P1").unwrap().map(|(payload, _, _)| payload),
        Some(json!({"price": 2}))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn two_terminals_converge_through_the_server() {
    let server = MemoryServer::new();
    let front = terminal(&server, "till-front");
    let back = terminal(&server, "till-back");

    front
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();
    sync(&front).await;
    sync(&back).await;
    assert_eq!(
        local(&back, "products", "P1").unwrap().payload,
        json!({"price": 1})
    );

    back.record_local_change("products", "P1", Operation::Upsert, json!({"price": 3}))
        .unwrap();
    back.record_local_change("products", "P2", Operation::Upsert, json!({"price": 4}))
        .unwrap();
    sync(&back).await;
    sync(&front).await;

    for (key, payload) in server.snapshot().unwrap() {
        for engine in [&front, &back] {
            let record = local(engine, &key.table, &key.id).unwrap();
            assert_eq!(record.payload, payload);
            assert_eq!(record.sync_status, SyncStatus::Synced);
        }
    }
    assert!(front.open_conflicts().unwrap().is_empty());
    assert!(back.open_conflicts().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn local_delete_is_pushed_then_purged() {
    let server = MemoryServer::new();
    let engine = terminal(&server, "till-1");
    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();
    sync(&engine).await;

    engine
        .record_local_change("products", "P1", Operation::Delete, Value::Null)
        .unwrap();
    let tombstone = local(&engine, "products", "P1").unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.sync_status, SyncStatus::Pending);

    sync(&engine).await;
    assert!(local(&engine, "products", "P1").is_none());
    assert!(server.get("products", "P1").unwrap().unwrap().2);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_an_unpushed_record_cancels_its_creation() {
    let server = MemoryServer::new();
    let engine = terminal(&server, "till-1");
    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();

    let entry = engine
        .record_local_change("products", "P1", Operation::Delete, Value::Null)
        .unwrap();
    assert_eq!(entry, None);
    assert!(local(&engine, "products", "P1").is_none());
    assert!(engine.outbox().is_empty().unwrap());

    sync(&engine).await;
    assert_eq!(server.push_requests().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_delete_removes_local_copy() {
    let server = MemoryServer::new();
    server.write("products", "P1", json!({"price": 1})).unwrap();
    let engine = terminal(&server, "till-1");
    sync(&engine).await;
    assert!(local(&engine, "products", "P1").is_some());

    server.delete("products", "P1").unwrap();
    sync(&engine).await;
    assert!(local(&engine, "products", "P1").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn paginated_pull_commits_every_page() {
    let server = MemoryServer::new();
    server.set_page_size(2).unwrap();
    for id in ["A", "B", "C", "D", "E"] {
        server.write("products", id, json!({"id": id})).unwrap();
    }
    let engine = terminal(&server, "till-1");

    let report = sync(&engine).await;
    assert_eq!(report.pull_pages, 3);
    assert_eq!(report.applied, 5);

    let again = sync(&engine).await;
    assert_eq!(again.pulled, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failure_backs_off_and_resumes_at_push() {
    let server = MemoryServer::new();
    let engine = terminal(&server, "till-1");
    let mut events = engine.subscribe();
    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();

    server.fail_next_pushes(1).unwrap();
    let error = engine.sync_now(SyncTrigger::Manual).await.unwrap_err();
    assert!(error.is_transport());

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::ErrorBackoff);
    assert_eq!(snapshot.consecutive_failures, 1);
    assert_eq!(snapshot.indicator(), crate::models::SyncState::Offline);
    assert_eq!(snapshot.pending, 1);
    assert_eq!(engine.retry_delay(), Some(Duration::from_millis(10)));
    assert!(drain_events(&mut events).iter().any(|event| matches!(
        event,
        SyncEvent::CycleFailed {
            phase: SyncPhase::Pushing,
            ..
        }
    )));

    let report = engine
        .sync_now(SyncTrigger::Retry)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.pull_pages, 0);
    assert_eq!(report.accepted, 1);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::Idle);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert!(snapshot.last_synced_at.is_some());
    assert_eq!(engine.retry_delay(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn consecutive_failures_double_the_delay() {
    let server = MemoryServer::new();
    server.set_online(false).unwrap();
    let engine = terminal(&server, "till-1");

    for _ in 0..3 {
        assert!(engine.sync_now(SyncTrigger::Retry).await.is_err());
    }
    assert_eq!(engine.snapshot().consecutive_failures, 3);
    assert_eq!(engine.retry_delay(), Some(Duration::from_millis(40)));
    assert_eq!(engine.snapshot().last_synced_at, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn store_failure_during_reconcile_keeps_cursor_and_repulls_page() {
    let server = MemoryServer::new();
    server.write("products", "P2", json!({"price": 2})).unwrap();
    server.write("products", "P3", json!({"price": 3})).unwrap();
    let (store, engine) = flaky_terminal(&server);

    store.fail_put("products", 1);
    let error = engine.sync_now(SyncTrigger::Manual).await.unwrap_err();
    assert!(error.is_store());
    assert!(!store.is_armed());

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::ErrorBackoff);
    assert_eq!(snapshot.indicator(), crate::models::SyncState::Error);
    assert_eq!(engine.ledger.checkpoint().unwrap().cursor, None);
    assert!(local(&engine, "products", "P2").is_some());
    assert!(local(&engine, "products", "P3").is_none());

    let report = engine
        .sync_now(SyncTrigger::Retry)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.pulled, 2);
    assert_eq!(report.kept_local, 1);
    assert_eq!(report.applied, 1);
    assert!(engine.ledger.checkpoint().unwrap().cursor.is_some());

    let record = local(&engine, "products", "P3").unwrap();
    assert_eq!(record.payload, json!({"price": 3}));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(engine.snapshot().phase, SyncPhase::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn store_failure_saving_checkpoint_repulls_page() {
    let server = MemoryServer::new();
    server.write("products", "P4", json!({"price": 4})).unwrap();
    let (store, engine) = flaky_terminal(&server);

    store.fail_put(SYNC_STATE_TABLE, 0);
    let error = engine.sync_now(SyncTrigger::Manual).await.unwrap_err();
    assert!(error.is_store());
    assert_eq!(engine.snapshot().phase, SyncPhase::ErrorBackoff);
    assert_eq!(engine.ledger.checkpoint().unwrap().cursor, None);

    let report = engine
        .sync_now(SyncTrigger::Retry)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(report.kept_local, 1);
    assert!(engine.ledger.checkpoint().unwrap().cursor.is_some());
    assert_eq!(
        local(&engine, "products", "P4").unwrap().payload,
        json!({"price": 4})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn store_failure_after_accepted_push_raises_no_conflict() {
    let server = MemoryServer::new();
    let (store, engine) = flaky_terminal(&server);
    let mut events = engine.subscribe();
    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();

    store.fail_put("products", 0);
    let error = engine.sync_now(SyncTrigger::Manual).await.unwrap_err();
    assert!(error.is_store());
    assert_eq!(
        local(&engine, "products", "P1").unwrap().sync_status,
        SyncStatus::Pending
    );
    assert_eq!(engine.outbox().len().unwrap(), 1);

    // A full cycle pulls the terminal's own write back before re-pushing.
    let report = sync(&engine).await;
    assert_eq!(report.flagged, 0);
    assert_eq!(report.kept_local, 1);
    assert_eq!(report.accepted, 1);

    let (_, version, _) = server.get("products", "P1").unwrap().unwrap();
    let record = local(&engine, "products", "P1").unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.server_updated_at, Some(version));
    assert!(engine.outbox().is_empty().unwrap());
    assert!(engine.open_conflicts().unwrap().is_empty());
    assert!(conflicts_in(&drain_events(&mut events)).is_empty());
    assert_eq!(server.push_requests().unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn local_resolution_pushes_terminal_version() {
    let (server, engine) = invoice_conflict().await;
    sync(&engine).await;
    let mut events = engine.subscribe();

    let key = RecordKey::new("invoices", "INV-1");
    engine
        .resolve(&ResolutionDecision::new(&key, Resolution::Local))
        .unwrap();

    let entry = engine.outbox().get(&key).unwrap().unwrap();
    assert_eq!(entry.based_on_server_updated_at, Some(12));
    assert!(!entry.held);
    assert_eq!(
        local(&engine, "invoices", "INV-1").unwrap().sync_status,
        SyncStatus::Pending
    );
    assert!(engine.open_conflicts().unwrap().is_empty());

    sync(&engine).await;
    assert_eq!(
        server.get("invoices", "INV-1").unwrap().map(|(payload, _, _)| payload),
        Some(json!({"total": 110, "note": "terminal"}))
    );
    assert!(drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, SyncEvent::ConflictResolved(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_resolution_takes_server_version() {
    let (server, engine) = invoice_conflict().await;
    sync(&engine).await;

    let key = RecordKey::new("invoices", "INV-1");
    engine
        .resolve(&ResolutionDecision::new(&key, Resolution::Server))
        .unwrap();

    let record = local(&engine, "invoices", "INV-1").unwrap();
    assert_eq!(record.payload, json!({"total": 90, "note": "office"}));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.server_updated_at, Some(12));
    assert!(engine.outbox().is_empty().unwrap());

    sync(&engine).await;
    assert_eq!(server.push_requests().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn skipped_conflict_is_raised_again_next_cycle() {
    let (_server, engine) = invoice_conflict().await;
    sync(&engine).await;
    let mut events = engine.subscribe();

    let key = RecordKey::new("invoices", "INV-1");
    engine
        .resolve(&ResolutionDecision::new(&key, Resolution::Skip))
        .unwrap();
    assert!(engine.open_conflicts().unwrap()[0].deferred);
    assert!(matches!(
        engine.record_local_change("invoices", "INV-1", Operation::Upsert, json!({})),
        Err(Error::RecordInConflict(_))
    ));

    sync(&engine).await;
    let cases = conflicts_in(&drain_events(&mut events));
    assert_eq!(cases.len(), 1);
    assert!(!cases[0].deferred);
    assert_eq!(engine.open_conflicts().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn resolving_unknown_record_fails() {
    let server = MemoryServer::new();
    let engine = terminal(&server, "till-1");
    let decision = ResolutionDecision::new(&RecordKey::new("invoices", "INV-9"), Resolution::Local);
    assert!(matches!(
        engine.resolve(&decision),
        Err(Error::ConflictNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_local_keys_are_rejected() {
    let server = MemoryServer::new();
    let engine = terminal(&server, "till-1");
    assert!(engine
        .record_local_change("_conflicts", "x", Operation::Upsert, json!({}))
        .is_err());
    assert!(engine
        .record_local_change("products", "", Operation::Upsert, json!({}))
        .is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_during_running_cycle_coalesces_into_rerun() {
    let gateway = Arc::new(BlockingGateway::default());
    let engine = Arc::new(
        SyncEngine::new(test_config("till-1"), open_store(), gateway.clone()).unwrap(),
    );

    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.sync_now(SyncTrigger::Timer).await })
    };
    gateway.entered.notified().await;

    assert_eq!(engine.sync_now(SyncTrigger::Manual).await.unwrap(), None);
    assert_eq!(engine.sync_now(SyncTrigger::LocalChange).await.unwrap(), None);
    gateway.release.notify_one();

    let report = running.await.unwrap().unwrap();
    assert!(report.is_some());
    assert_eq!(gateway.pulls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_survives_engine_restart() {
    let server = MemoryServer::new();
    server.write("products", "P1", json!({"price": 1})).unwrap();
    let store = open_store();

    let engine = SyncEngine::new(
        test_config("till-1"),
        Arc::clone(&store),
        Arc::new(server.gateway()),
    )
    .unwrap();
    sync(&engine).await;
    let last_synced_at = engine.snapshot().last_synced_at;
    drop(engine);

    let restarted =
        SyncEngine::new(test_config("till-1"), store, Arc::new(server.gateway())).unwrap();
    assert_eq!(restarted.snapshot().last_synced_at, last_synced_at);
    let report = sync(&restarted).await;
    assert_eq!(report.pulled, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_pushes_local_changes_in_background() {
    let server = MemoryServer::new();
    let engine = Arc::new(terminal(&server, "till-1"));
    let mut events = engine.subscribe();
    let handle = Arc::clone(&engine).spawn();

    handle
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::CycleCompleted(report) if report.accepted == 1)
    })
    .await;

    assert!(server.get("products", "P1").unwrap().is_some());
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_applies_queued_resolutions() {
    let (_server, engine) = invoice_conflict().await;
    sync(&engine).await;
    let engine = Arc::new(engine);
    let mut events = engine.subscribe();
    let handle = Arc::clone(&engine).spawn();

    let key = RecordKey::new("invoices", "INV-1");
    handle
        .resolve(ResolutionDecision::new(&key, Resolution::Server))
        .await
        .unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::ConflictResolved(decision) if decision.key() == key)
    })
    .await;

    assert!(engine.open_conflicts().unwrap().is_empty());
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timer_pulls_server_changes() {
    let server = MemoryServer::new();
    server.write("products", "P1", json!({"price": 1})).unwrap();
    let config = test_config("till-1").with_sync_interval(Duration::from_millis(50));
    let engine = Arc::new(
        SyncEngine::new(config, open_store(), Arc::new(server.gateway())).unwrap(),
    );
    let mut events = engine.subscribe();
    let handle = Arc::clone(&engine).spawn();

    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::CycleCompleted(report) if report.applied == 1)
    })
    .await;
    server.write("products", "P2", json!({"price": 2})).unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::CycleCompleted(report)
            if report.applied == 1 && report.trigger == SyncTrigger::Timer)
    })
    .await;

    assert!(local(&engine, "products", "P2").is_some());
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_flushes_pending_mutations() {
    let server = MemoryServer::new();
    let engine = Arc::new(terminal(&server, "till-1"));
    let handle = Arc::clone(&engine).spawn();

    engine
        .record_local_change("products", "P1", Operation::Upsert, json!({"price": 1}))
        .unwrap();
    handle.shutdown().await;

    assert!(server.get("products", "P1").unwrap().is_some());
    assert!(engine.outbox().is_empty().unwrap());
}
