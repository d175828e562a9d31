//! Conflict resolution policy
//!
//! Pure functions: no I/O, decisions depend only on the record state handed
//! in. That makes reconciliation idempotent, so a crash mid-batch can simply
//! re-pull and re-decide.

use std::fmt;

use serde_json::Value;

use crate::models::{ConflictCase, Operation, OutboxEntry, RemoteChange, SyncRecord};

/// What to do with an incoming server change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Take the server version
    Apply,
    /// Nothing to do; the local state already accounts for the change
    KeepLocal,
    /// Both sides changed since the last common version; ask a human
    Flag,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => f.write_str("apply"),
            Self::KeepLocal => f.write_str("keep-local"),
            Self::Flag => f.write_str("flag"),
        }
    }
}

/// Decide how to reconcile `incoming` with the local record.
///
/// `pending` is the outbox entry for the record, if any. Its
/// `based_on_server_updated_at` is the last version both sides agreed on; a
/// missing base means the record was created locally and is older than any
/// server version.
pub fn decide(
    local: Option<&SyncRecord>,
    pending: Option<&OutboxEntry>,
    incoming: &RemoteChange,
) -> Decision {
    let has_pending_mutation =
        pending.is_some() || local.is_some_and(SyncRecord::has_pending_mutation);

    if !has_pending_mutation {
        let known = local.and_then(|record| record.server_updated_at);
        return match known {
            Some(known) if known >= incoming.server_updated_at => Decision::KeepLocal,
            _ => Decision::Apply,
        };
    }

    let base = pending.map_or_else(
        || local.and_then(|record| record.server_updated_at),
        |entry| entry.based_on_server_updated_at,
    );

    match base {
        Some(base) if incoming.server_updated_at <= base => Decision::KeepLocal,
        _ => Decision::Flag,
    }
}

/// Materialize a flagged decision for the human resolution path.
///
/// Both versions are retained: the local side from the pending outbox
/// snapshot (falling back to the record payload), the server side from the
/// incoming change.
pub fn conflict_case(
    local: &SyncRecord,
    pending: Option<&OutboxEntry>,
    server_payload: Value,
    server_updated_at: Option<i64>,
    server_deleted: bool,
    detected_at: i64,
) -> ConflictCase {
    let (local_payload, local_operation) = pending.map_or_else(
        || {
            let operation = if local.deleted {
                Operation::Delete
            } else {
                Operation::Upsert
            };
            (local.payload.clone(), operation)
        },
        |entry| (entry.payload_snapshot.clone(), entry.operation),
    );

    ConflictCase {
        table: local.table.clone(),
        id: local.id.clone(),
        local_payload,
        server_payload,
        local_updated_at: local.local_updated_at,
        server_updated_at,
        local_operation,
        server_deleted,
        detected_at,
        deferred: false,
    }
}
