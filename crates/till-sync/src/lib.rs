//! till-sync - Offline-first synchronization engine for till terminals
//!
//! A terminal keeps working against its local store while disconnected and
//! later reconciles with the authoritative server. Local edits queue up in the
//! [`Outbox`], server changes are pulled through a [`RemoteGateway`], and the
//! [`resolver`] decides per record whether to apply, ignore, or escalate to a
//! human via the [`EventBus`].

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod outbox;
pub mod resolver;
pub mod store;
mod util;

pub use config::{GatewayConfig, RetryPolicy, SyncConfig};
pub use engine::{CycleReport, SyncEngine, SyncHandle, SyncPhase, SyncStatusSnapshot, SyncTrigger};
pub use error::{Error, Result};
pub use events::{EventBus, SyncEvent};
pub use gateway::{HttpGateway, MemoryGateway, MemoryServer, PullBatch, RemoteGateway};
pub use models::{
    ConflictCase, Operation, OutboxEntry, PushOutcome, PushStatus, RecordKey, RemoteChange,
    Resolution, ResolutionDecision, SyncRecord, SyncState, SyncStatus,
};
pub use outbox::Outbox;
pub use resolver::Decision;
pub use store::{RecordStore, SqliteRecordStore};
