//! Data models for till-sync

mod conflict;
mod outbox_entry;
mod record;
mod remote;
mod state;

pub use conflict::{ConflictCase, Resolution, ResolutionDecision};
pub use outbox_entry::{Operation, OutboxEntry};
pub use record::{RecordKey, SyncRecord, SyncStatus};
pub use remote::{PushOutcome, PushStatus, RemoteChange, REJECTION_CONFLICT};
pub use state::SyncState;
