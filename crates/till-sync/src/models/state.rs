//! Shared sync state types.

/// Coarse sync indicator rendered by clients next to the "last synced at" time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}
