//! Engine phases, triggers and the status snapshot

use std::fmt;

use crate::models::SyncState;

/// Where the engine is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Pulling,
    Reconciling,
    Pushing,
    ErrorBackoff,
}

impl SyncPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pulling => "pulling",
            Self::Reconciling => "reconciling",
            Self::Pushing => "pushing",
            Self::ErrorBackoff => "error-backoff",
        }
    }

    /// A cycle is in flight
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pulling | Self::Reconciling | Self::Pushing)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// Periodic timer tick
    Timer,
    /// User asked to sync now
    Manual,
    /// Connectivity came back
    Reconnect,
    /// A local mutation was queued
    LocalChange,
    /// Backoff delay elapsed after a failed cycle
    Retry,
}

impl SyncTrigger {
    /// Explicit triggers start a cycle even while the engine is backing off.
    pub const fn bypasses_backoff(self) -> bool {
        matches!(self, Self::Manual | Self::Reconnect | Self::LocalChange)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timer => f.write_str("timer"),
            Self::Manual => f.write_str("manual"),
            Self::Reconnect => f.write_str("reconnect"),
            Self::LocalChange => f.write_str("local-change"),
            Self::Retry => f.write_str("retry"),
        }
    }
}

/// Point-in-time view of the engine for status indicators
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStatusSnapshot {
    pub phase: SyncPhase,
    /// End of the last successful cycle (Unix ms)
    pub last_synced_at: Option<i64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// The last failure was a transport error (server unreachable)
    pub offline: bool,
    /// Outbox entries not yet acknowledged
    pub pending: usize,
    /// Conflict cases waiting for a decision
    pub open_conflicts: usize,
}

impl SyncStatusSnapshot {
    /// Collapse the snapshot into the coarse UI indicator.
    pub const fn indicator(&self) -> SyncState {
        match self.phase {
            SyncPhase::Pulling | SyncPhase::Reconciling | SyncPhase::Pushing => SyncState::Syncing,
            SyncPhase::ErrorBackoff if self.offline => SyncState::Offline,
            SyncPhase::ErrorBackoff => SyncState::Error,
            SyncPhase::Idle if self.last_synced_at.is_some() => SyncState::Synced,
            SyncPhase::Idle => SyncState::Offline,
        }
    }
}
