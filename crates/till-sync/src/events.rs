//! In-process event bus between the sync engine and UI consumers

use std::time::Duration;

use tokio::sync::broadcast;

use crate::engine::{CycleReport, SyncPhase};
use crate::models::{ConflictCase, ResolutionDecision};

/// Notifications published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// `conflict` topic: a case needs a human decision
    Conflict(ConflictCase),
    /// A resolution decision was applied (or deferred, for `skip`)
    ConflictResolved(ResolutionDecision),
    /// A cycle finished; drives the "last synced at" indicator
    CycleCompleted(CycleReport),
    /// A cycle failed and will be retried after `retry_in`
    CycleFailed {
        phase: SyncPhase,
        error: String,
        retry_in: Duration,
    },
}

/// Bounded broadcast bus; slow subscribers lag rather than block the engine
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: SyncEvent) -> usize {
        self.sender.send(event).unwrap_or_else(|_| {
            tracing::trace!("No event subscribers");
            0
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
