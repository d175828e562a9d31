//! Background task driving the engine

use std::future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::{SyncEngine, SyncStatusSnapshot, SyncTrigger};
use crate::error::{Error, Result};
use crate::events::SyncEvent;
use crate::models::{Operation, OutboxEntry, Resolution, ResolutionDecision};

const TRIGGER_CAPACITY: usize = 16;

/// Owner of a running engine task
pub struct SyncHandle {
    engine: Arc<SyncEngine>,
    triggers: mpsc::Sender<SyncTrigger>,
    resolutions: mpsc::Sender<ResolutionDecision>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    grace: Duration,
}

impl SyncEngine {
    /// Start the engine loop on the current tokio runtime.
    ///
    /// With an interval configured the first cycle runs immediately.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (resolutions, resolution_rx) = mpsc::channel(self.config.resolution_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let grace = self.config.shutdown_grace;

        let task = tokio::spawn(run(
            Arc::clone(&self),
            trigger_rx,
            resolution_rx,
            shutdown_rx,
        ));

        SyncHandle {
            engine: self,
            triggers,
            resolutions,
            shutdown,
            task,
            grace,
        }
    }
}

impl SyncHandle {
    pub const fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Ask for a cycle. Triggers queued while one is pending coalesce.
    pub fn trigger(&self, trigger: SyncTrigger) -> Result<()> {
        match self.triggers.try_send(trigger) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ShutDown),
        }
    }

    /// Record a local edit and nudge the loop to push it.
    ///
    /// The edit is durable once queued; with the loop stopped it goes out on
    /// the next start.
    pub fn record_local_change(
        &self,
        table: &str,
        id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<Option<OutboxEntry>> {
        let entry = self
            .engine
            .record_local_change(table, id, operation, payload)?;
        if let Err(error) = self.trigger(SyncTrigger::LocalChange) {
            tracing::warn!(
                "Queued local change for {table}/{id} without a running sync loop: {error}"
            );
        }
        Ok(entry)
    }

    /// Queue a conflict decision for the engine loop.
    pub async fn resolve(&self, decision: ResolutionDecision) -> Result<()> {
        self.resolutions
            .send(decision)
            .await
            .map_err(|_| Error::ShutDown)
    }

    /// Sender for UI components that publish `conflictResolved` decisions
    pub fn resolution_sender(&self) -> mpsc::Sender<ResolutionDecision> {
        self.resolutions.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.engine.status()
    }

    /// Stop the loop, letting an in-flight cycle and a final flush finish
    /// within the grace period.
    pub async fn shutdown(mut self) {
        // The loop may already be gone; nothing to signal then.
        let _ = self.shutdown.send(true);

        match time::timeout(self.grace, &mut self.task).await {
            Ok(Ok(())) => tracing::info!("Sync engine stopped"),
            Ok(Err(error)) => tracing::warn!("Sync engine task ended abnormally: {error}"),
            Err(_) => {
                tracing::warn!(
                    "Sync engine did not stop within {:?}; aborting",
                    self.grace
                );
                self.task.abort();
            }
        }
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    mut triggers: mpsc::Receiver<SyncTrigger>,
    mut resolutions: mpsc::Receiver<ResolutionDecision>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = engine.config.sync_interval.map(|period| {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut retry_at: Option<Instant> = None;

    loop {
        let trigger = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                flush_before_stop(&engine, retry_at.is_some()).await;
                break;
            }
            Some(decision) = resolutions.recv() => {
                match engine.resolve(&decision) {
                    Ok(()) if decision.resolution == Resolution::Local => SyncTrigger::LocalChange,
                    Ok(()) => continue,
                    Err(error) => {
                        tracing::warn!("Ignoring resolution for {}: {error}", decision.key());
                        continue;
                    }
                }
            }
            Some(trigger) = triggers.recv() => trigger,
            () = next_tick(ticker.as_mut()) => SyncTrigger::Timer,
            () = wait_until(retry_at) => SyncTrigger::Retry,
        };

        if retry_at.is_some() && trigger == SyncTrigger::Timer {
            tracing::trace!("Skipping timer tick during backoff");
            continue;
        }

        let mut next = Some(trigger);
        while let Some(trigger) = next.take() {
            retry_at = match engine.sync_now(trigger).await {
                Ok(_) => None,
                Err(_) => engine.retry_delay().map(|delay| Instant::now() + delay),
            };
            next = drain_triggers(&mut triggers, retry_at.is_some());
        }
    }

    tracing::debug!("Sync loop exited");
}

/// Collapse triggers that queued up during a cycle into one follow-up.
fn drain_triggers(
    triggers: &mut mpsc::Receiver<SyncTrigger>,
    backing_off: bool,
) -> Option<SyncTrigger> {
    let mut follow_up = None;
    while let Ok(trigger) = triggers.try_recv() {
        if !backing_off || trigger.bypasses_backoff() {
            follow_up = Some(trigger);
        }
    }
    follow_up
}

async fn flush_before_stop(engine: &SyncEngine, backing_off: bool) {
    if backing_off {
        return;
    }
    match engine.pending_count() {
        Ok(0) => {}
        Ok(pending) => {
            tracing::info!("Flushing {pending} pending mutation(s) before stopping");
            if let Err(error) = engine.sync_now(SyncTrigger::Manual).await {
                tracing::warn!("Final flush failed: {error}");
            }
        }
        Err(error) => tracing::warn!("Could not inspect outbox before stopping: {error}"),
    }
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
