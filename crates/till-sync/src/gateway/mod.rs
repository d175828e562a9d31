//! Remote gateway contract
//!
//! The engine only knows this trait; transport, auth and the server's own
//! storage stay behind it. Implementations must fail fast when connectivity
//! drops so a cycle never hangs on the network.

mod http;
mod memory;

pub use http::HttpGateway;
pub use memory::{MemoryGateway, MemoryServer};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{OutboxEntry, PushOutcome, RemoteChange};

/// One page of server-side changes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullBatch {
    /// Changes strictly after the requested cursor, in server order
    pub changes: Vec<RemoteChange>,
    /// Cursor to resume from; `None` keeps the current one
    pub next_cursor: Option<String>,
    /// More changes are available past `next_cursor`
    pub has_more: bool,
    /// Records the gateway could not decode and dropped
    pub skipped: usize,
}

/// Transport-agnostic access to the authoritative server
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Changes strictly after `since_cursor` (`None` for a full resync).
    ///
    /// Must be idempotent: the same cursor may be pulled repeatedly.
    async fn pull(&self, since_cursor: Option<&str>) -> Result<PullBatch>;

    /// Push entries in order; one outcome per entry, in the same order.
    async fn push(&self, batch: &[OutboxEntry]) -> Result<Vec<PushOutcome>>;
}

/// Check that a push response lines up with the request.
///
/// A response that does not have exactly one outcome per entry, in order,
/// cannot be trusted for any entry and is treated as a transport failure.
pub fn check_outcomes(batch: &[OutboxEntry], outcomes: &[PushOutcome]) -> Result<()> {
    if batch.len() != outcomes.len() {
        return Err(Error::transport(format!(
            "push returned {} outcomes for {} entries",
            outcomes.len(),
            batch.len()
        )));
    }

    for (position, (entry, outcome)) in batch.iter().zip(outcomes).enumerate() {
        if entry.table != outcome.table || entry.id != outcome.id {
            return Err(Error::transport(format!(
                "push outcome {position} is for {}/{} but entry was {}/{}",
                outcome.table, outcome.id, entry.table, entry.id
            )));
        }
    }

    Ok(())
}
