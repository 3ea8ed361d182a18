//! Vote tallying.
//!
//! Accumulates pending per-option increments in memory and periodically
//! flushes them into the poll store as atomic counter updates. Counts are
//! sums, so delivery order never matters; only duplication or loss does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::VoteHandler;
use crate::store::ResultStore;

/// Interval between flushes into the poll store.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Pending per-option increments awaiting persistence.
///
/// All access goes through the single internal lock. The lock is held only
/// for map mutation and snapshotting, never across store I/O, so recording
/// a vote can never block on the database.
#[derive(Default)]
pub struct TallyBuffer {
    pending: Mutex<HashMap<String, u64>>,
}

impl TallyBuffer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Record one vote for `option`.
    pub fn record(&self, option: &str) {
        let mut pending = self.pending.lock();
        *pending.entry(option.to_string()).or_insert(0) += 1;
    }

    /// Copy of the current pending map.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.pending.lock().clone()
    }

    /// Remove a fully persisted snapshot from the pending map.
    ///
    /// Votes recorded while the snapshot was being persisted keep their
    /// residual counts; entries that reach zero are dropped. The pending map
    /// therefore only empties once everything in it has been persisted.
    pub fn commit(&self, snapshot: &HashMap<String, u64>) {
        let mut pending = self.pending.lock();
        for (option, applied) in snapshot {
            if let Some(count) = pending.get_mut(option) {
                *count = count.saturating_sub(*applied);
            }
        }
        pending.retain(|_, count| *count > 0);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Skipped,
    /// Every increment persisted; the snapshot was committed.
    Flushed,
    /// At least one increment failed; the whole snapshot stays pending.
    Partial,
}

/// Consumes delivered vote events and periodically merges them into the
/// poll store.
pub struct TallyAggregator<S> {
    buffer: TallyBuffer,
    store: Arc<S>,
}

impl<S: ResultStore> TallyAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            buffer: TallyBuffer::new(),
            store,
        }
    }

    pub fn buffer(&self) -> &TallyBuffer {
        &self.buffer
    }

    /// Persist the current pending counts.
    ///
    /// Every increment in the snapshot is attempted even when an earlier one
    /// fails, and the snapshot is committed only if all of them succeeded.
    /// A partially failed batch stays pending in full, so options that did
    /// persist are applied again on the retry — the documented over-count of
    /// at-least-once tallying, preserved rather than papered over.
    pub async fn flush(&self) -> FlushOutcome {
        let snapshot = self.buffer.snapshot();
        if snapshot.is_empty() {
            info!("no new votes, skipping store update");
            return FlushOutcome::Skipped;
        }

        info!(options = snapshot.len(), "updating poll results");
        let mut all_ok = true;
        for (option, count) in &snapshot {
            if let Err(e) = self.store.apply_increment(option, *count).await {
                error!(option = option.as_str(), error = %e, "failed to update poll results");
                all_ok = false;
            }
        }

        if all_ok {
            self.buffer.commit(&snapshot);
            info!("finished updating poll results");
            FlushOutcome::Flushed
        } else {
            FlushOutcome::Partial
        }
    }

    /// Flush on a fixed interval until `stop` is cancelled.
    ///
    /// The final best-effort flush happens after the consumer has stopped
    /// delivering, so it is driven by the caller rather than here.
    pub async fn run(&self, interval: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = stop.cancelled() => {
                    info!("tally flush loop stopping");
                    return;
                }
            }
        }
    }
}

impl<S: ResultStore> VoteHandler for TallyAggregator<S> {
    fn handle(&self, option: &str) {
        self.buffer.record(option);
    }
}
