//! Write-assurance waiting.
//!
//! Clients that need durability beyond the local node wait until a given
//! etag has been confirmed by at least `k` destinations. The tracker keeps
//! no per-waiter state: every completed outgoing round bumps a generation
//! counter on a watch channel, and each waiter re-evaluates its predicate
//! against the live connection handles. Broadcast-and-recheck keeps the
//! hot path allocation-free and tolerates spurious wakeups.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time;

/// Wakes replication waiters whenever any destination confirms progress.
pub struct QuorumTracker {
    generation: watch::Sender<u64>,
}

impl Default for QuorumTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuorumTracker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }

    /// Signal that an outgoing round completed. Wakes every pending waiter;
    /// each re-checks its own predicate.
    pub fn notify_round_completed(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Wait until `replicated()` reports at least `needed` confirmations or
    /// the timeout elapses. Returns the confirmation count observed last,
    /// which may be below `needed` on timeout.
    pub async fn wait_for(
        &self,
        needed: usize,
        timeout: Duration,
        mut replicated: impl FnMut() -> usize,
    ) -> usize {
        let deadline = Instant::now() + timeout;
        let mut rx = self.generation.subscribe();
        loop {
            // Consume any pending notification before evaluating, so a round
            // that completed between iterations is never missed.
            rx.borrow_and_update();
            let count = replicated();
            if count >= needed {
                return count;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return count;
            }
            match time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Timed out, or the tracker was dropped mid-wait.
                Ok(Err(_)) | Err(_) => return replicated(),
            }
        }
    }
}
