//! Per-destination failure tracking and exponential retry schedule.
//!
//! Every destination with a failed outgoing connection gets a
//! [`ConnectionFailureInfo`] record: how many consecutive errors it has seen,
//! when the next reconnect attempt is due, and the last known replication
//! progress so a resumed connection does not regress reporting.
//!
//! # Backoff Schedule
//!
//! ```text
//! Failure  Delay before retry
//! -------  ------------------
//! 1        500ms
//! 2        2s
//! 3        8s
//! 4        32s
//! 5+       60s (cap)
//! ```
//!
//! The tracker never schedules work itself; the loader's reconnect timer
//! polls [`is_due()`](ConnectionFailureInfo::is_due). Any successful
//! send/receive cycle calls [`reset()`](ConnectionFailureInfo::reset), not
//! only a reconnect.

use crate::config::Destination;
use std::cmp;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Delay before the first retry.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(60_000);

/// Growth factor applied per consecutive failure.
const BACKOFF_FACTOR: u32 = 4;

/// Last observed progress of an outgoing connection, carried across
/// reconnects so a resumed connection reports from where the old one left.
#[derive(Debug, Clone, Default)]
pub struct CarriedProgress {
    /// Database id the destination reported in its handshake reply.
    pub destination_database_id: Option<Uuid>,
    /// Highest document etag the peer confirmed.
    pub last_accepted_document_etag: u64,
    /// Highest index/transformer etag sent.
    pub last_sent_index_transformer_etag: u64,
    /// Epoch millis of the last successful heartbeat.
    pub last_heartbeat_millis: u64,
}

/// Failure state for one destination.
#[derive(Debug, Clone)]
pub struct ConnectionFailureInfo {
    destination: Destination,
    error_count: u32,
    next_delay: Duration,
    retry_at: Option<Instant>,
    last_error: Option<String>,
    progress: CarriedProgress,
}

impl ConnectionFailureInfo {
    /// Create a fresh record for a destination that has not failed yet.
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            error_count: 0,
            next_delay: INITIAL_RETRY_DELAY,
            retry_at: None,
            last_error: None,
            progress: CarriedProgress::default(),
        }
    }

    /// The destination this record tracks.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Record a failure: bump the error count, schedule the retry using the
    /// current delay, then quadruple the delay for the next failure (capped).
    pub fn on_error(&mut self, error: impl Into<String>) {
        self.error_count += 1;
        self.retry_at = Some(Instant::now() + self.next_delay);
        self.next_delay = cmp::min(self.next_delay * BACKOFF_FACTOR, MAX_RETRY_DELAY);
        self.last_error = Some(error.into());
    }

    /// Restore the initial delay and zero the error count.
    ///
    /// Called on any successful round-trip, not only on reconnect.
    pub fn reset(&mut self) {
        self.next_delay = INITIAL_RETRY_DELAY;
        self.error_count = 0;
        self.retry_at = None;
    }

    /// Whether the retry deadline has passed.
    ///
    /// A record that has never failed is immediately due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.retry_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Remaining wait until the retry deadline, zero if already due.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.retry_at {
            Some(at) => at.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Consecutive failures since the last success.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Delay that will be applied after the next failure.
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Message of the most recent error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Carried-over progress of the last connection to this destination.
    pub fn progress(&self) -> &CarriedProgress {
        &self.progress
    }

    /// Merge the final progress of a failed connection into this record.
    pub fn update_progress(&mut self, progress: CarriedProgress) {
        self.progress = progress;
    }
}
