//! Event and view types shared between the loader and its connection tasks.

use crate::config::DestinationKey;
use crate::error::ReplicationError;
use crate::stats::Direction;
use crate::storage::BoxFuture;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

/// Internal event sent from a connection task to the loader's event loop.
///
/// Every event carries the id of the connection that produced it so the
/// loader can discard events from superseded connections: a task may still
/// flush its final event after the loader has already replaced it.
#[derive(Debug)]
pub(crate) enum LoaderEvent {
    OutgoingSucceeded {
        connection_id: u64,
        destination: DestinationKey,
        last_accepted_etag: u64,
    },
    OutgoingFailed {
        connection_id: u64,
        destination: DestinationKey,
        error: ReplicationError,
    },
    IncomingApplied {
        connection_id: u64,
        source_database_id: Uuid,
    },
    IncomingFailed {
        connection_id: u64,
        source_database_id: Uuid,
        error: ReplicationError,
    },
}

/// A replication failure published to [`subscribe_failures`] listeners.
///
/// [`subscribe_failures`]: crate::ReplicationLoader::subscribe_failures
#[derive(Debug, Clone)]
pub struct ReplicationFailure {
    /// Destination or source identity, depending on direction.
    pub peer: String,
    pub direction: Direction,
    pub error: String,
}

/// One rejected inbound handshake.
#[derive(Debug, Clone)]
pub struct RejectionRecord {
    pub reason: String,
    pub when: SystemTime,
}

/// Read-only view of the failure state of one destination.
#[derive(Debug, Clone)]
pub struct FailureSnapshot {
    pub destination: DestinationKey,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Time until the next reconnect attempt, `None` when immediately due.
    pub retry_in: Option<Duration>,
}

impl FailureSnapshot {
    pub(crate) fn new(
        destination: DestinationKey,
        info: &crate::backoff::ConnectionFailureInfo,
        now: Instant,
    ) -> Self {
        let remaining = info.remaining(now);
        Self {
            destination,
            error_count: info.error_count(),
            last_error: info.last_error().map(str::to_string),
            retry_in: (!remaining.is_zero()).then_some(remaining),
        }
    }
}

/// Hook invoked when the designated conflict resolver changes and once at
/// startup. Implementations scan stored conflicts and resolve what they can.
pub trait ConflictResolver: Send + Sync + 'static {
    fn run_once(&self) -> BoxFuture<'_, ()>;
}

/// Resolver used when conflict resolution is handled elsewhere.
pub struct NoOpConflictResolver;

impl ConflictResolver for NoOpConflictResolver {
    fn run_once(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
