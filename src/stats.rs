//! Bounded log of recent replication outcomes.
//!
//! Pure bookkeeping for operational diagnostics: the last N batch outcomes
//! per direction, appended in O(1) and retrieved as a snapshot copy. No
//! replication behavior depends on its contents.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

/// Direction of a replication connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outgoing => write!(f, "outgoing"),
            Direction::Incoming => write!(f, "incoming"),
        }
    }
}

/// Outcome of a single replication round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    Success,
    Failed,
}

/// One recorded outcome.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub status: ReplicationStatus,
    /// Identity of the peer (destination or source).
    pub peer: String,
    pub message: String,
    /// Error text for failed outcomes.
    pub error: Option<String>,
    pub recorded_at: SystemTime,
}

impl BatchOutcome {
    /// A successful outcome.
    pub fn success(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ReplicationStatus::Success,
            peer: peer.into(),
            message: message.into(),
            error: None,
            recorded_at: SystemTime::now(),
        }
    }

    /// A failed outcome with the causing error.
    pub fn failed(
        peer: impl Into<String>,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: ReplicationStatus::Failed,
            peer: peer.into(),
            message: message.into(),
            error: Some(error.into()),
            recorded_at: SystemTime::now(),
        }
    }
}

/// Thread-safe bounded ring of recent outcomes, per direction.
pub struct ReplicationStatistics {
    capacity: usize,
    outgoing: Mutex<VecDeque<BatchOutcome>>,
    incoming: Mutex<VecDeque<BatchOutcome>>,
}

impl ReplicationStatistics {
    /// Create a recorder keeping `capacity` records per direction.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outgoing: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            incoming: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append an outcome for the given direction, evicting the oldest record
    /// when full.
    pub fn add(&self, direction: Direction, outcome: BatchOutcome) {
        let ring = match direction {
            Direction::Outgoing => &self.outgoing,
            Direction::Incoming => &self.incoming,
        };
        let mut guard = ring.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(outcome);
    }

    /// Snapshot of recent outgoing outcomes, oldest first.
    pub fn outgoing_snapshot(&self) -> Vec<BatchOutcome> {
        let guard = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().cloned().collect()
    }

    /// Snapshot of recent incoming outcomes, oldest first.
    pub fn incoming_snapshot(&self) -> Vec<BatchOutcome> {
        let guard = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().cloned().collect()
    }
}
