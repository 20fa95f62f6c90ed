//! Configuration for the replication loader.
//!
//! Two kinds of configuration live here:
//!
//! - [`ReplicationConfig`]: static per-node settings (identity, heartbeat
//!   cadence, batch sizing). Passed to
//!   [`ReplicationLoader::new()`](crate::ReplicationLoader::new) once.
//! - [`TopologySnapshot`]: the resolved set of replication destinations for
//!   this database. Arrives as an atomic replacement through a watch channel;
//!   the loader diffs old against new, it never patches a snapshot in place.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_loader::config::{Destination, ReplicationConfig, TopologySnapshot};
//! use uuid::Uuid;
//!
//! let config = ReplicationConfig::for_testing("northwind", Uuid::new_v4());
//! let topology = TopologySnapshot {
//!     database_name: "northwind".into(),
//!     destinations: vec![Destination::for_testing("northwind", "node-2:10200")],
//!     ..TopologySnapshot::empty("northwind")
//! };
//! assert_eq!(topology.enabled_destinations().count(), 1);
//! # let _ = config;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Destination: one peer replica this node pushes documents to
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a peer replica this node replicates to.
///
/// Immutable for the lifetime of a connection; topology changes replace the
/// whole destination, connection logic never mutates one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Target database name on the peer.
    pub database: String,

    /// Network address of the peer.
    pub url: String,

    /// Disabled destinations get no outgoing connection, but still block
    /// tombstone cleanup (they represent data not yet shipped).
    #[serde(default)]
    pub disabled: bool,

    /// Optional authentication token sent with the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Destination {
    /// Create an enabled destination for tests.
    pub fn for_testing(database: &str, url: &str) -> Self {
        Self {
            database: database.to_string(),
            url: url.to_string(),
            disabled: false,
            api_key: None,
        }
    }

    /// Stable value-equality key for table lookups.
    ///
    /// Lookups must survive object replacement across topology snapshots, so
    /// tables are keyed by (database, url) rather than by the destination
    /// instance itself.
    pub fn key(&self) -> DestinationKey {
        DestinationKey {
            database: self.database.clone(),
            url: self.url.trim().to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.url)
    }
}

/// Value-equality key identifying a [`Destination`] across topology snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationKey {
    pub database: String,
    pub url: String,
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.url)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TopologySnapshot: the resolved destination set plus resolver metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Designated conflict resolver for the replication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverMetadata {
    /// Database id of the designated resolver.
    pub resolving_database_id: Uuid,
    /// Version of the resolver designation; bumped on every change.
    pub version: i64,
}

/// The resolved replication topology for one database.
///
/// Snapshots arrive as atomic replacements. The loader compares the previous
/// snapshot against the new one to decide what actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Database this snapshot applies to. Notifications for other databases
    /// are ignored by the loader.
    pub database_name: String,

    /// All destinations, enabled or not.
    pub destinations: Vec<Destination>,

    /// Conflict-resolution policy metadata, if a resolver is designated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverMetadata>,
}

impl TopologySnapshot {
    /// A snapshot with no destinations and no resolver.
    pub fn empty(database_name: &str) -> Self {
        Self {
            database_name: database_name.to_string(),
            destinations: Vec::new(),
            resolver: None,
        }
    }

    /// Destinations that should have a live outgoing connection.
    pub fn enabled_destinations(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.iter().filter(|d| !d.disabled)
    }

    /// Whether the connection roster differs from `other`.
    ///
    /// Compares destination values (identity, settings, disabled flag), not
    /// object identity and not ordering.
    pub fn connections_changed(&self, other: &TopologySnapshot) -> bool {
        if self.destinations.len() != other.destinations.len() {
            return true;
        }
        let mut mine: Vec<&Destination> = self.destinations.iter().collect();
        let mut theirs: Vec<&Destination> = other.destinations.iter().collect();
        mine.sort_by(|a, b| (&a.database, &a.url).cmp(&(&b.database, &b.url)));
        theirs.sort_by(|a, b| (&a.database, &a.url).cmp(&(&b.database, &b.url)));
        mine != theirs
    }

    /// Whether the conflict-resolution portion differs from `other`.
    pub fn conflict_resolution_changed(&self, other: &TopologySnapshot) -> bool {
        self.resolver != other.resolver
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationConfig: static per-node settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Static configuration passed to the loader at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of the local database.
    pub database_name: String,

    /// Identity of the local database. Inbound handshakes claiming this id
    /// are rejected (self-replication is invalid).
    pub database_id: Uuid,

    /// Machine name advertised in outgoing handshakes.
    #[serde(default = "default_machine_name")]
    pub machine_name: String,

    /// Our own url advertised in outgoing handshakes.
    #[serde(default)]
    pub url: String,

    /// Minimum interval between heartbeats on an idle outgoing connection.
    /// Too frequent wastes bandwidth; too infrequent delays failure
    /// detection.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub minimal_heartbeat_interval_ms: u64,

    /// Base cadence of the reconnect sweep.
    #[serde(default = "default_reconnect_sweep_ms")]
    pub reconnect_sweep_interval_ms: u64,

    /// Upper bound on re-arming the reconnect timer; guarantees a periodic
    /// safety sweep even when nothing is due.
    #[serde(default = "default_reconnect_sweep_cap_ms")]
    pub reconnect_sweep_cap_ms: u64,

    /// Maximum documents per outgoing batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Outcome records retained per direction for diagnostics.
    #[serde(default = "default_stats_history")]
    pub stats_history: usize,

    /// Rejection records retained per rejected source.
    #[serde(default = "default_rejection_history")]
    pub rejection_history: usize,
}

fn default_machine_name() -> String {
    "unknown".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_reconnect_sweep_ms() -> u64 {
    15_000
}

fn default_reconnect_sweep_cap_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    1024
}

fn default_stats_history() -> usize {
    64
}

fn default_rejection_history() -> usize {
    16
}

impl ReplicationConfig {
    /// Create a config with production defaults.
    pub fn new(database_name: &str, database_id: Uuid) -> Self {
        Self {
            database_name: database_name.to_string(),
            database_id,
            machine_name: default_machine_name(),
            url: String::new(),
            minimal_heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_sweep_interval_ms: default_reconnect_sweep_ms(),
            reconnect_sweep_cap_ms: default_reconnect_sweep_cap_ms(),
            batch_size: default_batch_size(),
            stats_history: default_stats_history(),
            rejection_history: default_rejection_history(),
        }
    }

    /// Create a config with short timings for tests.
    pub fn for_testing(database_name: &str, database_id: Uuid) -> Self {
        Self {
            minimal_heartbeat_interval_ms: 20,
            reconnect_sweep_interval_ms: 25,
            reconnect_sweep_cap_ms: 100,
            batch_size: 64,
            ..Self::new(database_name, database_id)
        }
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.minimal_heartbeat_interval_ms)
    }

    /// Reconnect sweep cadence as a [`Duration`].
    pub fn reconnect_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_sweep_interval_ms)
    }

    /// Reconnect sweep cap as a [`Duration`].
    pub fn reconnect_sweep_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_sweep_cap_ms)
    }
}
