// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication loader for a distributed document store.
//!
//! Manages the full lifecycle of document replication for one database:
//! outgoing push connections to every enabled destination, incoming
//! connections from source databases, failure handling with exponential
//! backoff and automatic reconnects, topology-driven reconciliation, and
//! write-assurance waits ("don't return until k replicas confirmed this
//! etag").
//!
//! # Architecture
//!
//! ```text
//!                          ┌───────────────────────┐
//!   topology snapshots ───▶│                       │
//!    (watch channel)       │   ReplicationLoader   │────▶ OutgoingConnection
//!                          │                       │       (one per enabled
//!   inbound transports ───▶│  rosters, backoff,    │        destination)
//!    (accept_incoming)     │  reconnect timer,     │
//!                          │  event loop           │◀──── IncomingConnection
//!   wait_for_replication ─▶│                       │       (one per source
//!                          └──────────┬────────────┘        database id)
//!                                     │
//!                                     ▼
//!                              StorageEngine
//!                       (change feed, write path,
//!                        change vectors, etags)
//! ```
//!
//! Connection tasks push and apply batches; every outcome flows back to the
//! loader's event loop as an event, and only the loader mutates the
//! connection rosters. Failed outgoing connections keep a per-destination
//! failure record that carries backoff state and the destination-confirmed
//! etag across reconnects.
//!
//! # Quick Start
//!
//! ```no_run
//! use replication_loader::config::{Destination, ReplicationConfig, TopologySnapshot};
//! use replication_loader::storage::InMemoryStorage;
//! use replication_loader::transport::InMemoryNetwork;
//! use replication_loader::ReplicationLoader;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::watch;
//! use uuid::Uuid;
//!
//! # async fn run() -> replication_loader::Result<()> {
//! let config = ReplicationConfig::new("northwind", Uuid::new_v4());
//! let storage = Arc::new(InMemoryStorage::new(config.database_id));
//! let network = InMemoryNetwork::new();
//!
//! let topology = TopologySnapshot {
//!     destinations: vec![Destination::for_testing("northwind", "node-2:10200")],
//!     ..TopologySnapshot::empty("northwind")
//! };
//! let (_topology_tx, topology_rx) = watch::channel(topology);
//!
//! let loader = ReplicationLoader::new(config, storage.clone(), network);
//! loader.initialize(topology_rx).await?;
//!
//! let etag = storage.put("users/1", "users", serde_json::json!({"name": "a"}));
//! let confirmed = loader
//!     .wait_for_replication(1, Duration::from_secs(5), etag)
//!     .await;
//! assert!(confirmed >= 1);
//!
//! loader.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod incoming;
pub mod loader;
pub mod metrics;
pub mod outgoing;
pub mod quorum;
pub mod stats;
pub mod storage;
pub mod transport;

pub use config::{Destination, DestinationKey, ReplicationConfig, TopologySnapshot};
pub use error::{ReplicationError, Result};
pub use incoming::{IncomingConnection, IncomingConnectionInfo};
pub use loader::types::{
    ConflictResolver, FailureSnapshot, NoOpConflictResolver, RejectionRecord,
    ReplicationFailure,
};
pub use loader::ReplicationLoader;
pub use outgoing::OutgoingConnection;
pub use storage::{ChangeVector, ChangeVectorEntry, DocumentChange, StorageEngine};
pub use transport::{ReplicationTransport, TransportConnector};
