// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication loader: lifecycle owner for all replication connections of
//! one database.
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!   topology watch ────▶│                              │──▶ outgoing tasks
//!   inbound handshakes ─▶│      ReplicationLoader      │◀── incoming tasks
//!   reconnect timer ────▶│  (event loop, single owner  │
//!                       │   of connection rosters)     │──▶ failure events,
//!                       └──────────────────────────────┘    quorum wakeups
//! ```
//!
//! Connection tasks are fire-and-forget workers: they report outcomes as
//! events and never touch the rosters themselves. All roster mutation happens
//! in the loader's event loop or in the topology watcher, which keeps the
//! failure handling single-writer:
//!
//! - outgoing failure: detach the handle, merge its progress into the
//!   per-destination failure record, back off, queue the reconnect
//! - outgoing success: raise the confirmed-etag watermark, reset the backoff,
//!   wake replication waiters
//! - incoming failure: detach and dispose
//! - incoming success: bump the activity table and nudge sibling handlers
//!
//! Events carry the id of the connection that produced them; an event whose
//! id no longer matches the roster entry is stale (the connection was already
//! superseded) and is dropped.

pub mod types;

use crate::backoff::ConnectionFailureInfo;
use crate::config::{Destination, DestinationKey, ReplicationConfig, TopologySnapshot};
use crate::error::{ReplicationError, Result};
use crate::incoming::{IncomingConnection, IncomingConnectionInfo};
use crate::metrics;
use crate::outgoing::OutgoingConnection;
use crate::quorum::QuorumTracker;
use crate::stats::{BatchOutcome, Direction, ReplicationStatistics};
use crate::storage::StorageEngine;
use crate::transport::{
    HandshakeReply, HandshakeStatus, ReplicationMessage, ReplicationTransport,
    TransportConnector,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};
use types::{
    ConflictResolver, FailureSnapshot, LoaderEvent, NoOpConflictResolver, RejectionRecord,
    ReplicationFailure,
};
use uuid::Uuid;

/// Tombstone backlog past the cleanup frontier that triggers an operator
/// warning when disabled destinations are what is holding the frontier back.
const TOMBSTONE_WARN_THRESHOLD: usize = 16 * 1024;

/// Map key for the whole-database tombstone cleanup frontier.
pub const ALL_DOCUMENTS_COLLECTION: &str = "AllDocuments";

const DISPOSE_TASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns every replication connection of one database.
///
/// Constructed once, [`initialize`](Self::initialize)d with a topology watch
/// channel, and [`dispose`](Self::dispose)d on database shutdown.
pub struct ReplicationLoader<S: StorageEngine> {
    config: ReplicationConfig,
    storage: Arc<S>,
    connector: Arc<dyn TransportConnector>,
    conflict_resolver: Arc<dyn ConflictResolver>,

    /// Last applied topology snapshot; replaced wholesale, never patched.
    topology: RwLock<TopologySnapshot>,

    outgoing: DashMap<DestinationKey, Arc<OutgoingConnection>>,
    /// Survives connection churn: backoff state and carried progress per
    /// destination, kept until the destination leaves the topology.
    outgoing_failures: DashMap<DestinationKey, ConnectionFailureInfo>,
    reconnect_queue: DashMap<DestinationKey, Destination>,
    /// Highest destination-confirmed etag per destination; only ever raised.
    confirmed_etags: DashMap<DestinationKey, u64>,

    incoming: DashMap<Uuid, Arc<IncomingConnection>>,
    incoming_last_activity: DashMap<Uuid, SystemTime>,
    /// Recent rejected handshakes, bounded per source.
    incoming_rejections: DashMap<String, VecDeque<RejectionRecord>>,

    stats: ReplicationStatistics,
    quorum: QuorumTracker,
    number_of_siblings: AtomicUsize,
    next_connection_id: AtomicU64,

    initialized: AtomicBool,
    disposed: AtomicBool,
    events_tx: mpsc::UnboundedSender<LoaderEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<LoaderEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    failures_tx: broadcast::Sender<ReplicationFailure>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: StorageEngine> ReplicationLoader<S> {
    /// Create a loader with no conflict resolution hook.
    pub fn new(
        config: ReplicationConfig,
        storage: Arc<S>,
        connector: Arc<dyn TransportConnector>,
    ) -> Arc<Self> {
        Self::with_resolver(config, storage, connector, Arc::new(NoOpConflictResolver))
    }

    /// Create a loader with a conflict resolution hook, invoked at startup
    /// and whenever the designated resolver changes.
    pub fn with_resolver(
        config: ReplicationConfig,
        storage: Arc<S>,
        connector: Arc<dyn TransportConnector>,
        conflict_resolver: Arc<dyn ConflictResolver>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let (failures_tx, _) = broadcast::channel(64);
        let database_name = config.database_name.clone();
        let stats_history = config.stats_history;
        Arc::new(Self {
            config,
            storage,
            connector,
            conflict_resolver,
            topology: RwLock::new(TopologySnapshot::empty(&database_name)),
            outgoing: DashMap::new(),
            outgoing_failures: DashMap::new(),
            reconnect_queue: DashMap::new(),
            confirmed_etags: DashMap::new(),
            incoming: DashMap::new(),
            incoming_last_activity: DashMap::new(),
            incoming_rejections: DashMap::new(),
            stats: ReplicationStatistics::new(stats_history),
            quorum: QuorumTracker::new(),
            number_of_siblings: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            shutdown_tx,
            failures_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the loader: apply the current topology, then keep following
    /// `topology_rx` until disposed. Call exactly once.
    pub async fn initialize(
        self: &Arc<Self>,
        mut topology_rx: watch::Receiver<TopologySnapshot>,
    ) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ReplicationError::Shutdown);
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(ReplicationError::InvalidState {
                expected: "uninitialized loader".to_string(),
                actual: "already initialized".to_string(),
            });
        }
        info!(database = %self.config.database_name, "initializing replication loader");

        let initial = topology_rx.borrow_and_update().clone();
        if initial
            .database_name
            .eq_ignore_ascii_case(&self.config.database_name)
        {
            self.on_topology_changed(initial).await;
        }

        // First conflict pass happens regardless of topology contents;
        // conflicts may predate this process.
        if let Err(e) = self.conflict_resolver.run_once().await {
            warn!(error = %e, "initial conflict resolution pass failed");
        }

        let mut tasks = self.tasks.lock().await;
        let events_rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ReplicationError::Internal("event channel already taken".to_string()))?;
        tasks.push(tokio::spawn(
            Arc::clone(self).run_event_loop(events_rx, self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_topology_watcher(topology_rx, self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_reconnect_timer(self.shutdown_tx.subscribe()),
        ));
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Topology
    // ───────────────────────────────────────────────────────────────────────

    async fn run_topology_watcher(
        self: Arc<Self>,
        mut topology_rx: watch::Receiver<TopologySnapshot>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                changed = topology_rx.changed() => {
                    if changed.is_err() {
                        debug!("topology channel closed, watcher stopping");
                        return;
                    }
                }
            }
            let snapshot = topology_rx.borrow_and_update().clone();
            if !snapshot
                .database_name
                .eq_ignore_ascii_case(&self.config.database_name)
            {
                trace!(notified = %snapshot.database_name,
                    "ignoring topology notification for another database");
                continue;
            }
            self.on_topology_changed(snapshot).await;
        }
    }

    /// Reconcile the connection roster against a new topology snapshot.
    ///
    /// An unchanged connection roster leaves live connections alone; when it
    /// did change, every outgoing connection is torn down and rebuilt from
    /// the new destination list. In-flight batches are lost, the resumed
    /// connections pick up from the destination-confirmed etag.
    async fn on_topology_changed(self: &Arc<Self>, snapshot: TopologySnapshot) {
        let (connections_changed, resolver_changed) = {
            let current = self.topology.read().unwrap_or_else(|e| e.into_inner());
            (
                current.connections_changed(&snapshot),
                current.conflict_resolution_changed(&snapshot),
            )
        };

        if connections_changed {
            info!(database = %self.config.database_name,
                destinations = snapshot.destinations.len(),
                "replication topology changed, rebuilding outgoing connections");

            self.reconnect_queue.clear();
            let old: Vec<Arc<OutgoingConnection>> = self
                .outgoing
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            // Detach before disposing so late events from the old tasks are
            // recognized as stale.
            self.outgoing.clear();
            for connection in old {
                if let Err(e) = connection.dispose().await {
                    warn!(destination = %connection.destination(), error = %e,
                        "error disposing outgoing connection during topology change");
                }
            }
            self.outgoing_failures.clear();
            self.confirmed_etags.clear();

            let siblings = snapshot.enabled_destinations().count();
            self.number_of_siblings.store(siblings, Ordering::Release);
            for destination in snapshot.enabled_destinations() {
                self.add_and_start_outgoing(destination.clone());
            }
            metrics::set_outgoing_connections(self.outgoing.len());
            metrics::set_reconnect_queue_len(0);
        }

        *self.topology.write().unwrap_or_else(|e| e.into_inner()) = snapshot;

        if resolver_changed {
            debug!("conflict resolver designation changed, running resolution pass");
            if let Err(e) = self.conflict_resolver.run_once().await {
                warn!(error = %e, "conflict resolution pass failed");
            }
        }
    }

    /// Start (or restart) the outgoing connection for one destination,
    /// resuming from whatever progress the previous connection carried.
    fn add_and_start_outgoing(self: &Arc<Self>, destination: Destination) {
        let key = destination.key();
        let resume = {
            let entry = self
                .outgoing_failures
                .entry(key.clone())
                .or_insert_with(|| ConnectionFailureInfo::new(destination.clone()));
            entry.progress().clone()
        };
        let id = self.next_connection_id.fetch_add(1, Ordering::AcqRel);
        let connection = OutgoingConnection::start(
            id,
            &self.config,
            destination,
            &resume,
            Arc::clone(&self.storage),
            Arc::clone(&self.connector),
            self.events_tx.clone(),
        );
        self.outgoing.insert(key, connection);
        metrics::set_outgoing_connections(self.outgoing.len());
    }

    // ───────────────────────────────────────────────────────────────────────
    // Event loop
    // ───────────────────────────────────────────────────────────────────────

    async fn run_event_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<LoaderEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown_rx.changed() => return,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: LoaderEvent) {
        match event {
            LoaderEvent::OutgoingSucceeded {
                connection_id,
                destination,
                last_accepted_etag,
            } => {
                match self.outgoing.get(&destination) {
                    Some(current) if current.id() == connection_id => {}
                    _ => {
                        trace!(destination = %destination, connection_id,
                            "dropping stale outgoing success event");
                        return;
                    }
                }
                // The watermark only moves forward; a slow ack from an older
                // round must not regress it.
                self.confirmed_etags
                    .entry(destination.clone())
                    .and_modify(|etag| *etag = (*etag).max(last_accepted_etag))
                    .or_insert(last_accepted_etag);
                if let Some(mut failure) = self.outgoing_failures.get_mut(&destination) {
                    failure.reset();
                }
                self.stats.add(
                    Direction::Outgoing,
                    BatchOutcome::success(
                        destination.to_string(),
                        format!("destination confirmed etag {last_accepted_etag}"),
                    ),
                );
                self.quorum.notify_round_completed();
            }

            LoaderEvent::OutgoingFailed {
                connection_id,
                destination,
                error,
            } => {
                let removed = self
                    .outgoing
                    .remove_if(&destination, |_, connection| connection.id() == connection_id);
                let Some((_, connection)) = removed else {
                    trace!(destination = %destination, connection_id,
                        "dropping stale outgoing failure event");
                    return;
                };
                metrics::set_outgoing_connections(self.outgoing.len());

                let progress = connection.carried_progress();
                if let Err(e) = connection.dispose().await {
                    warn!(destination = %destination, error = %e,
                        "error disposing failed outgoing connection");
                }

                {
                    let mut failure = self
                        .outgoing_failures
                        .entry(destination.clone())
                        .or_insert_with(|| {
                            ConnectionFailureInfo::new(connection.destination().clone())
                        });
                    failure.update_progress(progress);
                    failure.on_error(error.to_string());
                    if error.is_retryable() {
                        warn!(destination = %destination, error = %error,
                            consecutive_failures = failure.error_count(),
                            retry_in = ?failure.remaining(Instant::now()),
                            "outgoing replication failed, will retry");
                    } else {
                        // A misconfigured destination only recovers through
                        // operator action, but it stays on the retry schedule
                        // so a fix is picked up without a topology change.
                        error!(destination = %destination, error = %error,
                            consecutive_failures = failure.error_count(),
                            "outgoing replication failed with a non-retryable error");
                    }
                }
                self.reconnect_queue
                    .insert(destination.clone(), connection.destination().clone());
                metrics::set_reconnect_queue_len(self.reconnect_queue.len());
                self.stats.add(
                    Direction::Outgoing,
                    BatchOutcome::failed(
                        destination.to_string(),
                        "replication round failed",
                        error.to_string(),
                    ),
                );
                let _ = self.failures_tx.send(ReplicationFailure {
                    peer: destination.to_string(),
                    direction: Direction::Outgoing,
                    error: error.to_string(),
                });
            }

            LoaderEvent::IncomingApplied {
                connection_id,
                source_database_id,
            } => {
                match self.incoming.get(&source_database_id) {
                    Some(current) if current.id() == connection_id => {}
                    _ => return,
                }
                self.incoming_last_activity
                    .insert(source_database_id, SystemTime::now());
                self.stats.add(
                    Direction::Incoming,
                    BatchOutcome::success(source_database_id.to_string(), "batch applied"),
                );
                // Other incoming handlers may care that the database moved
                // under them (conflict status can change without their source
                // sending anything).
                for entry in self.incoming.iter() {
                    if *entry.key() != source_database_id {
                        entry.value().on_replication_from_another_source();
                    }
                }
            }

            LoaderEvent::IncomingFailed {
                connection_id,
                source_database_id,
                error,
            } => {
                let removed = self
                    .incoming
                    .remove_if(&source_database_id, |_, connection| {
                        connection.id() == connection_id
                    });
                let Some((_, connection)) = removed else {
                    return;
                };
                metrics::set_incoming_connections(self.incoming.len());
                warn!(source = %connection.info(), error = %error,
                    "incoming replication connection failed");
                if let Err(e) = connection.dispose().await {
                    warn!(source = %connection.info(), error = %e,
                        "error disposing failed incoming connection");
                }
                self.stats.add(
                    Direction::Incoming,
                    BatchOutcome::failed(
                        source_database_id.to_string(),
                        "connection failed",
                        error.to_string(),
                    ),
                );
                let _ = self.failures_tx.send(ReplicationFailure {
                    peer: source_database_id.to_string(),
                    direction: Direction::Incoming,
                    error: error.to_string(),
                });
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Reconnects
    // ───────────────────────────────────────────────────────────────────────

    async fn run_reconnect_timer(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let now = Instant::now();
            let due: Vec<Destination> = self
                .reconnect_queue
                .iter()
                .filter(|entry| {
                    self.outgoing_failures
                        .get(entry.key())
                        .map(|failure| failure.is_due(now))
                        .unwrap_or(true)
                })
                .map(|entry| entry.value().clone())
                .collect();

            for destination in due {
                let key = destination.key();
                if self.reconnect_queue.remove(&key).is_none() {
                    continue;
                }
                debug!(destination = %destination, "attempting reconnect");
                metrics::record_reconnect_attempt(&key.to_string());
                self.add_and_start_outgoing(destination);
            }
            metrics::set_reconnect_queue_len(self.reconnect_queue.len());

            // Re-arm to the earliest pending retry, bounded by the sweep cap
            // so a missed wakeup can only delay a retry, never lose it.
            let mut wait = if self.reconnect_queue.is_empty() {
                self.config.reconnect_sweep_interval()
            } else {
                self.config.reconnect_sweep_cap()
            };
            let now = Instant::now();
            for entry in self.reconnect_queue.iter() {
                if let Some(failure) = self.outgoing_failures.get(entry.key()) {
                    wait = wait.min(failure.remaining(now));
                }
            }
            wait = wait.max(Duration::from_millis(10));

            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = time::sleep(wait) => {}
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Incoming handshakes
    // ───────────────────────────────────────────────────────────────────────

    /// Accept an inbound replication connection.
    ///
    /// Reads and validates the handshake, replies with this database's
    /// progress, and registers the receive loop. A handshake from a source
    /// that already has a live incoming connection supersedes it: the newest
    /// connection always wins.
    pub async fn accept_incoming(
        self: &Arc<Self>,
        transport: Box<dyn ReplicationTransport>,
    ) -> Result<Arc<IncomingConnection>> {
        if self.disposed.load(Ordering::Acquire) {
            transport.close();
            return Err(ReplicationError::Shutdown);
        }

        let request = match transport.recv().await? {
            ReplicationMessage::Handshake(request) => request,
            other => {
                transport.close();
                return Err(ReplicationError::InvalidState {
                    expected: "Handshake".to_string(),
                    actual: other.kind().to_string(),
                });
            }
        };
        let source_label = format!(
            "{}/{}",
            request.source_database_name, request.source_url
        );

        let info = match IncomingConnectionInfo::from_handshake(&request) {
            Ok(info) => info,
            Err(error) => {
                return self
                    .reject_incoming(transport, source_label, error)
                    .await;
            }
        };
        if info.source_database_id == self.config.database_id {
            let error = ReplicationError::HandshakeRejected {
                peer: source_label.clone(),
                reason: format!(
                    "source database id {} is this database, cannot replicate from itself",
                    info.source_database_id
                ),
            };
            return self.reject_incoming(transport, source_label, error).await;
        }

        // Newest connection from a source wins over an existing one.
        if let Some((_, existing)) = self.incoming.remove(&info.source_database_id) {
            info!(source = %info,
                "superseding existing incoming connection from the same source");
            if let Err(e) = existing.dispose().await {
                warn!(source = %info, error = %e,
                    "error disposing superseded incoming connection");
            }
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::AcqRel);
        let connection = IncomingConnection::new(id, info.clone());
        match self.incoming.entry(info.source_database_id) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
            }
            Entry::Occupied(_) => {
                // A concurrent accept from the same source got here first.
                transport.close();
                return Err(ReplicationError::HandshakeRejected {
                    peer: source_label,
                    reason: "a newer connection from this source registered concurrently"
                        .to_string(),
                });
            }
        }

        let reply = self.build_handshake_reply(info.source_database_id).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(error) => {
                self.incoming.remove(&info.source_database_id);
                transport.close();
                return Err(error);
            }
        };
        if let Err(error) = transport
            .send(ReplicationMessage::HandshakeReply(reply))
            .await
        {
            self.incoming.remove(&info.source_database_id);
            transport.close();
            return Err(error);
        }

        connection.spawn(transport, Arc::clone(&self.storage), self.events_tx.clone());
        self.incoming_last_activity
            .insert(info.source_database_id, SystemTime::now());
        metrics::set_incoming_connections(self.incoming.len());
        info!(source = %info, "incoming replication connection accepted");
        Ok(connection)
    }

    async fn reject_incoming(
        &self,
        transport: Box<dyn ReplicationTransport>,
        source_label: String,
        error: ReplicationError,
    ) -> Result<Arc<IncomingConnection>> {
        warn!(source = %source_label, error = %error, "rejecting incoming handshake");
        metrics::record_rejected_connection(&source_label);
        self.record_rejection(source_label, &error.to_string());

        // Best effort: tell the source why before hanging up.
        let _ = transport
            .send(ReplicationMessage::HandshakeReply(HandshakeReply {
                status: HandshakeStatus::Error {
                    message: error.to_string(),
                },
                last_accepted_document_etag: 0,
                last_accepted_index_transformer_etag: 0,
                document_change_vector: Vec::new(),
                index_transformer_change_vector: Vec::new(),
                resolver_id: None,
                resolver_version: None,
                database_id: self.config.database_id,
            }))
            .await;
        transport.close();
        Err(error)
    }

    fn record_rejection(&self, source: String, reason: &str) {
        let mut history = self.incoming_rejections.entry(source).or_default();
        if history.len() >= self.config.rejection_history.max(1) {
            history.pop_front();
        }
        history.push_back(RejectionRecord {
            reason: reason.to_string(),
            when: SystemTime::now(),
        });
    }

    async fn build_handshake_reply(&self, source_database_id: Uuid) -> Result<HandshakeReply> {
        let document_change_vector = self.storage.database_change_vector().await?;
        let last_accepted_document_etag = self
            .storage
            .last_replicated_etag_from(source_database_id)
            .await?;
        let resolver = self
            .topology
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolver
            .clone();
        Ok(HandshakeReply {
            status: HandshakeStatus::Ok,
            last_accepted_document_etag,
            last_accepted_index_transformer_etag: 0,
            document_change_vector,
            index_transformer_change_vector: Vec::new(),
            resolver_id: resolver.as_ref().map(|r| r.resolving_database_id),
            resolver_version: resolver.as_ref().map(|r| r.version),
            database_id: self.config.database_id,
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Write assurance
    // ───────────────────────────────────────────────────────────────────────

    /// Wait until at least `count` destinations confirmed `etag`, or the
    /// timeout elapses. Returns the number of confirmations observed, which
    /// is the caller's to judge on timeout.
    ///
    /// With no configured destinations there is nobody to wait for and the
    /// requested count is returned as-is; a request exceeding the sibling
    /// count is clamped (it could never complete otherwise).
    pub async fn wait_for_replication(
        &self,
        count: usize,
        timeout: Duration,
        etag: u64,
    ) -> usize {
        let siblings = self.number_of_siblings.load(Ordering::Acquire);
        if siblings == 0 {
            return count;
        }
        let needed = if count > siblings {
            warn!(requested = count, siblings,
                "replication factor exceeds destination count, clamping");
            siblings
        } else {
            count
        };

        let started = Instant::now();
        let achieved = self
            .quorum
            .wait_for(needed, timeout, || self.count_confirmed(etag))
            .await;
        metrics::record_quorum_wait(started.elapsed(), achieved >= needed);
        if achieved < needed {
            debug!(etag, achieved, needed, "replication wait timed out");
        }
        achieved
    }

    /// Destinations whose confirmed etag reached `etag`.
    fn count_confirmed(&self, etag: u64) -> usize {
        self.outgoing
            .iter()
            .filter(|entry| entry.value().progress().last_accepted_document_etag() >= etag)
            .count()
    }

    /// Destinations needed for a majority: `siblings / 2 + 1`.
    pub fn get_quorum_size(&self) -> usize {
        self.number_of_siblings.load(Ordering::Acquire) / 2 + 1
    }

    // ───────────────────────────────────────────────────────────────────────
    // Tombstone retention
    // ───────────────────────────────────────────────────────────────────────

    /// Lowest etag every destination has confirmed.
    ///
    /// Tombstones at or below this etag have been shipped everywhere and are
    /// safe to clean up. Returns:
    ///
    /// - `Some(u64::MAX)` when there are no destinations (nothing restricts
    ///   cleanup)
    /// - `None` when any destination has never been observed (including
    ///   disabled ones) - cleanup must be blocked, that destination may still
    ///   need everything
    /// - `Some(min)` otherwise
    pub fn minimal_etag_for_replication(&self) -> Option<u64> {
        let destinations: Vec<Destination> = {
            let topology = self.topology.read().unwrap_or_else(|e| e.into_inner());
            topology.destinations.clone()
        };
        if destinations.is_empty() {
            return Some(u64::MAX);
        }
        let mut minimum = u64::MAX;
        for destination in &destinations {
            let key = destination.key();
            let confirmed = if let Some(connection) = self.outgoing.get(&key) {
                connection.progress().last_accepted_document_etag()
            } else if let Some(failure) = self.outgoing_failures.get(&key) {
                failure.progress().last_accepted_document_etag
            } else {
                return None;
            };
            minimum = minimum.min(confirmed);
        }
        Some(minimum)
    }

    /// Tombstone cleanup frontier, keyed for the whole database.
    ///
    /// When the frontier is held back while a large tombstone backlog piles
    /// up behind it, and disabled destinations are part of the reason, an
    /// operator warning is logged: disabling a destination silently pins
    /// every tombstone on this node.
    pub async fn tombstone_cleanup_frontier(&self) -> Result<HashMap<String, u64>> {
        let frontier = self.minimal_etag_for_replication().unwrap_or(0);

        if frontier != u64::MAX
            && self
                .storage
                .has_tombstones_after(frontier, TOMBSTONE_WARN_THRESHOLD)
                .await?
        {
            let disabled: Vec<String> = {
                let topology = self.topology.read().unwrap_or_else(|e| e.into_inner());
                topology
                    .destinations
                    .iter()
                    .filter(|d| d.disabled)
                    .map(|d| d.to_string())
                    .collect()
            };
            if !disabled.is_empty() {
                warn!(disabled = ?disabled, frontier,
                    "large tombstone backlog is retained because disabled \
                     replication destinations still need it");
            }
        }

        Ok(HashMap::from([(
            ALL_DOCUMENTS_COLLECTION.to_string(),
            frontier,
        )]))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Introspection
    // ───────────────────────────────────────────────────────────────────────

    /// Destinations with a live outgoing connection.
    pub fn outgoing_destinations(&self) -> Vec<Destination> {
        self.outgoing
            .iter()
            .map(|entry| entry.value().destination().clone())
            .collect()
    }

    /// Sources with a live incoming connection.
    pub fn incoming_sources(&self) -> Vec<IncomingConnectionInfo> {
        self.incoming
            .iter()
            .map(|entry| entry.value().info().clone())
            .collect()
    }

    /// Failure state of every tracked destination.
    pub fn outgoing_failure_snapshot(&self) -> Vec<FailureSnapshot> {
        let now = Instant::now();
        self.outgoing_failures
            .iter()
            .map(|entry| FailureSnapshot::new(entry.key().clone(), entry.value(), now))
            .collect()
    }

    /// Destinations queued for a reconnect attempt.
    pub fn reconnect_queue_snapshot(&self) -> Vec<Destination> {
        self.reconnect_queue
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Recent rejected handshakes per source.
    pub fn rejection_history(&self) -> Vec<(String, Vec<RejectionRecord>)> {
        self.incoming_rejections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    /// Last activity time per incoming source.
    pub fn incoming_activity(&self) -> Vec<(Uuid, SystemTime)> {
        self.incoming_last_activity
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Highest etag the destination confirmed, surviving connection churn.
    pub fn confirmed_etag_for(&self, destination: &DestinationKey) -> Option<u64> {
        if let Some(connection) = self.outgoing.get(destination) {
            return Some(connection.progress().last_accepted_document_etag());
        }
        self.confirmed_etags.get(destination).map(|entry| *entry)
    }

    /// Recent outgoing round outcomes, oldest first.
    pub fn outgoing_stats(&self) -> Vec<BatchOutcome> {
        self.stats.outgoing_snapshot()
    }

    /// Recent incoming round outcomes, oldest first.
    pub fn incoming_stats(&self) -> Vec<BatchOutcome> {
        self.stats.incoming_snapshot()
    }

    /// Subscribe to replication failures as they happen.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<ReplicationFailure> {
        self.failures_tx.subscribe()
    }

    /// The topology snapshot the loader currently operates on.
    pub fn topology(&self) -> TopologySnapshot {
        self.topology
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Shutdown
    // ───────────────────────────────────────────────────────────────────────

    /// Stop every task and connection. Idempotent. Individual disposal
    /// failures never short-circuit; they are collected and reported
    /// together.
    pub async fn dispose(self: &Arc<Self>) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(database = %self.config.database_name, "disposing replication loader");
        let _ = self.shutdown_tx.send(true);
        let mut errors: Vec<String> = Vec::new();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            match time::timeout(DISPOSE_TASK_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    errors.push(format!("loader task panicked: {join_error}"));
                }
                Err(_) => errors.push("loader task did not stop in time".to_string()),
            }
        }

        let outgoing: Vec<Arc<OutgoingConnection>> = self
            .outgoing
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.outgoing.clear();
        for connection in outgoing {
            if let Err(e) = connection.dispose().await {
                errors.push(format!("outgoing {}: {e}", connection.destination()));
            }
        }

        let incoming: Vec<Arc<IncomingConnection>> = self
            .incoming
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.incoming.clear();
        for connection in incoming {
            if let Err(e) = connection.dispose().await {
                errors.push(format!("incoming {}: {e}", connection.info()));
            }
        }

        metrics::set_outgoing_connections(0);
        metrics::set_incoming_connections(0);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReplicationError::Dispose { errors })
        }
    }
}
