// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incoming replication connection.
//!
//! Created by the loader when an inbound handshake passes validation. The
//! task drains batches and heartbeats from one source database, applies them
//! through the storage write path, and acknowledges each with the new
//! accepted etag plus the database change vector.
//!
//! At most one incoming connection exists per source database id; a newer
//! handshake from the same source supersedes the old connection (the loader
//! enforces this, see
//! [`accept_incoming`](crate::ReplicationLoader::accept_incoming)).

use crate::error::{ReplicationError, Result};
use crate::loader::types::LoaderEvent;
use crate::metrics;
use crate::storage::StorageEngine;
use crate::transport::{BatchAck, HandshakeRequest, ReplicationMessage, ReplicationTransport};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info_span, trace, warn, Instrument};
use uuid::Uuid;

const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identity of the source database behind an incoming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingConnectionInfo {
    pub source_database_id: Uuid,
    pub source_database_name: String,
    pub source_url: String,
    pub source_machine_name: String,
}

impl IncomingConnectionInfo {
    /// Parse the identity out of a handshake. Fails when the claimed
    /// database id is not a valid uuid.
    pub fn from_handshake(request: &HandshakeRequest) -> Result<Self> {
        let source_database_id =
            request.source_database_id.parse::<Uuid>().map_err(|_| {
                ReplicationError::HandshakeRejected {
                    peer: format!("{}/{}", request.source_database_name, request.source_url),
                    reason: format!(
                        "could not parse source database id '{}'",
                        request.source_database_id
                    ),
                }
            })?;
        Ok(Self {
            source_database_id,
            source_database_name: request.source_database_name.clone(),
            source_url: request.source_url.clone(),
            source_machine_name: request.source_machine_name.clone(),
        })
    }
}

impl fmt::Display for IncomingConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({})",
            self.source_database_name, self.source_url, self.source_database_id
        )
    }
}

/// Handle to one incoming replication connection.
///
/// Built in two steps: [`new`](Self::new) creates the handle (so the loader
/// can win or lose the registration race without a task running), then
/// [`spawn`](Self::spawn) starts the receive loop.
pub struct IncomingConnection {
    id: u64,
    info: IncomingConnectionInfo,
    last_activity_millis: AtomicU64,
    sibling_rounds: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl IncomingConnection {
    pub fn new(id: u64, info: IncomingConnectionInfo) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            info,
            last_activity_millis: AtomicU64::new(epoch_millis()),
            sibling_rounds: AtomicU64::new(0),
            shutdown_tx,
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Start the receive loop on `transport`.
    ///
    /// A connection that was already disposed (a concurrent supersede can win
    /// between registration and spawn) only closes the transport; no receive
    /// loop is started.
    pub fn spawn<S: StorageEngine>(
        self: &Arc<Self>,
        transport: Box<dyn ReplicationTransport>,
        storage: Arc<S>,
        events: mpsc::UnboundedSender<LoaderEvent>,
    ) {
        if self.disposed.load(Ordering::Acquire) {
            transport.close();
            return;
        }
        let connection = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let span = info_span!("incoming_replication", source = %self.info);
        let task = tokio::spawn(
            run_receive_loop(connection, transport, storage, events, shutdown_rx).instrument(span),
        );
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        // dispose() may have run between the check above and the handle store;
        // it found no task to reap then, so signal the loop again here. The
        // watch send wakes the fresh receiver even though the value is
        // already true.
        if self.disposed.load(Ordering::Acquire) {
            let _ = self.shutdown_tx.send(true);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &IncomingConnectionInfo {
        &self.info
    }

    /// Epoch millis of the last message processed from this source.
    pub fn last_activity_millis(&self) -> u64 {
        self.last_activity_millis.load(Ordering::Acquire)
    }

    /// Called when a sibling incoming connection applies a batch. The counter
    /// lets a handler observe that the database moved underneath it without
    /// its own source sending anything.
    pub fn on_replication_from_another_source(&self) {
        self.sibling_rounds.fetch_add(1, Ordering::AcqRel);
        trace!(source = %self.info, "sibling incoming connection applied a batch");
    }

    /// Batches applied by sibling incoming connections since this one started.
    pub fn sibling_rounds(&self) -> u64 {
        self.sibling_rounds.load(Ordering::Acquire)
    }

    /// Stop the receive loop and wait for it. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            match time::timeout(DISPOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    return Err(ReplicationError::Internal(format!(
                        "incoming connection from {} panicked: {join_error}",
                        self.info
                    )));
                }
                Err(_) => {
                    warn!(source = %self.info,
                        "incoming connection task did not stop in time, aborting");
                }
            }
        }
        Ok(())
    }
}

async fn run_receive_loop<S: StorageEngine>(
    connection: Arc<IncomingConnection>,
    transport: Box<dyn ReplicationTransport>,
    storage: Arc<S>,
    events: mpsc::UnboundedSender<LoaderEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let result = receive(&connection, transport.as_ref(), storage, &events, &mut shutdown_rx).await;
    match result {
        Ok(()) => debug!(source = %connection.info, "incoming connection stopped"),
        Err(error) => {
            if !*shutdown_rx.borrow() {
                metrics::record_incoming_batch(&connection.info.to_string(), false);
                let _ = events.send(LoaderEvent::IncomingFailed {
                    connection_id: connection.id,
                    source_database_id: connection.info.source_database_id,
                    error,
                });
            }
        }
    }
    transport.close();
}

async fn receive<S: StorageEngine>(
    connection: &IncomingConnection,
    transport: &dyn ReplicationTransport,
    storage: Arc<S>,
    events: &mpsc::UnboundedSender<LoaderEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let source_id = connection.info.source_database_id;
    loop {
        let message = tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            message = transport.recv() => message?,
        };

        let accepted = match message {
            ReplicationMessage::Batch(batch) => {
                let count = batch.changes.len();
                let accepted = storage.apply_batch(source_id, batch.changes).await?;
                metrics::record_incoming_batch(&connection.info.to_string(), true);
                debug!(source = %connection.info, documents = count,
                    etag = accepted, "incoming batch applied");
                let _ = events.send(LoaderEvent::IncomingApplied {
                    connection_id: connection.id,
                    source_database_id: source_id,
                });
                accepted
            }
            ReplicationMessage::Heartbeat { last_document_etag } => {
                trace!(source = %connection.info,
                    etag = last_document_etag, "incoming heartbeat");
                storage.last_replicated_etag_from(source_id).await?
            }
            other => {
                return Err(ReplicationError::InvalidState {
                    expected: "Batch or Heartbeat".to_string(),
                    actual: other.kind().to_string(),
                })
            }
        };

        connection
            .last_activity_millis
            .store(epoch_millis(), Ordering::Release);
        let database_change_vector = storage.database_change_vector().await?;
        transport
            .send(ReplicationMessage::BatchAck(BatchAck {
                last_accepted_document_etag: accepted,
                database_change_vector,
            }))
            .await?;
    }
}
