// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outgoing replication connection.
//!
//! One task per enabled destination. The task dials, performs the handshake,
//! then pushes document batches whenever the local etag frontier moves past
//! what the destination has confirmed, falling back to heartbeats when idle:
//!
//! ```text
//!  local write ──▶ storage watch ──┐
//!                                  ├──▶ changes_after(last_sent) ──▶ Batch ──▶ ack
//!  heartbeat interval elapsed ─────┘         (empty? Heartbeat)
//! ```
//!
//! The task itself never retries: any failure is reported to the loader's
//! event loop as a single [`LoaderEvent::OutgoingFailed`] and the task exits.
//! Scheduling the reconnect (with backoff) is the loader's job; carrying the
//! progress over to the replacement connection happens through
//! [`carried_progress`](OutgoingConnection::carried_progress).

use crate::backoff::CarriedProgress;
use crate::config::{Destination, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::loader::types::LoaderEvent;
use crate::metrics;
use crate::storage::StorageEngine;
use crate::transport::{
    HandshakeRequest, HandshakeStatus, ReplicationBatch, ReplicationMessage, TransportConnector,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// How long `dispose` waits for the connection task before aborting it.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Live progress counters of one outgoing connection.
///
/// Shared between the connection task (writer) and the loader (reader), so
/// progress queries never have to wait on the task.
#[derive(Default)]
pub struct OutgoingProgress {
    last_sent_document_etag: AtomicU64,
    last_accepted_document_etag: AtomicU64,
    last_sent_index_transformer_etag: AtomicU64,
    last_heartbeat_millis: AtomicU64,
    destination_database_id: RwLock<Option<Uuid>>,
}

impl OutgoingProgress {
    fn from_carried(progress: &CarriedProgress) -> Self {
        Self {
            last_sent_document_etag: AtomicU64::new(progress.last_accepted_document_etag),
            last_accepted_document_etag: AtomicU64::new(
                progress.last_accepted_document_etag,
            ),
            last_sent_index_transformer_etag: AtomicU64::new(
                progress.last_sent_index_transformer_etag,
            ),
            last_heartbeat_millis: AtomicU64::new(progress.last_heartbeat_millis),
            destination_database_id: RwLock::new(progress.destination_database_id),
        }
    }

    /// Highest etag handed to the wire.
    pub fn last_sent_document_etag(&self) -> u64 {
        self.last_sent_document_etag.load(Ordering::Acquire)
    }

    /// Highest etag the destination confirmed.
    pub fn last_accepted_document_etag(&self) -> u64 {
        self.last_accepted_document_etag.load(Ordering::Acquire)
    }

    /// Epoch millis of the last acknowledged heartbeat or batch.
    pub fn last_heartbeat_millis(&self) -> u64 {
        self.last_heartbeat_millis.load(Ordering::Acquire)
    }

    /// Database id the destination reported, once the handshake completed.
    pub fn destination_database_id(&self) -> Option<Uuid> {
        *self
            .destination_database_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to one outgoing replication connection.
pub struct OutgoingConnection {
    id: u64,
    destination: Destination,
    progress: Arc<OutgoingProgress>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl OutgoingConnection {
    /// Dial `destination` and start replicating. The returned handle owns the
    /// spawned task; failures surface on `events`, never as a return value.
    pub fn start<S: StorageEngine>(
        id: u64,
        config: &ReplicationConfig,
        destination: Destination,
        resume: &CarriedProgress,
        storage: Arc<S>,
        connector: Arc<dyn TransportConnector>,
        events: mpsc::UnboundedSender<LoaderEvent>,
    ) -> Arc<Self> {
        let progress = Arc::new(OutgoingProgress::from_carried(resume));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            id,
            destination: destination.clone(),
            progress: Arc::clone(&progress),
            shutdown_tx,
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let span = info_span!("outgoing_replication", destination = %connection.destination);
        let task = tokio::spawn(
            run_connection(
                id,
                config.clone(),
                destination,
                progress,
                storage,
                connector,
                events,
                shutdown_rx,
            )
            .instrument(span),
        );
        *connection.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        connection
    }

    /// Loader-assigned connection id; events from superseded connections are
    /// filtered by it.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn progress(&self) -> &OutgoingProgress {
        &self.progress
    }

    /// Snapshot the progress for carrying into a reconnect attempt.
    pub fn carried_progress(&self) -> CarriedProgress {
        CarriedProgress {
            destination_database_id: self.progress.destination_database_id(),
            last_accepted_document_etag: self.progress.last_accepted_document_etag(),
            last_sent_index_transformer_etag: self
                .progress
                .last_sent_index_transformer_etag
                .load(Ordering::Acquire),
            last_heartbeat_millis: self.progress.last_heartbeat_millis(),
        }
    }

    /// Stop the connection task and wait for it to exit. Idempotent; a task
    /// that ignores the shutdown signal is aborted after a grace period.
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
                        "outgoing connection to {} panicked: {join_error}",
                        self.destination
                    )));
                }
                Err(_) => {
                    warn!(destination = %self.destination,
                        "outgoing connection task did not stop in time, aborting");
                    // Safe to drop mid-await: the transport dies with the task.
                }
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection<S: StorageEngine>(
    id: u64,
    config: ReplicationConfig,
    destination: Destination,
    progress: Arc<OutgoingProgress>,
    storage: Arc<S>,
    connector: Arc<dyn TransportConnector>,
    events: mpsc::UnboundedSender<LoaderEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let key = destination.key();
    let result = replicate(
        id,
        &config,
        &destination,
        &progress,
        storage,
        connector,
        &events,
        &mut shutdown_rx,
    )
    .await;

    match result {
        Ok(()) => debug!(destination = %destination, "outgoing connection stopped"),
        Err(error) => {
            // Racing with dispose: a failure caused by teardown is not a
            // failure worth reporting.
            if !*shutdown_rx.borrow() {
                metrics::record_outgoing_batch(&key.to_string(), false);
                let _ = events.send(LoaderEvent::OutgoingFailed {
                    connection_id: id,
                    destination: key,
                    error,
                });
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn replicate<S: StorageEngine>(
    id: u64,
    config: &ReplicationConfig,
    destination: &Destination,
    progress: &OutgoingProgress,
    storage: Arc<S>,
    connector: Arc<dyn TransportConnector>,
    events: &mpsc::UnboundedSender<LoaderEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let key = destination.key();
    let transport = connector.connect(destination).await?;

    transport
        .send(ReplicationMessage::Handshake(HandshakeRequest {
            source_machine_name: config.machine_name.clone(),
            source_database_name: config.database_name.clone(),
            source_database_id: config.database_id.to_string(),
            source_url: config.url.clone(),
            api_key: destination.api_key.clone(),
        }))
        .await?;

    let reply = match transport.recv().await? {
        ReplicationMessage::HandshakeReply(reply) => reply,
        other => {
            return Err(ReplicationError::InvalidState {
                expected: "HandshakeReply".to_string(),
                actual: other.kind().to_string(),
            })
        }
    };
    if let HandshakeStatus::Error { message } = reply.status {
        return Err(ReplicationError::HandshakeRejected {
            peer: destination.to_string(),
            reason: message,
        });
    }
    if reply.database_id == config.database_id {
        // The destination is us; a connection here would replicate in a loop.
        return Err(ReplicationError::InvalidState {
            expected: format!("database id other than {}", config.database_id),
            actual: reply.database_id.to_string(),
        });
    }

    *progress
        .destination_database_id
        .write()
        .unwrap_or_else(|e| e.into_inner()) = Some(reply.database_id);
    // The destination's confirmed etag is authoritative; carried progress
    // from a previous connection is only a hint.
    progress
        .last_sent_document_etag
        .store(reply.last_accepted_document_etag, Ordering::Release);
    progress
        .last_accepted_document_etag
        .store(reply.last_accepted_document_etag, Ordering::Release);

    info!(destination = %destination,
        destination_database_id = %reply.database_id,
        resume_from = reply.last_accepted_document_etag,
        "outgoing replication connection established");

    let mut changes_rx = storage.subscribe_changes();
    loop {
        let last_sent = progress.last_sent_document_etag.load(Ordering::Acquire);
        let changes = storage.changes_after(last_sent, config.batch_size).await?;

        let accepted = if changes.is_empty() {
            transport
                .send(ReplicationMessage::Heartbeat { last_document_etag: last_sent })
                .await?;
            let ack = expect_ack(transport.recv().await?)?;
            metrics::record_heartbeat(&key.to_string());
            trace!(destination = %destination, etag = last_sent, "heartbeat acknowledged");
            ack.last_accepted_document_etag
        } else {
            let batch_etag = changes.last().map(|c| c.etag).unwrap_or(last_sent);
            let count = changes.len();
            transport
                .send(ReplicationMessage::Batch(ReplicationBatch {
                    last_document_etag: batch_etag,
                    changes,
                }))
                .await?;
            let ack = expect_ack(transport.recv().await?)?;
            progress
                .last_sent_document_etag
                .store(batch_etag, Ordering::Release);
            metrics::record_outgoing_batch(&key.to_string(), true);
            debug!(destination = %destination, documents = count,
                etag = batch_etag, "batch replicated");
            ack.last_accepted_document_etag
        };

        progress
            .last_accepted_document_etag
            .store(accepted, Ordering::Release);
        progress
            .last_heartbeat_millis
            .store(epoch_millis(), Ordering::Release);
        let _ = events.send(LoaderEvent::OutgoingSucceeded {
            connection_id: id,
            destination: key.clone(),
            last_accepted_etag: accepted,
        });

        // More to send? Skip the idle wait entirely.
        if storage.last_etag().await? > progress.last_sent_document_etag.load(Ordering::Acquire)
        {
            continue;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                transport.close();
                return Ok(());
            }
            changed = changes_rx.changed() => {
                if changed.is_err() {
                    return Err(ReplicationError::Storage(
                        "storage change notifications closed".to_string(),
                    ));
                }
            }
            _ = time::sleep(config.heartbeat_interval()) => {}
        }
    }
}

fn expect_ack(message: ReplicationMessage) -> Result<crate::transport::BatchAck> {
    match message {
        ReplicationMessage::BatchAck(ack) => Ok(ack),
        other => Err(ReplicationError::InvalidState {
            expected: "BatchAck".to_string(),
            actual: other.kind().to_string(),
        }),
    }
}
