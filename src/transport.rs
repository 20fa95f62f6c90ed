// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire contract and transport abstraction.
//!
//! The loader treats the wire as an opaque, ordered message channel. The
//! message set mirrors the replication protocol:
//!
//! ```text
//! source                          destination
//!   │  Handshake ──────────────────▶ │   validate source identity
//!   │ ◀────────────── HandshakeReply │   (progress + change vectors)
//!   │  Batch / Heartbeat ──────────▶ │   apply through write path
//!   │ ◀─────────────────── BatchAck  │   (new accepted etag + cv)
//!   │  ...                           │
//! ```
//!
//! Framing and byte-level serialization are external concerns;
//! [`ReplicationTransport`] only moves whole messages. [`InMemoryNetwork`]
//! provides a loopback implementation for tests and standalone use.

use crate::config::Destination;
use crate::error::ReplicationError;
use crate::storage::{BoxFuture, ChangeVector, DocumentChange};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════════

/// First message on every connection, sent by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub source_machine_name: String,
    pub source_database_name: String,
    /// Kept as a raw string so unparseable identities can be rejected (and
    /// recorded) rather than failing deserialization.
    pub source_database_id: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Handshake outcome reported by the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStatus {
    Ok,
    Error { message: String },
}

/// Reply to a [`HandshakeRequest`]: the destination's current progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub status: HandshakeStatus,
    /// Highest document etag the destination already has from this source.
    pub last_accepted_document_etag: u64,
    pub last_accepted_index_transformer_etag: u64,
    pub document_change_vector: ChangeVector,
    pub index_transformer_change_vector: ChangeVector,
    /// Designated conflict resolver, if any.
    pub resolver_id: Option<Uuid>,
    pub resolver_version: Option<i64>,
    /// The responding database's identity.
    pub database_id: Uuid,
}

/// An ordered batch of document changes up to the current etag frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationBatch {
    /// Highest etag included in `changes`.
    pub last_document_etag: u64,
    pub changes: Vec<DocumentChange>,
}

/// Acknowledgment of a batch or heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAck {
    /// New last-accepted document etag on the destination.
    pub last_accepted_document_etag: u64,
    pub database_change_vector: ChangeVector,
}

/// All messages exchanged on a replication connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    Handshake(HandshakeRequest),
    HandshakeReply(HandshakeReply),
    Batch(ReplicationBatch),
    /// Keep-alive carrying the source's etag frontier; acked like a batch.
    Heartbeat { last_document_etag: u64 },
    BatchAck(BatchAck),
}

impl ReplicationMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::HandshakeReply(_) => "HandshakeReply",
            Self::Batch(_) => "Batch",
            Self::Heartbeat { .. } => "Heartbeat",
            Self::BatchAck(_) => "BatchAck",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport traits
// ═══════════════════════════════════════════════════════════════════════════════

/// One ordered, exclusively-owned message channel to a peer.
///
/// A transport is owned by exactly one outgoing or incoming connection; no
/// two tasks write to the same transport concurrently. `close` must be
/// idempotent and safe to call from any thread.
pub trait ReplicationTransport: Send + Sync + 'static {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ()>;

    fn recv(&self) -> BoxFuture<'_, ReplicationMessage>;

    /// Release the underlying channel. Subsequent sends and receives fail.
    fn close(&self);
}

/// Dials a destination and returns a fresh transport.
pub trait TransportConnector: Send + Sync + 'static {
    fn connect(&self, destination: &Destination)
        -> BoxFuture<'_, Box<dyn ReplicationTransport>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// One end of an in-process duplex message channel.
pub struct InMemoryTransport {
    peer: String,
    tx: mpsc::UnboundedSender<ReplicationMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<ReplicationMessage>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryTransport {
    /// Create a connected pair of transports. `peer` labels error messages.
    pub fn pair(peer: &str) -> (InMemoryTransport, InMemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let a = InMemoryTransport {
            peer: peer.to_string(),
            tx: a_tx,
            rx: Mutex::new(a_rx),
            closed: Arc::clone(&closed),
        };
        let b = InMemoryTransport {
            peer: peer.to_string(),
            tx: b_tx,
            rx: Mutex::new(b_rx),
            closed,
        };
        (a, b)
    }
}

impl ReplicationTransport for InMemoryTransport {
    fn send(&self, message: ReplicationMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReplicationError::transport(&self.peer, "connection closed"));
            }
            self.tx
                .send(message)
                .map_err(|_| ReplicationError::transport(&self.peer, "peer hung up"))
        })
    }

    fn recv(&self) -> BoxFuture<'_, ReplicationMessage> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReplicationError::transport(&self.peer, "connection closed"));
            }
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(message) => Ok(message),
                None => Err(ReplicationError::transport(&self.peer, "connection closed")),
            }
        })
    }

    fn close(&self) {
        // Closing either end closes both; in-flight receivers observe EOF.
        self.closed.store(true, Ordering::Release);
    }
}

/// In-process "network": destinations are looked up by url, each accepted
/// connection is handed to the listener registered for that url.
#[derive(Default)]
pub struct InMemoryNetwork {
    listeners: DashMap<String, mpsc::UnboundedSender<InMemoryTransport>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener for `url`. Each inbound connection arrives as the
    /// server end of a transport pair.
    pub fn listen(&self, url: &str) -> mpsc::UnboundedReceiver<InMemoryTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(url.to_string(), tx);
        rx
    }

    /// Drop the listener for `url`; later dials get connection refused.
    pub fn stop_listening(&self, url: &str) {
        self.listeners.remove(url);
    }
}

impl TransportConnector for InMemoryNetwork {
    fn connect(
        &self,
        destination: &Destination,
    ) -> BoxFuture<'_, Box<dyn ReplicationTransport>> {
        let url = destination.url.trim().to_string();
        let label = destination.to_string();
        Box::pin(async move {
            let listener = self.listeners.get(&url).ok_or_else(|| {
                ReplicationError::transport(&label, "connection refused")
            })?;
            let (client, server) = InMemoryTransport::pair(&label);
            listener
                .send(server)
                .map_err(|_| ReplicationError::transport(&label, "listener gone"))?;
            Ok(Box::new(client) as Box<dyn ReplicationTransport>)
        })
    }
}
