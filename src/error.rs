// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication loader.
//!
//! Errors are categorized by where they occur in the replication pipeline and
//! carry enough context to identify the peer involved.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Connection dropped, peer unreachable, framing error |
//! | `Storage` | Yes | Batch application failed mid-stream |
//! | `HandshakeRejected` | No | Self-referential or unparseable source identity |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Loader state machine violation |
//! | `Shutdown` | No | Loader is shutting down |
//! | `Dispose` | No | Aggregated disposal failures |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide how loudly a failed
//! connection is reported. Every outgoing failure goes through the
//! backoff/reconnect path; a non-retryable error additionally raises an
//! operator alert, since retrying alone cannot fix it.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transport-level failure on a replication connection.
    ///
    /// Covers connection drops, unreachable peers and malformed frames.
    /// Retryable with exponential backoff.
    #[error("Transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    /// An inbound handshake was rejected during validation.
    ///
    /// The transport is closed and a rejection record is kept for
    /// diagnostics. Not retryable - the source is misconfigured.
    #[error("Handshake from {peer} rejected: {reason}")]
    HandshakeRejected { peer: String, reason: String },

    /// Storage engine failure while reading or applying a batch.
    ///
    /// Treated as a connection failure: the connection is torn down and the
    /// source resends from its last confirmed etag on reconnect.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Loader state machine violation.
    ///
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// One or more sub-resources failed to dispose cleanly.
    ///
    /// Disposal never short-circuits; individual failures are collected and
    /// surfaced together at the end.
    #[error("Disposal failed: {}", errors.join("; "))]
    Dispose { errors: Vec<String> },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for a given peer.
    pub fn transport(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Check if this error should go through the backoff/reconnect path.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Storage(_) => true,
            Self::HandshakeRejected { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Dispose { .. } => false,
            Self::Internal(_) => false,
        }
    }
}
