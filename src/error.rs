// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for the edge relay
//!
//! Per-message errors ([`RelayError::UnknownSession`],
//! [`RelayError::MalformedPayload`], [`RelayError::Processing`]) are contained
//! where they occur: logged, the message dropped. Only
//! [`RelayError::UpstreamConnect`] and [`RelayError::TransportFatal`] escalate
//! out of [`RelayNode::run`](crate::RelayNode::run).

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Message referencing a connection with no registered session
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Message matching neither known payload shape
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// External processing step failed for a batch
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// Outbound session to the cloud could not be established
    #[error("Cannot connect upstream to {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: TransportError,
    },

    /// Inbound listener failed irrecoverably
    #[error("Transport failure: {0}")]
    TransportFatal(#[source] TransportError),

    /// The relay is shutting down and refuses new work
    #[error("Relay is shutting down")]
    ShuttingDown,

    /// Lifecycle call out of order (run twice, run after stop)
    #[error("Invalid lifecycle transition: {0}")]
    Lifecycle(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by (or around) the external processing step
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    /// The processor reported a failure
    #[error("Processor failed: {0}")]
    Failed(String),

    /// The processor returned a different number of results than items
    #[error("Result count mismatch: {items} items, {results} results")]
    CardinalityMismatch { items: usize, results: usize },

    /// The processor panicked
    #[error("Processor panicked: {0}")]
    Panicked(String),
}

/// Errors from the messaging transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session already closed
    #[error("Session closed")]
    Closed,

    /// Peer sent a frame out of sequence
    #[error("Protocol violation: {0}")]
    Protocol(String),
}
