// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # EdgeRelay - IoT edge relay node
//!
//! The middle tier of an IoT → edge → cloud pipeline. An edge relay accepts
//! sessions from many devices, queues the batches they send, runs each batch
//! through an external processing step and forwards the results, together
//! with its accumulated latency totals, to a single cloud session.
//!
//! ## Key Features
//!
//! - **Decoupled ingestion**: inbound handlers never block on processing
//! - **Latency ledger**: transmission and processing time, summed concurrently
//! - **Pluggable processing**: closures, external commands, or custom [`Processor`]s
//! - **Transport seams**: TCP in production, in-memory doubles in tests
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use edgerelay::{processor::Echo, MemoryConnector, MemoryUpstream, RelayConfig, RelayNode};
//! use serde_json::json;
//!
//! let upstream = Arc::new(MemoryUpstream::new());
//! let node = RelayNode::with_connector(
//!     RelayConfig::new("edge-1"),
//!     Arc::new(Echo),
//!     Arc::new(MemoryConnector::new(upstream)),
//! )
//! .unwrap();
//!
//! let headers = HashMap::from([("device_id".to_string(), "iot-1".to_string())]);
//! node.handle_connect("conn-1", &headers);
//! node.handle_message("conn-1", &json!({"acc_transtime": 0.25})).unwrap();
//!
//! assert_eq!(node.ledger().snapshot().transmission, 0.25);
//! ```
//!
//! ## Modules
//!
//! - [`relay`]: The relay node orchestrator
//! - [`session`], [`queue`], [`ledger`]: Shared state
//! - [`worker`], [`processor`]: Batch processing
//! - [`protocol`], [`transport`], [`tcp`]: Wire format and sessions
//! - [`cloud`]: Cloud-side aggregation
//! - [`partition`]: Workload splitting for device drivers

// Modules
pub mod cloud;
pub mod config;
pub mod error;
pub mod ledger;
pub mod partition;
pub mod processor;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod session;
pub mod stats;
pub mod tcp;
pub mod transport;
pub mod worker;

// Re-exports for convenient access
pub use cloud::{CloudAggregator, CloudReport, EdgeSummary};
pub use config::RelayConfig;
pub use error::{ProcessingError, RelayError, Result, TransportError};
pub use ledger::{LedgerSnapshot, MetricsLedger};
pub use processor::Processor;
pub use protocol::{
    ConnectionId, DeviceId, Frame, InboundMessage, ProcessedBatch, UpstreamMessage, WorkBatch,
    WorkItem,
};
pub use queue::{IngestQueue, PushOutcome};
pub use relay::{RelayNode, RelayStatus};
pub use session::{DeviceSession, SessionRegistry};
pub use stats::{RelayStats, StatsSnapshot};
pub use tcp::{InboundHandler, TcpConnector, TcpSession};
pub use transport::{MemoryConnector, MemoryUpstream, Upstream, UpstreamConnector};
pub use worker::{ProcessingWorker, WorkerHandle, WorkerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
