// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Relay node orchestration
//!
//! [`RelayNode`] composes two independent roles that share only the
//! [`IngestQueue`] and the [`MetricsLedger`]:
//!
//! - the **listener**, which serves IoT connections and turns their events
//!   into session registrations, queued batches and transmission reports;
//! - the **upstream client**, one outbound session to the cloud, written to
//!   only by the [`ProcessingWorker`]s.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edgerelay::{processor::Echo, RelayConfig, RelayNode};
//!
//! # async fn demo() -> edgerelay::Result<()> {
//! let node = Arc::new(RelayNode::new(RelayConfig::new("edge-1"), Arc::new(Echo))?);
//!
//! let runner = tokio::spawn({
//!     let node = Arc::clone(&node);
//!     async move { node.run().await }
//! });
//!
//! tokio::signal::ctrl_c().await.ok();
//! node.stop().await;
//! runner.await.ok();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::config::{RelayConfig, DEFAULT_DEVICE_HEADER};
use crate::error::{RelayError, Result, TransportError};
use crate::ledger::{LedgerSnapshot, MetricsLedger};
use crate::processor::Processor;
use crate::protocol::{DeviceId, InboundMessage, WorkBatch};
use crate::queue::{IngestQueue, PushOutcome};
use crate::session::{DeviceSession, SessionRegistry};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::tcp::{self, InboundHandler, TcpConnector};
use crate::transport::{Upstream, UpstreamConnector};
use crate::worker::{ProcessingWorker, WorkerHandle};

/// Inbound side: everything the listener's handlers touch
#[derive(Debug)]
struct Ingress {
    registry: SessionRegistry,
    queue: Arc<IngestQueue>,
    ledger: Arc<MetricsLedger>,
    stats: Arc<RelayStats>,
}

impl Ingress {
    fn connect(&self, connection_id: &str, headers: &HashMap<String, String>) -> DeviceId {
        let device_id = self.registry.on_connect(connection_id, headers);
        info!(
            "IoT device {} connected, session ID: {}",
            device_id, connection_id
        );
        device_id
    }

    fn disconnect(&self, connection_id: &str) -> Result<DeviceSession> {
        let session = self.registry.on_disconnect(connection_id)?;
        info!("IoT device {} disconnected", session.device_id);
        Ok(session)
    }

    fn message(&self, connection_id: &str, payload: &Value) -> Result<()> {
        let device_id = self.registry.lookup(connection_id)?;

        match InboundMessage::from_payload(payload)? {
            InboundMessage::TransmissionReport(seconds) => {
                self.ledger.add_transmission_time(seconds);
                info!(
                    "Accumulated transmission time from IoT device {}: {}s",
                    device_id, seconds
                );
            }
            InboundMessage::DataBatch(items) => {
                let count = items.len();
                match self.queue.push(WorkBatch::new(device_id.clone(), items)) {
                    PushOutcome::Queued(depth) => {
                        self.stats.record_received();
                        debug!(
                            "Queued {} items from {} (queue depth {})",
                            count, device_id, depth
                        );
                    }
                    PushOutcome::Closed => return Err(RelayError::ShuttingDown),
                }
            }
        }
        Ok(())
    }
}

impl InboundHandler for Ingress {
    fn on_connect(&self, connection_id: &str, headers: &HashMap<String, String>) {
        self.connect(connection_id, headers);
    }

    fn on_message(&self, connection_id: &str, payload: &Value) {
        if let Err(e) = self.message(connection_id, payload) {
            self.stats.record_dropped();
            warn!("Dropping message on {}: {}", connection_id, e);
        }
    }

    fn on_disconnect(&self, connection_id: &str) {
        if let Err(e) = self.disconnect(connection_id) {
            warn!("Disconnect without session: {}", e);
        }
    }
}

/// Point-in-time view of a relay, for status endpoints and reports
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub node_id: String,
    pub running: bool,
    pub upstream_connected: bool,
    pub ledger: LedgerSnapshot,
    pub queue_depth: usize,
    pub active_sessions: usize,
    pub workers: usize,
    pub stats: StatsSnapshot,
}

/// The edge relay node
pub struct RelayNode {
    config: RelayConfig,
    ingress: Arc<Ingress>,
    processor: Arc<dyn Processor>,
    connector: Arc<dyn UpstreamConnector>,
    upstream: Mutex<Option<Arc<dyn Upstream>>>,
    workers: AsyncMutex<Vec<WorkerHandle>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl RelayNode {
    /// Create a relay forwarding to `config.cloud_addr` over TCP
    pub fn new(config: RelayConfig, processor: Arc<dyn Processor>) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(
            config.cloud_addr.clone(),
            DEFAULT_DEVICE_HEADER,
        ));
        Self::with_connector(config, processor, connector)
    }

    /// Create a relay with a custom upstream connector
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] if the configuration does not validate.
    pub fn with_connector(
        config: RelayConfig,
        processor: Arc<dyn Processor>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let ingress = Arc::new(Ingress {
            registry: SessionRegistry::new(&config.device_header),
            queue: Arc::new(IngestQueue::new()),
            ledger: Arc::new(MetricsLedger::new()),
            stats: Arc::new(RelayStats::new()),
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            ingress,
            processor,
            connector,
            upstream: Mutex::new(None),
            workers: AsyncMutex::new(Vec::new()),
            shutdown,
            running: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Inbound event handlers
    // ------------------------------------------------------------------

    /// Register an inbound connection; returns its device id
    pub fn handle_connect(
        &self,
        connection_id: &str,
        headers: &HashMap<String, String>,
    ) -> DeviceId {
        self.ingress.connect(connection_id, headers)
    }

    /// Unregister an inbound connection
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownSession`] if the connection was never registered.
    pub fn handle_disconnect(&self, connection_id: &str) -> Result<DeviceSession> {
        self.ingress.disconnect(connection_id)
    }

    /// Handle one inbound payload
    ///
    /// Transmission reports go straight into the ledger; data batches are
    /// queued for the workers.
    ///
    /// # Errors
    ///
    /// - [`RelayError::UnknownSession`] if the connection is not registered
    /// - [`RelayError::MalformedPayload`] if the payload matches neither shape
    /// - [`RelayError::ShuttingDown`] if the queue is already closed
    ///
    /// In every case nothing was recorded or queued.
    pub fn handle_message(&self, connection_id: &str, payload: &Value) -> Result<()> {
        self.ingress.message(connection_id, payload)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect upstream, start the workers, then serve `config.listen_addr`
    ///
    /// Returns once [`stop`](Self::stop) is called, or with an error if the
    /// cloud is unreachable or the listener fails.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Cannot bind {}: {}", self.config.listen_addr, e);
                self.stop().await;
                return Err(RelayError::TransportFatal(TransportError::Io(e)));
            }
        };
        self.serve(listener).await
    }

    /// Like [`run`](Self::run), on an already bound listener
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        self.start().await?;
        self.serve(listener).await
    }

    async fn start(&self) -> Result<()> {
        if self.ingress.queue.is_closed() {
            return Err(RelayError::Lifecycle("relay already stopped".to_string()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::Lifecycle("relay already running".to_string()));
        }

        let upstream = match self.connector.connect(&self.config.node_id).await {
            Ok(upstream) => upstream,
            Err(source) => {
                error!("Cannot connect to cloud ({}): {}", self.connector.address(), source);
                self.stop().await;
                return Err(RelayError::UpstreamConnect {
                    addr: self.connector.address(),
                    source,
                });
            }
        };

        // stop() may have run while connect was pending; it holds this lock
        // for its whole sequence, so the check below cannot race it.
        let mut workers = self.workers.lock().await;
        if self.ingress.queue.is_closed() {
            drop(workers);
            warn!("Relay stopped while connecting upstream, closing session");
            upstream.close().await;
            self.running.store(false, Ordering::SeqCst);
            return Err(RelayError::Lifecycle(
                "relay stopped during startup".to_string(),
            ));
        }

        info!("Connected to cloud ({})", self.connector.address());
        *self.lock_upstream() = Some(Arc::clone(&upstream));

        for id in 0..self.config.workers {
            let worker = ProcessingWorker::new(
                id,
                Arc::clone(&self.ingress.queue),
                Arc::clone(&self.ingress.ledger),
                Arc::clone(&self.processor),
                Arc::clone(&upstream),
                Arc::clone(&self.ingress.stats),
            );
            workers.push(worker.spawn());
        }
        Ok(())
    }

    async fn serve(&self, listener: TcpListener) -> Result<()> {
        let shutdown = self.shutdown.subscribe();
        match tcp::serve(listener, Arc::clone(&self.ingress), shutdown).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Inbound listener failed: {}", e);
                self.stop().await;
                Err(RelayError::TransportFatal(e))
            }
        }
    }

    /// Shut the relay down
    ///
    /// Closes the ingest queue, waits for the workers to drain it and stop,
    /// closes the upstream session, then closes the listener. Safe to call
    /// more than once and before [`run`](Self::run).
    pub async fn stop(&self) {
        // Held for the whole sequence so a concurrent second call waits for
        // the first to finish.
        let mut workers = self.workers.lock().await;

        if !self.ingress.queue.is_closed() {
            info!("Stopping relay {}", self.config.node_id);
        }
        self.ingress.queue.close();

        for worker in workers.drain(..) {
            worker.join().await;
        }

        let upstream = self.lock_upstream().take();
        if let Some(upstream) = upstream {
            upstream.close().await;
            info!("Closed upstream session");
        }

        self.shutdown.send_replace(true);
        self.running.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn ledger(&self) -> &MetricsLedger {
        &self.ingress.ledger
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.ingress.queue
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.ingress.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ingress.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_upstream_connected(&self) -> bool {
        self.lock_upstream().is_some()
    }

    /// Snapshot of ledger, queue, sessions and counters
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            node_id: self.config.node_id.clone(),
            running: self.is_running(),
            upstream_connected: self.is_upstream_connected(),
            ledger: self.ingress.ledger.snapshot(),
            queue_depth: self.ingress.queue.len(),
            active_sessions: self.ingress.registry.count(),
            workers: self.config.workers,
            stats: self.ingress.stats.snapshot(),
        }
    }

    fn lock_upstream(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Upstream>>> {
        self.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("queue_depth", &self.ingress.queue.len())
            .field("sessions", &self.ingress.registry.count())
            .finish()
    }
}
