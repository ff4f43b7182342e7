// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Processing worker
//!
//! A [`ProcessingWorker`] drains the [`IngestQueue`], runs the external
//! processing step on each batch, records the time spent, and forwards the
//! results upstream followed by a stats-only message:
//!
//! ```text
//!   Idle ──pop──▶ Processing ──emit results, emit stats──▶ Idle
//!     │
//!     └── queue closed and empty ──▶ Stopped
//! ```
//!
//! Processing time covers only the processor call. Transmission time covers
//! only the local emit call of the results message, not network transit.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProcessingError, RelayError, Result};
use crate::ledger::MetricsLedger;
use crate::processor::Processor;
use crate::protocol::{ProcessedBatch, UpstreamMessage, WorkBatch, WorkItem};
use crate::queue::IngestQueue;
use crate::stats::RelayStats;
use crate::transport::Upstream;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting on the queue
    Idle,
    /// Handling a batch
    Processing,
    /// Queue closed and drained; the worker has exited
    Stopped,
}

/// Shared, observable worker state
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<WorkerState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(WorkerState::Idle)))
    }

    pub fn get(&self) -> WorkerState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: WorkerState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Drains the ingest queue into the processor and the upstream
pub struct ProcessingWorker {
    id: usize,
    queue: Arc<IngestQueue>,
    ledger: Arc<MetricsLedger>,
    processor: Arc<dyn Processor>,
    upstream: Arc<dyn Upstream>,
    stats: Arc<RelayStats>,
    state: StateCell,
}

/// Handle on a spawned worker
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    state: StateCell,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Wait for the worker to reach [`WorkerState::Stopped`]
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Worker {} ended abnormally: {}", self.id, e);
        }
    }
}

impl ProcessingWorker {
    pub fn new(
        id: usize,
        queue: Arc<IngestQueue>,
        ledger: Arc<MetricsLedger>,
        processor: Arc<dyn Processor>,
        upstream: Arc<dyn Upstream>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            id,
            queue,
            ledger,
            processor,
            upstream,
            stats,
            state: StateCell::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Run the worker on the tokio runtime
    pub fn spawn(self) -> WorkerHandle {
        let id = self.id;
        let state = self.state.clone();
        let task = tokio::spawn(self.run());
        WorkerHandle { id, state, task }
    }

    /// Main loop; returns once the queue is closed and drained
    pub async fn run(self) {
        info!("Worker {} started ({})", self.id, self.processor.name());

        while let Some(batch) = self.queue.pop().await {
            self.state.set(WorkerState::Processing);
            if let Err(e) = self.handle(batch).await {
                error!("Worker {} dropped a batch: {}", self.id, e);
            }
            self.state.set(WorkerState::Idle);
        }

        self.state.set(WorkerState::Stopped);
        info!("Worker {} stopped", self.id);
    }

    /// Process one batch and forward the results
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Processing`] if the processor fails or breaks the
    /// one-result-per-item contract. Nothing is forwarded in that case.
    /// Upstream emit failures are logged and counted, not returned.
    pub async fn handle(&self, batch: WorkBatch) -> Result<()> {
        info!(
            "Received data from IoT device {}: {} items",
            batch.device_id,
            batch.len()
        );

        let started = Instant::now();
        let results = match self.process(batch.items).await {
            Ok(results) => results,
            Err(e) => {
                self.stats.record_failed();
                return Err(RelayError::Processing(e));
            }
        };
        let processing = started.elapsed();
        self.ledger.add_processing(processing);
        self.stats.record_processed();
        debug!(
            "Processed batch from {} in {:.3}s",
            batch.device_id,
            processing.as_secs_f64()
        );

        let message = UpstreamMessage::Results(ProcessedBatch { items: results });
        let started = Instant::now();
        let sent = self.upstream.emit(&message).await;
        self.ledger.add_transmission(started.elapsed());
        if let Err(e) = sent {
            self.stats.record_emit_failed();
            warn!("Failed to forward results of {}: {}", batch.device_id, e);
        }

        let stats = UpstreamMessage::Stats(self.ledger.snapshot());
        if let Err(e) = self.upstream.emit(&stats).await {
            self.stats.record_emit_failed();
            warn!("Failed to forward stats: {}", e);
        }

        Ok(())
    }

    async fn process(&self, items: Vec<WorkItem>) -> std::result::Result<Vec<Value>, ProcessingError> {
        let expected = items.len();
        let processor = Arc::clone(&self.processor);

        let results = tokio::task::spawn_blocking(move || processor.process(&items))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    ProcessingError::Panicked(panic_message(e.into_panic()))
                } else {
                    ProcessingError::Failed("processing task cancelled".to_string())
                }
            })??;

        if results.len() != expected {
            return Err(ProcessingError::CardinalityMismatch {
                items: expected,
                results: results.len(),
            });
        }
        Ok(results)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
