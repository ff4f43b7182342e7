// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Cloud-side aggregation of relay traffic
//!
//! Relays announce their node id as `device_id` when they connect upstream and
//! then send result batches and cumulative ledger snapshots. Since every
//! snapshot carries running totals, only the latest one per edge counts.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::LedgerSnapshot;
use crate::protocol::UpstreamMessage;
use crate::session::SessionRegistry;
use crate::tcp::InboundHandler;

/// What the cloud has seen from one edge relay
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EdgeSummary {
    pub edge_id: String,
    pub result_batches: u64,
    pub result_items: u64,
    /// Latest cumulative ledger reported by the edge
    pub latest: Option<LedgerSnapshot>,
}

/// Aggregated view over all edges
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloudReport {
    pub node_id: String,
    /// Per-edge summaries, sorted by edge id
    pub edges: Vec<EdgeSummary>,
    pub transmission_total: f64,
    pub processing_total: f64,
    pub result_batches: u64,
    pub result_items: u64,
}

impl CloudReport {
    /// Transmission plus processing time over all edges
    pub fn total(&self) -> f64 {
        self.transmission_total + self.processing_total
    }
}

impl fmt::Display for CloudReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} report ===", self.node_id)?;
        for edge in &self.edges {
            let latest = edge.latest.unwrap_or_default();
            writeln!(
                f,
                "{:<16} batches={:<6} items={:<8} transmission={:.3}s processing={:.3}s",
                edge.edge_id,
                edge.result_batches,
                edge.result_items,
                latest.transmission,
                latest.processing
            )?;
        }
        writeln!(
            f,
            "Total: {} edges, {} batches, {} items",
            self.edges.len(),
            self.result_batches,
            self.result_items
        )?;
        writeln!(f, "Transmission time: {:.3}s", self.transmission_total)?;
        writeln!(f, "Processing time:   {:.3}s", self.processing_total)?;
        write!(f, "Total time:        {:.3}s", self.total())
    }
}

/// Collects upstream traffic from any number of relays
#[derive(Debug)]
pub struct CloudAggregator {
    node_id: String,
    sessions: SessionRegistry,
    edges: Mutex<BTreeMap<String, EdgeSummary>>,
}

impl CloudAggregator {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            sessions: SessionRegistry::default(),
            edges: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register an edge connection; returns the edge id
    pub fn handle_connect(&self, connection_id: &str, headers: &HashMap<String, String>) -> String {
        let edge_id = self.sessions.on_connect(connection_id, headers);
        self.lock_edges()
            .entry(edge_id.clone())
            .or_insert_with(|| EdgeSummary {
                edge_id: edge_id.clone(),
                ..EdgeSummary::default()
            });
        info!("Edge node {} connected, session ID: {}", edge_id, connection_id);
        edge_id
    }

    /// Record one upstream payload from a registered edge
    ///
    /// # Errors
    ///
    /// `UnknownSession` for unregistered connections, `MalformedPayload` if
    /// the payload is neither a result batch nor a stats snapshot.
    pub fn handle_message(&self, connection_id: &str, payload: &Value) -> Result<()> {
        let edge_id = self.sessions.lookup(connection_id)?;
        let message = UpstreamMessage::from_payload(payload)?;

        let mut edges = self.lock_edges();
        let edge = edges.entry(edge_id.clone()).or_insert_with(|| EdgeSummary {
            edge_id: edge_id.clone(),
            ..EdgeSummary::default()
        });

        match message {
            UpstreamMessage::Results(batch) => {
                edge.result_batches += 1;
                edge.result_items += batch.items.len() as u64;
                debug!("Received {} results from {}", batch.items.len(), edge_id);
            }
            UpstreamMessage::Stats(snapshot) => {
                edge.latest = Some(snapshot);
                debug!(
                    "Stats from {}: transmission={}s processing={}s",
                    edge_id, snapshot.transmission, snapshot.processing
                );
            }
        }
        Ok(())
    }

    /// Unregister an edge connection; its summary is kept for the report
    pub fn handle_disconnect(&self, connection_id: &str) -> Result<()> {
        let session = self.sessions.on_disconnect(connection_id)?;
        info!("Edge node {} disconnected", session.device_id);
        Ok(())
    }

    /// Number of edges currently connected
    pub fn connected_edges(&self) -> usize {
        self.sessions.count()
    }

    /// Summarise everything received so far
    pub fn report(&self) -> CloudReport {
        let edges: Vec<EdgeSummary> = self.lock_edges().values().cloned().collect();

        let mut report = CloudReport {
            node_id: self.node_id.clone(),
            ..CloudReport::default()
        };
        for edge in &edges {
            report.result_batches += edge.result_batches;
            report.result_items += edge.result_items;
            if let Some(latest) = edge.latest {
                report.transmission_total += latest.transmission;
                report.processing_total += latest.processing;
            }
        }
        report.edges = edges;
        report
    }

    fn lock_edges(&self) -> MutexGuard<'_, BTreeMap<String, EdgeSummary>> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InboundHandler for CloudAggregator {
    fn on_connect(&self, connection_id: &str, headers: &HashMap<String, String>) {
        self.handle_connect(connection_id, headers);
    }

    fn on_message(&self, connection_id: &str, payload: &Value) {
        if let Err(e) = self.handle_message(connection_id, payload) {
            warn!("Dropping upstream message on {}: {}", connection_id, e);
        }
    }

    fn on_disconnect(&self, connection_id: &str) {
        if let Err(e) = self.handle_disconnect(connection_id) {
            warn!("Disconnect without session: {}", e);
        }
    }
}
