// EdgeRelay Node - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the edge role.
//!
//! Gauges are refreshed from a [`RelayStatus`] right before each scrape;
//! event counters are advanced by the difference since the last one.

use edgerelay::RelayStatus;
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder};
use tracing::warn;

lazy_static! {
    // ============================================================
    // Latency ledger
    // ============================================================

    /// Accumulated transmission time, seconds.
    pub static ref TRANSMISSION_TIME_SECONDS: Gauge = register_gauge!(
        "edgerelay_transmission_time_seconds",
        "Accumulated transmission time in seconds"
    ).unwrap();

    /// Accumulated processing time, seconds.
    pub static ref PROCESSING_TIME_SECONDS: Gauge = register_gauge!(
        "edgerelay_processing_time_seconds",
        "Accumulated processing time in seconds"
    ).unwrap();

    // ============================================================
    // Relay state
    // ============================================================

    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "edgerelay_queue_depth",
        "Batches waiting in the ingest queue"
    ).unwrap();

    pub static ref ACTIVE_SESSIONS: Gauge = register_gauge!(
        "edgerelay_active_sessions",
        "IoT sessions currently registered"
    ).unwrap();

    /// 1 while the upstream session to the cloud is open.
    pub static ref UPSTREAM_CONNECTED: Gauge = register_gauge!(
        "edgerelay_upstream_connected",
        "Upstream session state (1=connected, 0=disconnected)"
    ).unwrap();

    // ============================================================
    // Event totals (mirrored from RelayStats)
    // ============================================================

    pub static ref EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "edgerelay_events_total",
        "Relay events since start",
        &["event"]
    ).unwrap();
}

/// Refresh every metric from a status snapshot.
pub fn update_from_status(status: &RelayStatus) {
    TRANSMISSION_TIME_SECONDS.set(status.ledger.transmission);
    PROCESSING_TIME_SECONDS.set(status.ledger.processing);
    QUEUE_DEPTH.set(status.queue_depth as f64);
    ACTIVE_SESSIONS.set(status.active_sessions as f64);
    UPSTREAM_CONNECTED.set(if status.upstream_connected { 1.0 } else { 0.0 });

    let stats = &status.stats;
    for (event, value) in [
        ("batch_received", stats.batches_received),
        ("batch_processed", stats.batches_processed),
        ("batch_failed", stats.batches_failed),
        ("message_dropped", stats.messages_dropped),
        ("emit_failed", stats.emits_failed),
    ] {
        let counter = EVENTS_TOTAL.with_label_values(&[event]);
        let delta = value as f64 - counter.get();
        // Counters never go down.
        if delta > 0.0 {
            counter.inc_by(delta);
        }
    }
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgerelay::{LedgerSnapshot, StatsSnapshot};

    #[test]
    fn test_encode_metrics() {
        let status = RelayStatus {
            node_id: "edge-1".to_string(),
            running: true,
            upstream_connected: true,
            ledger: LedgerSnapshot {
                transmission: 1.5,
                processing: 2.5,
            },
            queue_depth: 3,
            active_sessions: 2,
            workers: 1,
            stats: StatsSnapshot {
                batches_received: 4,
                ..StatsSnapshot::default()
            },
        };
        update_from_status(&status);

        let output = encode_metrics();
        assert!(output.contains("edgerelay_transmission_time_seconds 1.5"));
        assert!(output.contains("edgerelay_queue_depth 3"));
        assert!(output.contains("edgerelay_events_total{event=\"batch_received\"} 4"));
        assert!(output.contains("# TYPE edgerelay_events_total counter"));

        let later = RelayStatus {
            stats: StatsSnapshot {
                batches_received: 7,
                batches_failed: 1,
                ..StatsSnapshot::default()
            },
            ..status.clone()
        };
        update_from_status(&later);
        update_from_status(&later);
        assert_eq!(EVENTS_TOTAL.with_label_values(&["batch_received"]).get(), 7.0);
        assert_eq!(EVENTS_TOTAL.with_label_values(&["batch_failed"]).get(), 1.0);

        // A smaller value never rewinds the counter.
        update_from_status(&status);
        assert_eq!(EVENTS_TOTAL.with_label_values(&["batch_received"]).get(), 7.0);
    }
}
