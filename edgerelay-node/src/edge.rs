// EdgeRelay Node - edge role
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Edge relay plus its HTTP status surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use clap::Args;
use edgerelay::processor::{Command, Echo};
use edgerelay::{Processor, RelayConfig, RelayNode, RelayStatus};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::metrics::{encode_metrics, update_from_status};
use crate::NodeError;

#[derive(Args, Debug)]
pub struct EdgeArgs {
    /// Identifier of this relay, announced upstream
    #[arg(long, env = "EDGE_NODE_ID", default_value = "edge-1")]
    pub node_id: String,

    /// Port for IoT connections
    #[arg(short, long, env = "EDGE_PORT", default_value = "10000")]
    pub port: u16,

    /// Cloud aggregator address (host:port)
    #[arg(long, env = "CLOUD_ADDRESS", default_value = "127.0.0.1:20000")]
    pub cloud: String,

    /// Number of processing workers
    #[arg(short, long, env = "EDGE_WORKERS", default_value = "1")]
    pub workers: usize,

    /// External processing command (JSON array on stdin and stdout); echo when absent
    #[arg(long, env = "EDGE_PROCESSOR")]
    pub processor: Option<String>,

    /// Connection header carrying the device id
    #[arg(long, env = "EDGE_DEVICE_HEADER", default_value = "device_id")]
    pub device_header: String,

    /// Port for the HTTP status and metrics endpoints
    #[arg(long, env = "EDGE_METRICS_PORT", default_value = "9100")]
    pub metrics_port: u16,
}

/// Application state shared across handlers.
struct AppState {
    node: Arc<RelayNode>,
    start_time: Instant,
}

pub async fn run(args: EdgeArgs) -> Result<(), NodeError> {
    let processor: Arc<dyn Processor> = match args.processor.as_deref() {
        Some(command_line) => {
            let command = Command::parse(command_line)
                .map_err(|e| NodeError::InvalidArgument(format!("--processor: {}", e)))?;
            info!("Processing with external command: {}", command_line);
            Arc::new(command)
        }
        None => {
            info!("No processor given, echoing batches");
            Arc::new(Echo)
        }
    };

    let config = RelayConfig::new(args.node_id)
        .with_port(args.port)
        .with_cloud_addr(args.cloud)
        .with_workers(args.workers)
        .with_device_header(args.device_header);
    let node = Arc::new(RelayNode::new(config, processor)?);

    let state = Arc::new(AppState {
        node: Arc::clone(&node),
        start_time: Instant::now(),
    });
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
    let http = TcpListener::bind(addr).await?;
    info!("Status endpoint: http://{}/status", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(http, app).await {
            warn!("HTTP server stopped: {}", e);
        }
    });

    let relay = node.run();
    tokio::pin!(relay);

    let result = tokio::select! {
        result = &mut relay => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            node.stop().await;
            relay.await
        }
    };

    http_task.abort();

    let status = node.status();
    info!(
        "Final totals: transmission={:.3}s processing={:.3}s batches={}",
        status.ledger.transmission, status.ledger.processing, status.stats.batches_processed
    );

    result.map_err(NodeError::from)
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Root handler - lists the endpoints.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>EdgeRelay</title></head>
<body>
    <h1>EdgeRelay edge node</h1>
    <ul>
        <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
        <li><a href="/health">/health</a> - Health check</li>
        <li><a href="/ready">/ready</a> - Readiness check (upstream connected)</li>
        <li><a href="/status">/status</a> - Relay status (JSON)</li>
    </ul>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_from_status(&state.node.status());
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once the relay runs with an open upstream session.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.node.is_running() && state.node.is_upstream_connected() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
    }
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    relay: RelayStatus,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: edgerelay::VERSION.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        relay: state.node.status(),
    })
}
