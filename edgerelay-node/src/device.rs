// EdgeRelay Node - IoT role
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Simulated IoT devices.
//!
//! The files of a data directory are dealt round-robin over the edge
//! addresses. One device session per edge sends its share in batches, timing
//! every send, and reports the accumulated time before disconnecting.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Args;
use edgerelay::config::DEFAULT_DEVICE_HEADER;
use edgerelay::{partition, InboundMessage, TcpSession, TransportError, WorkItem};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::NodeError;

#[derive(Args, Debug)]
pub struct IotArgs {
    /// Base device id; sessions are named `<id>-t<n>`
    #[arg(long, env = "IOT_DEVICE_ID", default_value = "iot-1")]
    pub device_id: String,

    /// Edge relay addresses (host:port), comma separated
    #[arg(
        long,
        env = "EDGE_ADDRESSES",
        value_delimiter = ',',
        default_value = "127.0.0.1:10000"
    )]
    pub edges: Vec<String>,

    /// Directory holding the workload files
    #[arg(long, env = "IOT_DATA_DIR")]
    pub data_dir: PathBuf,

    /// File extension selecting the workload files
    #[arg(long, default_value = "jpg")]
    pub extension: String,

    /// Items per data message
    #[arg(long, default_value = "8")]
    pub batch_size: usize,

    /// How many times each device sends its whole share
    #[arg(long, default_value = "1")]
    pub iterations: usize,
}

/// What one device session did
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub device_id: String,
    pub edge: String,
    pub batches: usize,
    pub transmission: Duration,
}

pub async fn run(args: IotArgs) -> Result<(), NodeError> {
    if args.edges.is_empty() {
        return Err(NodeError::InvalidArgument(
            "at least one edge address is required".to_string(),
        ));
    }
    if args.batch_size == 0 {
        return Err(NodeError::InvalidArgument(
            "--batch-size must be positive".to_string(),
        ));
    }

    let files = partition::collect_files(&args.data_dir, &args.extension)?;
    info!(
        "Found {} .{} files in {}",
        files.len(),
        args.extension,
        args.data_dir.display()
    );
    let shares = partition::round_robin(files, args.edges.len());

    let mut devices = JoinSet::new();
    for (i, (edge, share)) in args.edges.into_iter().zip(shares).enumerate() {
        let device_id = format!("{}-t{}", args.device_id, i + 1);
        let items = work_items(&share);
        devices.spawn(drive(
            device_id,
            edge,
            items,
            args.batch_size,
            args.iterations,
        ));
    }

    let mut failures = 0;
    while let Some(joined) = devices.join_next().await {
        match joined {
            Ok(Ok(report)) => info!(
                "Device {} sent {} batches to {} in {:.3}s",
                report.device_id,
                report.batches,
                report.edge,
                report.transmission.as_secs_f64()
            ),
            Ok(Err(e)) => {
                failures += 1;
                error!("Device session failed: {}", e);
            }
            Err(e) => {
                failures += 1;
                error!("Device task aborted: {}", e);
            }
        }
    }

    if failures > 0 {
        return Err(NodeError::InvalidArgument(format!(
            "{} device session(s) failed",
            failures
        )));
    }
    Ok(())
}

fn work_items(paths: &[PathBuf]) -> Vec<WorkItem> {
    paths
        .iter()
        .map(|path| Value::String(display_path(path)))
        .collect()
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Run one device session against one edge
pub async fn drive(
    device_id: String,
    edge: String,
    items: Vec<WorkItem>,
    batch_size: usize,
    iterations: usize,
) -> Result<DeviceReport, TransportError> {
    let session = TcpSession::connect(&edge, DEFAULT_DEVICE_HEADER, &device_id).await?;
    info!("Device {} connected to {}", device_id, edge);

    let mut transmission = Duration::ZERO;
    let mut batches = 0;
    for _ in 0..iterations {
        for chunk in items.chunks(batch_size.max(1)) {
            let payload = InboundMessage::DataBatch(chunk.to_vec()).to_payload();
            let started = Instant::now();
            session.send_payload(payload).await?;
            transmission += started.elapsed();
            batches += 1;
        }
    }

    let report = InboundMessage::TransmissionReport(transmission.as_secs_f64());
    session.send_payload(report.to_payload()).await?;
    session.disconnect().await;

    Ok(DeviceReport {
        device_id,
        edge,
        batches,
        transmission,
    })
}
