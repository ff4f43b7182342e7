// EdgeRelay Node - cloud role
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Args;
use edgerelay::{tcp, CloudAggregator};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::NodeError;

#[derive(Args, Debug)]
pub struct CloudArgs {
    /// Identifier of the cloud node
    #[arg(long, env = "CLOUD_NODE_ID", default_value = "cloud-1")]
    pub node_id: String,

    /// Port for edge connections
    #[arg(short, long, env = "CLOUD_PORT", default_value = "20000")]
    pub port: u16,
}

/// Aggregate edge traffic until Ctrl-C, then print the report
pub async fn run(args: CloudArgs) -> Result<(), NodeError> {
    let aggregator = Arc::new(CloudAggregator::new(args.node_id));
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], args.port))).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tcp::serve(listener, Arc::clone(&aggregator), shutdown_rx);
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            shutdown_tx.send_replace(true);
            server.await
        }
    };

    println!("{}", aggregator.report());
    result.map_err(NodeError::from)
}
