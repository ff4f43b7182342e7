// EdgeRelay Node - process bootstrap for the edge, cloud and IoT roles
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # EdgeRelay Node
//!
//! One binary, three roles of the IoT → edge → cloud pipeline.
//!
//! ## Usage
//!
//! ```bash
//! # Cloud aggregator on port 20000
//! edgerelay-node cloud --port 20000
//!
//! # Edge relay forwarding to the cloud, running an external detector
//! edgerelay-node edge --node-id edge-1 --cloud 127.0.0.1:20000 --processor "python3 detect.py"
//!
//! # Simulated devices spreading a directory of images over two edges
//! edgerelay-node iot --edges 127.0.0.1:10000,127.0.0.1:10001 --data-dir data/images
//! ```
//!
//! Every flag can also be set through the environment variable shown in `--help`.

mod cloud;
mod device;
mod edge;
mod metrics;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use edgerelay::{RelayError, TransportError};
use thiserror::Error;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// EdgeRelay pipeline node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run an edge relay
    Edge(edge::EdgeArgs),
    /// Run the cloud aggregator
    Cloud(cloud::CloudArgs),
    /// Run simulated IoT devices
    Iot(device::IotArgs),
}

/// Errors that end a role
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("EdgeRelay node v{}", edgerelay::VERSION);

    let result = match args.role {
        Role::Edge(args) => edge::run(args).await,
        Role::Cloud(args) => cloud::run(args).await,
        Role::Iot(args) => device::run(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("An error occurred: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_defaults() {
        let args = Args::try_parse_from(["edgerelay-node", "edge"]).unwrap();
        let Role::Edge(edge) = args.role else {
            panic!("expected edge role");
        };
        assert_eq!(edge.port, 10000);
        assert_eq!(edge.workers, 1);
        assert!(edge.processor.is_none());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_iot_edges_are_comma_separated() {
        let args = Args::try_parse_from([
            "edgerelay-node",
            "iot",
            "--edges",
            "10.0.0.1:10000,10.0.0.2:10000",
            "--data-dir",
            "data",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let Role::Iot(iot) = args.role else {
            panic!("expected iot role");
        };
        assert_eq!(iot.edges, vec!["10.0.0.1:10000", "10.0.0.2:10000"]);
        assert_eq!(args.log_level, "debug");
    }

    #[test]
    fn test_iot_requires_data_dir() {
        assert!(Args::try_parse_from(["edgerelay-node", "iot"]).is_err());
    }
}
