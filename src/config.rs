// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for the relay node

use std::net::SocketAddr;

use crate::error::{RelayError, Result};

/// Default port the relay listens on for IoT devices
pub const DEFAULT_EDGE_PORT: u16 = 10000;

/// Default address of the cloud aggregator
pub const DEFAULT_CLOUD_ADDRESS: &str = "127.0.0.1:20000";

/// Default connection header carrying the device identifier
pub const DEFAULT_DEVICE_HEADER: &str = "device_id";

/// Relay-level configuration, consumed once at [`RelayNode`](crate::RelayNode) construction
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Identifier of this relay, sent upstream as its own device id
    pub node_id: String,

    /// Address the inbound listener binds to
    pub listen_addr: SocketAddr,

    /// Address of the cloud aggregator (`host:port`)
    pub cloud_addr: String,

    /// Number of processing workers draining the ingest queue
    pub workers: usize,

    /// Connection header holding the device id
    pub device_header: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            node_id: "edge-1".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_EDGE_PORT)),
            cloud_addr: DEFAULT_CLOUD_ADDRESS.to_string(),
            workers: 1,
            device_header: DEFAULT_DEVICE_HEADER.to_string(),
        }
    }
}

impl RelayConfig {
    /// Create a configuration for the given node id
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the listen port (all interfaces)
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
        self
    }

    /// Set the cloud aggregator address
    pub fn with_cloud_addr(mut self, addr: impl Into<String>) -> Self {
        self.cloud_addr = addr.into();
        self
    }

    /// Set the number of processing workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the connection header holding the device id
    pub fn with_device_header(mut self, header: impl Into<String>) -> Self {
        self.device_header = header.into();
        self
    }

    /// Check the configuration for values the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(RelayError::InvalidConfig("node id is empty".to_string()));
        }
        if self.workers == 0 {
            return Err(RelayError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if self.device_header.is_empty() {
            return Err(RelayError::InvalidConfig(
                "device header name is empty".to_string(),
            ));
        }
        Ok(())
    }
}
