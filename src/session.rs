// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Session registry
//!
//! Maps an active connection id to the device id announced in its connect
//! headers. This is the only place the relay keeps per-connection state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::config::DEFAULT_DEVICE_HEADER;
use crate::error::{RelayError, Result};
use crate::protocol::{ConnectionId, DeviceId};

/// One registered connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub connection_id: ConnectionId,
    pub device_id: DeviceId,
}

/// Connection id to device id map with connect/disconnect lifecycle
#[derive(Debug)]
pub struct SessionRegistry {
    /// Active sessions
    sessions: Mutex<HashMap<ConnectionId, DeviceId>>,
    /// Normalised name of the header carrying the device id
    device_header: String,
}

impl SessionRegistry {
    /// Create a registry reading the device id from `device_header`
    pub fn new(device_header: &str) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            device_header: normalize_header(device_header),
        }
    }

    /// Register a connection and return its device id
    ///
    /// The device id is the designated header when present and non-empty,
    /// otherwise the connection id itself. Re-registering an existing
    /// connection overwrites it (last write wins).
    pub fn on_connect(&self, connection_id: &str, headers: &HashMap<String, String>) -> DeviceId {
        let device_id = self
            .device_id_from(headers)
            .unwrap_or_else(|| connection_id.to_string());

        let previous = self
            .lock()
            .insert(connection_id.to_string(), device_id.clone());

        if let Some(previous) = previous {
            warn!(
                "Connection {} already registered as {}, now {}",
                connection_id, previous, device_id
            );
        }
        debug!("Registered {} as device {}", connection_id, device_id);

        device_id
    }

    /// Remove a connection
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownSession`] if the connection was never
    /// registered (disconnect without a prior connect).
    pub fn on_disconnect(&self, connection_id: &str) -> Result<DeviceSession> {
        self.lock()
            .remove(connection_id)
            .map(|device_id| DeviceSession {
                connection_id: connection_id.to_string(),
                device_id,
            })
            .ok_or_else(|| RelayError::UnknownSession(connection_id.to_string()))
    }

    /// Resolve the device id of a connection
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownSession`] if the connection is not registered.
    pub fn lookup(&self, connection_id: &str) -> Result<DeviceId> {
        self.lock()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownSession(connection_id.to_string()))
    }

    /// Check if a connection is registered
    pub fn contains(&self, connection_id: &str) -> bool {
        self.lock().contains_key(connection_id)
    }

    /// Number of active sessions
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of all active sessions
    pub fn sessions(&self) -> Vec<DeviceSession> {
        self.lock()
            .iter()
            .map(|(connection_id, device_id)| DeviceSession {
                connection_id: connection_id.clone(),
                device_id: device_id.clone(),
            })
            .collect()
    }

    fn device_id_from(&self, headers: &HashMap<String, String>) -> Option<DeviceId> {
        headers
            .iter()
            .find(|(name, _)| normalize_header(name) == self.device_header)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, DeviceId>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_HEADER)
    }
}

// `Device-Id`, `device_id` and `DEVICE_ID` all name the same header.
fn normalize_header(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_connect_reads_device_header() {
        let registry = SessionRegistry::default();
        let device = registry.on_connect("conn-1", &headers(&[("device_id", "iot-1-t1")]));
        assert_eq!(device, "iot-1-t1");
        assert_eq!(registry.lookup("conn-1").unwrap(), "iot-1-t1");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_connect_header_name_is_normalised() {
        let registry = SessionRegistry::default();
        let device = registry.on_connect("conn-1", &headers(&[("Device-Id", "d1")]));
        assert_eq!(device, "d1");
    }

    #[test]
    fn test_connect_falls_back_to_connection_id() {
        let registry = SessionRegistry::default();
        assert_eq!(registry.on_connect("conn-2", &HashMap::new()), "conn-2");
        assert_eq!(
            registry.on_connect("conn-3", &headers(&[("device_id", "  ")])),
            "conn-3"
        );
    }

    #[test]
    fn test_connect_last_write_wins() {
        let registry = SessionRegistry::default();
        registry.on_connect("conn-1", &headers(&[("device_id", "d1")]));
        registry.on_connect("conn-1", &headers(&[("device_id", "d2")]));
        assert_eq!(registry.lookup("conn-1").unwrap(), "d2");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_disconnect_removes_session() {
        let registry = SessionRegistry::default();
        registry.on_connect("conn-1", &headers(&[("device_id", "d1")]));
        let session = registry.on_disconnect("conn-1").unwrap();
        assert_eq!(session.device_id, "d1");
        assert!(registry.is_empty());
        assert!(matches!(
            registry.lookup("conn-1"),
            Err(RelayError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_disconnect_unknown_is_an_error() {
        let registry = SessionRegistry::default();
        assert!(matches!(
            registry.on_disconnect("ghost"),
            Err(RelayError::UnknownSession(id)) if id == "ghost"
        ));
    }

    #[test]
    fn test_custom_device_header() {
        let registry = SessionRegistry::new("X-Sensor");
        let device = registry.on_connect(
            "conn-1",
            &headers(&[("device_id", "ignored"), ("x_sensor", "cam-4")]),
        );
        assert_eq!(device, "cam-4");
    }
}
