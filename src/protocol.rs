// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Message types and wire format
//!
//! Every connection carries newline-delimited JSON [`Frame`]s:
//!
//! ```text
//! {"event":"connect","headers":{"device_id":"iot-1"}}
//! {"event":"recv","payload":{"data":["a.jpg","b.jpg"]}}
//! {"event":"recv","payload":{"acc_transtime":0.42}}
//! {"event":"disconnect"}
//! ```
//!
//! Inbound payloads are decoded into an [`InboundMessage`] as soon as they
//! arrive; outbound payloads are produced from an [`UpstreamMessage`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RelayError, Result};
use crate::ledger::LedgerSnapshot;

/// Transport-assigned identifier of one inbound connection
pub type ConnectionId = String;

/// Logical identifier of an IoT device
pub type DeviceId = String;

/// Opaque reference to one unit of work (an image path, a text record, ...)
pub type WorkItem = Value;

/// One event on a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Frame {
    /// Opens the logical session
    Connect {
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Generic message event
    Recv { payload: Value },
    /// Closes the logical session
    Disconnect,
}

impl Frame {
    /// Build a connect frame announcing `device_id` under `header`
    pub fn connect(header: &str, device_id: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert(header.to_string(), device_id.to_string());
        Frame::Connect { headers }
    }

    /// Encode as a single JSON line, newline included
    pub fn to_line(&self) -> std::result::Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one JSON line
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

/// Batch of work items received from one device
#[derive(Debug, Clone, PartialEq)]
pub struct WorkBatch {
    /// Originating device
    pub device_id: DeviceId,
    /// Ordered item references
    pub items: Vec<WorkItem>,
}

impl WorkBatch {
    pub fn new(device_id: impl Into<DeviceId>, items: Vec<WorkItem>) -> Self {
        Self {
            device_id: device_id.into(),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Results of processing a [`WorkBatch`], same cardinality and order
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedBatch {
    pub items: Vec<Value>,
}

/// Decoded inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// `{"data": [...]}` - work to enqueue
    DataBatch(Vec<WorkItem>),
    /// `{"acc_transtime": f}` - transmission time measured by the device, seconds
    TransmissionReport(f64),
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(default)]
    data: Option<Vec<WorkItem>>,
    #[serde(default, alias = "accTransmissionTime")]
    acc_transtime: Option<f64>,
}

impl InboundMessage {
    /// Decode a payload. A non-null transmission report wins over data.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let raw = RawInbound::deserialize(payload)
            .map_err(|e| RelayError::MalformedPayload(e.to_string()))?;

        if let Some(seconds) = raw.acc_transtime {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(RelayError::MalformedPayload(format!(
                    "transmission time must be a non-negative number, got {}",
                    seconds
                )));
            }
            return Ok(InboundMessage::TransmissionReport(seconds));
        }

        match raw.data {
            Some(items) => Ok(InboundMessage::DataBatch(items)),
            None => Err(RelayError::MalformedPayload(
                "payload carries neither data nor acc_transtime".to_string(),
            )),
        }
    }

    /// Encode as a payload (device side)
    pub fn to_payload(&self) -> Value {
        match self {
            InboundMessage::DataBatch(items) => json!({ "data": items }),
            InboundMessage::TransmissionReport(seconds) => json!({ "acc_transtime": seconds }),
        }
    }
}

/// Message sent from the relay to the cloud aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// `{"data": [...]}`
    Results(ProcessedBatch),
    /// `{"transmissionTimeTotal": f, "processingTimeTotal": f, "data": null}`
    Stats(LedgerSnapshot),
}

impl UpstreamMessage {
    /// Encode as a payload
    pub fn to_payload(&self) -> Value {
        match self {
            UpstreamMessage::Results(batch) => json!({ "data": batch.items }),
            UpstreamMessage::Stats(snapshot) => json!({
                "transmissionTimeTotal": snapshot.transmission,
                "processingTimeTotal": snapshot.processing,
                "data": Value::Null,
            }),
        }
    }

    /// Decode a payload (cloud side)
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload.get("data") {
            Some(Value::Array(items)) => Ok(UpstreamMessage::Results(ProcessedBatch {
                items: items.clone(),
            })),
            Some(Value::Null) | None => {
                let field = |name: &str| {
                    payload.get(name).and_then(Value::as_f64).ok_or_else(|| {
                        RelayError::MalformedPayload(format!("missing or non-numeric {}", name))
                    })
                };
                Ok(UpstreamMessage::Stats(LedgerSnapshot {
                    transmission: field("transmissionTimeTotal")?,
                    processing: field("processingTimeTotal")?,
                }))
            }
            Some(other) => Err(RelayError::MalformedPayload(format!(
                "data must be an array or null, got {}",
                other
            ))),
        }
    }
}
