// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Transport abstraction
//!
//! The relay owns exactly one outbound session to the cloud. It sees that
//! session only through [`Upstream`], opened by an [`UpstreamConnector`], so
//! the relay core can run over TCP ([`crate::tcp`]) or, in tests, over the
//! in-memory [`MemoryUpstream`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::TransportError;
use crate::protocol::UpstreamMessage;

/// Boxed, sendable future used at the transport seams
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound session to the cloud aggregator
pub trait Upstream: Send + Sync {
    /// Send one message
    fn emit<'a>(&'a self, message: &'a UpstreamMessage)
        -> BoxFuture<'a, Result<(), TransportError>>;

    /// Close the session. Closing twice is a no-op.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Opens the outbound session
pub trait UpstreamConnector: Send + Sync {
    /// Connect, announcing `node_id` as this relay's device id
    fn connect<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Upstream>, TransportError>>;

    /// Human readable target address, for logs and errors
    fn address(&self) -> String;
}

/// In-memory upstream that records every emitted message
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    messages: Mutex<Vec<UpstreamMessage>>,
    closed: AtomicBool,
    fail_emits: AtomicBool,
    close_count: AtomicUsize,
    latency: Duration,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// An upstream whose every emit takes at least `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Copy of all messages emitted so far, in emit order
    pub fn messages(&self) -> Vec<UpstreamMessage> {
        self.lock().clone()
    }

    /// Number of messages emitted so far
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` was called
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Make every following emit fail (simulates a broken link)
    pub fn set_failing(&self, failing: bool) {
        self.fail_emits.store(failing, Ordering::SeqCst);
    }

    /// Wait until at least `count` messages were emitted
    ///
    /// Returns `false` if `limit` elapses first.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        let poll = async {
            while self.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(limit, poll).await.is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UpstreamMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Upstream for MemoryUpstream {
    fn emit<'a>(
        &'a self,
        message: &'a UpstreamMessage,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            if self.fail_emits.load(Ordering::SeqCst) {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "simulated link failure",
                )));
            }
            self.lock().push(message.clone());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.close_count.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Connector handing out a shared [`MemoryUpstream`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    upstream: Arc<MemoryUpstream>,
    reachable: bool,
    connect_delay: Duration,
    connected_as: Arc<Mutex<Option<String>>>,
}

impl MemoryConnector {
    pub fn new(upstream: Arc<MemoryUpstream>) -> Self {
        Self {
            upstream,
            reachable: true,
            connect_delay: Duration::ZERO,
            connected_as: Arc::new(Mutex::new(None)),
        }
    }

    /// A connector whose every connect takes `delay` before succeeding
    pub fn with_connect_delay(upstream: Arc<MemoryUpstream>, delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..Self::new(upstream)
        }
    }

    /// A connector whose target refuses connections
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new(Arc::new(MemoryUpstream::new()))
        }
    }

    /// Node id announced by the last successful connect
    pub fn connected_as(&self) -> Option<String> {
        self.connected_as
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl UpstreamConnector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Upstream>, TransportError>> {
        Box::pin(async move {
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            if !self.reachable {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "memory upstream unreachable",
                )));
            }
            *self
                .connected_as
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(node_id.to_string());
            let upstream: Arc<dyn Upstream> = self.upstream.clone();
            Ok(upstream)
        })
    }

    fn address(&self) -> String {
        "memory".to_string()
    }
}
