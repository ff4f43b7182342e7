// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! TCP transport
//!
//! Newline-delimited JSON [`Frame`]s over plain TCP. The server half
//! ([`serve`]) turns frames into calls on an [`InboundHandler`]; the client
//! half ([`TcpSession`]) is used by the relay to reach the cloud and by the
//! IoT driver to reach a relay.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::protocol::{Frame, UpstreamMessage};
use crate::transport::{BoxFuture, Upstream, UpstreamConnector};

/// Receiver of inbound connection events
///
/// Handlers are called from the connection's read task and must not block
/// for long.
pub trait InboundHandler: Send + Sync + 'static {
    /// A `connect` frame arrived
    fn on_connect(&self, connection_id: &str, headers: &HashMap<String, String>);

    /// A `recv` frame arrived
    fn on_message(&self, connection_id: &str, payload: &Value);

    /// The connection sent `disconnect` or hung up
    fn on_disconnect(&self, connection_id: &str);
}

/// Accept connections until `shutdown` turns true
///
/// Each connection gets its own task and a fresh id (`conn-1`, `conn-2`, ...).
/// Transient accept failures are logged and skipped; any other accept failure
/// ends the loop with an error.
pub async fn serve<H: InboundHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let next_id = AtomicU64::new(1);

    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let connection_id = format!("conn-{}", next_id.fetch_add(1, Ordering::Relaxed));
                        debug!("Accepted {} from {}", connection_id, addr);
                        let handler = Arc::clone(&handler);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &connection_id, handler, shutdown).await {
                                warn!("Connection {} from {} failed: {}", connection_id, addr, e);
                            }
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                    Err(e) => {
                        error!("Listener failed: {}", e);
                        return Err(TransportError::Io(e));
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Every sender is gone; nobody can ask us to keep running.
                    break;
                }
            }
        }
    }

    info!("Listener shutting down");
    Ok(())
}

async fn handle_connection<H: InboundHandler>(
    stream: TcpStream,
    connection_id: &str,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let mut lines = BufReader::new(stream).lines();
    let mut connected = false;

    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }

        let line = tokio::select! {
            line = lines.next_line() => line,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                continue;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(TransportError::Io(e)),
        };

        if line.trim().is_empty() {
            continue;
        }

        match Frame::from_line(&line) {
            Ok(Frame::Connect { headers }) => {
                connected = true;
                handler.on_connect(connection_id, &headers);
            }
            Ok(Frame::Recv { payload }) => handler.on_message(connection_id, &payload),
            Ok(Frame::Disconnect) => {
                // Forwarded even without a prior connect so the handler can
                // reject it; a hangup after this is not reported again.
                connected = false;
                handler.on_disconnect(connection_id);
                break Ok(());
            }
            Err(e) => {
                warn!("Dropping undecodable frame on {}: {}", connection_id, e);
            }
        }
    };

    if connected {
        handler.on_disconnect(connection_id);
    }
    result
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Client side of a connection: one logical session
#[derive(Debug)]
pub struct TcpSession {
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    peer: SocketAddr,
}

impl TcpSession {
    /// Connect to `addr` and open a session announcing `device_id` under `header`
    pub async fn connect(addr: &str, header: &str, device_id: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        // The peer never writes back; only the write half is kept.
        let (_read, write) = stream.into_split();

        let session = Self {
            writer: Mutex::new(Some(BufWriter::new(write))),
            peer,
        };
        session.send(&Frame::connect(header, device_id)).await?;
        Ok(session)
    }

    /// Address of the remote end
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one `recv` frame carrying `payload`
    pub async fn send_payload(&self, payload: Value) -> Result<(), TransportError> {
        self.send(&Frame::Recv { payload }).await
    }

    /// Send one frame and flush it
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let line = frame.to_line()?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send `disconnect` and shut the socket down. Idempotent.
    pub async fn disconnect(&self) {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        let goodbye = Frame::Disconnect.to_line().unwrap_or_default();
        if let Err(e) = writer.write_all(goodbye.as_bytes()).await {
            debug!("Could not send disconnect to {}: {}", self.peer, e);
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Could not shut down session with {}: {}", self.peer, e);
        }
    }
}

impl Upstream for TcpSession {
    fn emit<'a>(
        &'a self,
        message: &'a UpstreamMessage,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.send_payload(message.to_payload()))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.disconnect())
    }
}

/// Opens a [`TcpSession`] to the cloud aggregator
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    header: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            header: header.into(),
        }
    }
}

impl UpstreamConnector for TcpConnector {
    fn connect<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Upstream>, TransportError>> {
        Box::pin(async move {
            let session = TcpSession::connect(&self.addr, &self.header, node_id).await?;
            let upstream: Arc<dyn Upstream> = Arc::new(session);
            Ok(upstream)
        })
    }

    fn address(&self) -> String {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl InboundHandler for Recorder {
        fn on_connect(&self, connection_id: &str, headers: &HashMap<String, String>) {
            let device = headers.get("device_id").cloned().unwrap_or_default();
            self.events
                .lock()
                .unwrap()
                .push(format!("connect {} {}", connection_id, device));
        }

        fn on_message(&self, connection_id: &str, payload: &Value) {
            self.events
                .lock()
                .unwrap()
                .push(format!("recv {} {}", connection_id, payload));
        }

        fn on_disconnect(&self, connection_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnect {}", connection_id));
        }
    }

    async fn wait_for_events(recorder: &Recorder, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let events = recorder.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        recorder.events()
    }

    #[tokio::test]
    async fn test_session_frames_reach_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::clone(&recorder), shutdown_rx));

        let session = TcpSession::connect(&addr, "device_id", "iot-1").await.unwrap();
        session.send_payload(json!({"data": ["a.jpg"]})).await.unwrap();
        session.disconnect().await;
        session.disconnect().await;

        let events = wait_for_events(&recorder, 3).await;
        assert_eq!(
            events,
            vec![
                "connect conn-1 iot-1".to_string(),
                r#"recv conn-1 {"data":["a.jpg"]}"#.to_string(),
                "disconnect conn-1".to_string(),
            ]
        );

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hangup_counts_as_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::clone(&recorder), shutdown_rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"event\":\"connect\",\"headers\":{}}\nnot json\n")
            .await
            .unwrap();
        drop(stream);

        let events = wait_for_events(&recorder, 2).await;
        assert_eq!(events, vec!["connect conn-1 ", "disconnect conn-1"]);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_reaches_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::clone(&recorder), shutdown_rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"{\"event\":\"disconnect\"}\n").await.unwrap();
        drop(stream);

        let events = wait_for_events(&recorder, 1).await;
        // Give a stray second callback time to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events, vec!["disconnect conn-1"]);
        assert_eq!(recorder.events(), vec!["disconnect conn-1"]);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let session = TcpSession::connect(&addr, "device_id", "edge-1").await.unwrap();
        session.disconnect().await;
        assert!(matches!(
            session.send_payload(json!({})).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connector_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let connector = TcpConnector::new(addr.clone(), "device_id");
        assert_eq!(connector.address(), addr);
        assert!(connector.connect("edge-1").await.is_err());
    }
}
