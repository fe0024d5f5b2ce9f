//! Duplex channel transports.
//!
//! [`Transport::connect`] opens one [`Channel`]: a stream of inbound text
//! frames plus an unbounded sender for outbound frames. The connection
//! manager drives it without knowing whether the other end is a WebSocket
//! or an in-process peer.
//!
//! - [`WebSocketTransport`] talks to the backend over `tokio-tungstenite`.
//! - [`memory_transport`] hands out in-process channels whose far ends are
//!   delivered to a [`MemoryServer`], for tests and local wiring.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// One open duplex channel.
pub struct Channel {
    /// Inbound text frames; ends when the peer closes.
    pub inbound: BoxStream<'static, Result<String, ConnectionError>>,
    /// Outbound text frames; dropping every sender closes the write side.
    pub outbound: mpsc::UnboundedSender<String>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

/// Something that can open a [`Channel`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Channel, ConnectionError>;

    /// Endpoint description for logs.
    fn endpoint(&self) -> &str;
}

/// Errors that can occur on the event channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// Failed to establish the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// WebSocket transport for the audit backend's notification endpoint.
pub struct WebSocketTransport {
    ws_url: String,
}

impl WebSocketTransport {
    /// * `ws_url` - endpoint, e.g. `ws://host:3000/ws`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    /// Connect to the WebSocket endpoint.
    ///
    /// A fresh `clientId` (UUID v4) is appended as a query parameter so
    /// the backend can address this client. Outbound frames are written by
    /// a dedicated task that exits once every outbound sender is dropped.
    async fn connect(&self) -> Result<Channel, ConnectionError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{separator}clientId={client_id}", self.ws_url);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ConnectionError::Connection(format!("Failed to connect to {}: {e}", self.ws_url))
        })?;

        tracing::info!(client_id = %client_id, "Connected to {}", self.ws_url);

        let (mut sink, stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = futures::stream::unfold(stream, |mut stream| async move {
            loop {
                match stream.next().await? {
                    Ok(Message::Text(text)) => return Some((Ok(text), stream)),
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "WebSocket closed by peer");
                        return None;
                    }
                    // Pings are answered by tungstenite; binary frames are
                    // not part of the protocol.
                    Ok(_) => continue,
                    Err(e) => {
                        return Some((Err(ConnectionError::Protocol(e.to_string())), stream));
                    }
                }
            }
        })
        .boxed();

        Ok(Channel { inbound, outbound })
    }

    fn endpoint(&self) -> &str {
        &self.ws_url
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Server-side end of one in-memory channel.
pub struct MemoryPeer {
    /// Push inbound frames to the client; drop to close the channel.
    pub to_client: mpsc::UnboundedSender<String>,
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// Connection-attempt bookkeeping shared by both halves.
#[derive(Default)]
struct MemoryControl {
    refusals: AtomicU32,
    attempts: AtomicU32,
}

/// In-process transport. Each successful connect delivers a
/// [`MemoryPeer`] to the paired [`MemoryServer`].
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    control: Arc<MemoryControl>,
}

/// Control side of a [`MemoryTransport`].
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    control: Arc<MemoryControl>,
}

/// Create a connected transport/server pair.
pub fn memory_transport() -> (MemoryTransport, MemoryServer) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let control = Arc::new(MemoryControl::default());
    (
        MemoryTransport {
            peers: peers_tx,
            control: Arc::clone(&control),
        },
        MemoryServer {
            peers: peers_rx,
            control,
        },
    )
}

impl MemoryServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.control.refusals.store(count, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until
    /// [`refuse_next`](Self::refuse_next) lowers the count again.
    pub fn refuse_all(&self) {
        self.refuse_next(u32::MAX);
    }

    /// Number of connection attempts seen so far, refused or not.
    pub fn connect_attempts(&self) -> u32 {
        self.control.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Channel, ConnectionError> {
        self.control.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .control
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if refused {
            return Err(ConnectionError::Connection("connection refused".into()));
        }

        let (to_client, mut inbound_rx) = mpsc::unbounded_channel::<String>();
        let (outbound, from_client) = mpsc::unbounded_channel::<String>();

        self.peers
            .send(MemoryPeer {
                to_client,
                from_client,
            })
            .map_err(|_| ConnectionError::Connection("memory server dropped".into()))?;

        let inbound = futures::stream::poll_fn(move |cx| inbound_rx.poll_recv(cx))
            .map(Ok::<_, ConnectionError>)
            .boxed();

        Ok(Channel { inbound, outbound })
    }

    fn endpoint(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn memory_channel_carries_frames_both_ways() {
        let (transport, mut server) = memory_transport();
        let mut channel = transport.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        peer.to_client.send("hello".into()).unwrap();
        assert_eq!(channel.inbound.next().await.unwrap().unwrap(), "hello");

        channel.outbound.send("hi back".into()).unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), "hi back");
    }

    #[tokio::test]
    async fn dropping_peer_ends_inbound_stream() {
        let (transport, mut server) = memory_transport();
        let mut channel = transport.connect().await.unwrap();
        drop(server.accept().await.unwrap());
        assert!(channel.inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn refusals_are_counted_down() {
        let (transport, mut server) = memory_transport();
        server.refuse_next(2);

        assert_matches!(transport.connect().await, Err(ConnectionError::Connection(_)));
        assert_matches!(transport.connect().await, Err(ConnectionError::Connection(_)));
        assert!(transport.connect().await.is_ok());
        assert!(server.accept().await.is_some());
        assert_eq!(server.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn channel_debug_reports_writer_state() {
        let (transport, mut server) = memory_transport();
        let channel = transport.connect().await.unwrap();
        assert_eq!(
            format!("{channel:?}"),
            "Channel { outbound_closed: false, .. }"
        );

        let mut peer = server.accept().await.unwrap();
        peer.from_client.close();
        assert_eq!(
            format!("{channel:?}"),
            "Channel { outbound_closed: true, .. }"
        );
    }

    #[tokio::test]
    async fn websocket_connect_to_closed_port_fails() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws");
        assert_matches!(transport.connect().await, Err(ConnectionError::Connection(_)));
    }
}
