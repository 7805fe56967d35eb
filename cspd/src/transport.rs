//! Frame-level transport seam between the connection manager and sockets.
//!
//! A connection is split into a shared [`FrameSink`] (stored in the registry
//! so other connections' handlers can write to it) and an exclusively owned
//! [`FrameSource`] read only by the connection's own receive loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;

/// Normal closure sent while the server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Deployment invalid, peer not ready, registration conflict, malformed stream.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Unexpected server-side failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close reasons must fit in a control frame (125 bytes minus the code).
const MAX_CLOSE_REASON_BYTES: usize = 123;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the socket or the stream ended.
    #[error("connection closed (code: {code:?}, reason: {reason:?})")]
    Disconnected {
        code: Option<u16>,
        reason: Option<String>,
    },

    /// A text frame arrived on a binary-only endpoint.
    #[error("expected a binary frame, got text")]
    UnexpectedText,

    /// Writing to a socket this side already closed.
    #[error("socket already closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one binary frame.
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Send a close frame. Closing an already-closed socket is a no-op.
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next binary frame. Control frames are skipped.
    async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Process-unique identifier of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An accepted socket, ready to be attached.
pub struct Connection {
    pub id: ConnectionId,
    pub sink: Arc<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Connection {
    pub fn new(sink: Arc<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self {
            id: ConnectionId::next(),
            sink,
            source,
        }
    }

    /// Wrap an upgraded axum WebSocket.
    pub fn from_websocket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let closed = Arc::new(AtomicBool::new(false));
        Self::new(
            Arc::new(WsSink {
                inner: Mutex::new(sink),
                closed: Arc::clone(&closed),
            }),
            Box::new(WsSource {
                inner: stream,
                closed,
            }),
        )
    }
}

/// Close a socket unless it is already closed, logging (not returning) failures.
pub async fn close_quietly(sink: &dyn FrameSink, code: u16, reason: &str) {
    if sink.is_closed() {
        return;
    }
    if let Err(e) = sink.close(code, reason).await {
        tracing::debug!("Failed to close socket with code {}: {}", code, e);
    }
}

pub(crate) fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

struct WsSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.inner
            .lock()
            .await
            .send(Message::Binary(bytes::Bytes::from(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = CloseFrame {
            code,
            reason: truncate_reason(reason).into(),
        };
        self.inner
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct WsSource {
    inner: SplitStream<WebSocket>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Text(_))) => return Err(TransportError::UnexpectedText),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Disconnected {
                        code: frame.as_ref().map(|f| f.code),
                        reason: frame.map(|f| f.reason.as_str().to_owned()),
                    });
                }
                // Abrupt resets surface as stream errors; treat them as a disconnect.
                Some(Err(e)) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Disconnected {
                        code: None,
                        reason: Some(e.to_string()),
                    });
                }
                None => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Disconnected {
                        code: None,
                        reason: None,
                    });
                }
            }
        }
    }
}
