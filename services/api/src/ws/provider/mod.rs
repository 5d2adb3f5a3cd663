//! Transport seam between the relay and the upstream realtime service.
//!
//! `UpstreamSession` speaks to the upstream only through these traits, so the
//! session logic runs the same over a real WebSocket or a scripted transport.

pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// A frame read from the upstream socket.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid upstream request: {0}")]
    Request(String),
    #[error("no keepalive response from upstream within {0:?}")]
    KeepaliveTimeout(Duration),
    #[error("upstream connection closed")]
    Closed,
}

/// One established upstream connection.
#[async_trait]
pub trait UpstreamTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next data frame. `Ok(None)` means the peer closed the connection.
    async fn next_frame(&mut self) -> Result<Option<UpstreamFrame>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens new upstream connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>, TransportError>;
}
