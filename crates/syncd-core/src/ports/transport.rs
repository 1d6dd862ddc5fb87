//! Framed transport port.
//!
//! The socket layer (WebSocket handshake, TLS, TCP accept) is external;
//! the core sees only framed binary messages. One [`Transport`] instance
//! backs one connection and is owned by its connection task.

use async_trait::async_trait;
use thiserror::Error;

/// Transport failure, mapped once at the connection boundary. None of
/// these produce an ERROR frame; the connection is simply destroyed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream (end of input, reset, broken pipe).
    #[error("peer closed the connection")]
    Closed,
    #[error("websocket protocol error: {0}")]
    Websocket(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// One framed, bidirectional byte-message stream.
#[async_trait]
pub trait Transport: Send {
    /// Receive the next frame; `Ok(None)` on clean end of stream.
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Send one frame.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close the stream; best-effort, idempotent.
    async fn close(&mut self);
}
