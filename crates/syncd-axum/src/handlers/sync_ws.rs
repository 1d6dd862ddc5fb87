//! The sync WebSocket endpoint.
//!
//! `GET /sync` upgrades to a WebSocket whose binary frames are the sync
//! protocol messages. The socket is wrapped into the core's `Transport`
//! port and handed to the server root, which owns it for the connection's
//! lifetime.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::debug;

use syncd_core::ports::transport::{Transport, TransportError};

use crate::state::AppState;

/// `GET /sync` - WebSocket upgrade for the sync protocol.
pub async fn sync_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let conn_id = state
            .server
            .handle_connection(Box::new(WsTransport { socket }));
        debug!(conn_id, "sync websocket adopted");
    })
}

/// Adapts one axum WebSocket to the framed transport port.
struct WsTransport {
    socket: WebSocket,
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                // The protocol is binary-only; a text frame is a peer bug.
                Some(Ok(Message::Text(_))) => {
                    return Err(TransportError::Websocket(
                        "unexpected text frame".to_owned(),
                    ));
                }
                // Ping/pong is handled by the websocket layer itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(TransportError::Websocket(err.to_string())),
            }
        }
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.socket
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}
