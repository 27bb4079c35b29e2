//! WebSocket transport for the broadcast hub.
//!
//! # Message Protocol
//!
//! **Server → Client:**
//! ```json
//! {"type": "connected", "data": {"connectionId": 1, "timestamp": "..."}}
//! {"type": "event", "data": { ...domain event... }}
//! {"type": "log", "data": { ...log line... }}
//! {"type": "ping", "data": "2025-01-01T00:00:00Z"}
//! ```
//!
//! **Client → Server:** any frame counts as an acknowledgment and keeps the
//! connection alive. A close frame ends it.

use crate::hub::{Connection, ConnectionFuture, Frame, HubError, Inbound};
use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outbound half of an axum websocket.
pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsConnection {
    /// Wrap the sending half of a split socket.
    #[must_use]
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl Connection for WsConnection {
    fn send(&self, frame: Frame) -> ConnectionFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.sink
                .lock()
                .await
                .send(Message::Text(frame.to_string()))
                .await
                .map_err(|e| HubError::Write(e.to_string()))
        })
    }

    fn close(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(error = %e, "Close frame not delivered");
            }
            let _ = sink.close().await;
        })
    }
}

/// `GET /ws`: upgrade and hand the socket to the hub.
#[allow(clippy::unused_async)] // Axum handler signature requires async
pub async fn handle(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    debug!("WebSocket connection requested");
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let conn: Arc<dyn Connection> = Arc::new(WsConnection::new(sink));
        let inbound = stream.map(|message| match message {
            Ok(Message::Close(_)) => Ok(Inbound::Close),
            Ok(_) => Ok(Inbound::Message),
            Err(e) => Err(HubError::Read(e.to_string())),
        });

        match state.hub.serve(conn, inbound).await {
            Ok(id) => info!(connection_id = %id, "WebSocket observer attached"),
            Err(e) => warn!(error = %e, "WebSocket observer rejected"),
        }
    })
}
