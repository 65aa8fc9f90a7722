//! WebSocket transport for browser surfaces.

use std::sync::Arc;

use agent_relay_core::{ClientMessage, Frame, ProtocolError, ServerMessage};
use agent_relay_router::{ConnectionRegistry, serve_connection};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, future};
use tokio::sync::mpsc;

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<ConnectionRegistry>,
}

impl WsState {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Decode one WebSocket message. `None` skips control frames.
fn decode_message(msg: Message) -> Option<Result<Frame<ClientMessage>, ProtocolError>> {
    match msg {
        Message::Text(text) => Some(Frame::decode(text.as_str())),
        Message::Binary(data) => Some(
            std::str::from_utf8(&data)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))
                .and_then(Frame::decode),
        ),
        _ => None,
    }
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame<ServerMessage>>();

    // Forward frames to the socket until the registry drops the sender
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match frame.encode() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let inbound = receiver
        .take_while(|msg| {
            let open = match msg {
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    tracing::error!("WebSocket error: {e}");
                    false
                }
            };
            future::ready(open)
        })
        .filter_map(|msg| future::ready(msg.ok().and_then(decode_message)))
        .boxed();

    tokio::select! {
        result = serve_connection(state.registry, inbound, tx) => {
            if let Err(e) = result {
                tracing::warn!("WebSocket connection rejected: {e}");
            }
        }
        _ = &mut send_task => {
            tracing::debug!("WebSocket writer closed");
        }
    }

    send_task.abort();
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(registry));
/// ```
#[must_use]
pub fn create_ws_router(registry: Arc<ConnectionRegistry>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(registry))
}
