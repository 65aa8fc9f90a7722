//! Transport-agnostic frame loop for one connection.

use std::sync::Arc;

use agent_relay_core::{ClientMessage, ConnectionId, Frame, ProtocolError, ServerMessage};
use futures::{Stream, StreamExt};

use crate::registry::{ConnectionRegistry, Outbound, RouterError};

/// Unregisters the connection when the loop ends, however it ends.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister_connection(self.id);
    }
}

/// Drive one connection: the first frame must be a handshake, every later
/// frame is handed to the registry. Malformed frames are answered with an
/// error and skipped.
///
/// Returns when the inbound stream ends or the registry disconnects the
/// connection.
///
/// # Errors
/// Returns error if the first frame is not a valid handshake.
pub async fn serve_connection<S>(
    registry: Arc<ConnectionRegistry>,
    mut inbound: S,
    outbound: Outbound,
) -> Result<(), RouterError>
where
    S: Stream<Item = Result<Frame<ClientMessage>, ProtocolError>> + Unpin,
{
    let handshake = match inbound.next().await {
        Some(Ok(Frame {
            message: ClientMessage::Handshake(handshake),
            ..
        })) => handshake,
        Some(Ok(frame)) => {
            let _ = outbound.send(frame.reply(ServerMessage::error("handshake required")));
            return Err(RouterError::HandshakeRequired);
        }
        Some(Err(e)) => {
            let _ = outbound.send(Frame::new(ServerMessage::error(e.to_string())));
            return Err(e.into());
        }
        None => return Ok(()),
    };

    let id = registry.register_connection(handshake, outbound).await?;
    let registration = Registration {
        registry: Arc::clone(&registry),
        id,
    };
    let Some(mut removed) = registry.watch_removal(id) else {
        return Ok(());
    };

    loop {
        let next = tokio::select! {
            next = inbound.next() => next,
            _ = removed.changed() => {
                tracing::debug!(connection = %id, "Connection was closed by the registry");
                break;
            }
        };
        match next {
            Some(Ok(frame)) => {
                if let Err(e) = registry.handle_client_frame(id, frame).await {
                    tracing::warn!(connection = %id, "Rejected client frame: {e}");
                }
            }
            Some(Err(e)) => {
                tracing::warn!(connection = %id, "Quarantined malformed frame: {e}");
                let _ = registry.post(id, Frame::new(ServerMessage::error(e.to_string())));
            }
            None => break,
        }
    }

    drop(registration);
    Ok(())
}
