//! One-shot request/response over a short-lived connection.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use agent_relay_core::{ClientMessage, Frame, Handshake, RelayConfig, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::connector::{Connector, TransportError};

type Pending = HashMap<String, oneshot::Sender<ServerMessage>>;

/// One ephemeral connection. Teardown happens at most once, whichever of the
/// response or the timeout gets there first.
struct Ephemeral {
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame<ClientMessage>>>>,
    pending: Mutex<Pending>,
}

impl Ephemeral {
    fn new(outbound: mpsc::UnboundedSender<Frame<ClientMessage>>) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, frame: Frame<ClientMessage>) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        outbound
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    /// Close the connection. Returns `false` if it was already closed.
    fn teardown(&self) -> bool {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        outbound.is_some()
    }

    fn resolve(&self, frame: Frame<ServerMessage>) {
        let waiter = frame.id.as_ref().and_then(|id| self.pending().remove(id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(frame.message);
                self.teardown();
            }
            None => {
                tracing::debug!(id = ?frame.id, "Ignoring unsolicited frame");
            }
        }
    }
}

/// Sends single requests, each over its own connection, with a fixed timeout.
pub struct RequestClient {
    connector: Arc<dyn Connector>,
    handshake: Handshake,
    timeout: Duration,
}

impl RequestClient {
    /// Create a client that opens connections with `handshake`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, handshake: Handshake) -> Self {
        Self {
            connector,
            handshake,
            timeout: RelayConfig::default().request_timeout(),
        }
    }

    /// Override the response timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Response timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `message` with a fresh correlation id and wait for the reply.
    ///
    /// A reply arriving after the timeout is dropped.
    ///
    /// # Errors
    /// Returns [`TransportError::Timeout`] if no reply arrives in time,
    /// [`TransportError::Remote`] if the router answers with an error.
    pub async fn request(&self, message: ClientMessage) -> Result<ServerMessage, TransportError> {
        let link = self.connector.connect().await?;
        let ephemeral = Arc::new(Ephemeral::new(link.outbound));

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        ephemeral.pending().insert(id.clone(), tx);

        let reader = {
            let ephemeral = Arc::clone(&ephemeral);
            let mut inbound = link.inbound;
            tokio::spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    ephemeral.resolve(frame);
                }
            })
        };

        let sent = ephemeral
            .send(Frame::new(ClientMessage::Handshake(self.handshake.clone())))
            .and_then(|()| ephemeral.send(Frame::request(message, id.clone())));
        if let Err(e) = sent {
            ephemeral.teardown();
            reader.abort();
            return Err(e);
        }

        let result = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(ServerMessage::Error { message })) => Err(TransportError::Remote(message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                ephemeral.pending().remove(&id);
                tracing::warn!(request = %id, timeout = ?self.timeout, "Request timed out");
                Err(TransportError::Timeout(self.timeout))
            }
        };
        if ephemeral.teardown() {
            tracing::debug!(request = %id, "Ephemeral connection closed");
        }
        result
    }
}
