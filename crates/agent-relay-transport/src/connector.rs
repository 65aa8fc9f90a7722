//! Opening client connections.

use std::{sync::Arc, time::Duration};

use agent_relay_core::{ClientMessage, Frame, ProtocolError, ServerMessage};
use agent_relay_router::{ConnectionRegistry, RouterError, serve_connection};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    Closed,
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}

/// Both directions of an open client connection.
///
/// Dropping `outbound` closes the connection.
pub struct ClientLink {
    pub outbound: mpsc::UnboundedSender<Frame<ClientMessage>>,
    pub inbound: mpsc::UnboundedReceiver<Frame<ServerMessage>>,
}

/// Opens connections to the router.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection. The handshake is the caller's first frame.
    async fn connect(&self) -> Result<ClientLink, TransportError>;
}

/// Connector to a router in the same process.
#[derive(Clone)]
pub struct LocalConnector {
    registry: Arc<ConnectionRegistry>,
}

impl LocalConnector {
    /// Create a connector for `registry`.
    #[must_use]
    pub const fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<ClientLink, TransportError> {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let inbound = UnboundedReceiverStream::new(client_rx).map(Ok);
            if let Err(e) = serve_connection(registry, inbound, server_tx).await {
                tracing::warn!("Local connection ended: {e}");
            }
        });

        Ok(ClientLink {
            outbound: client_tx,
            inbound: server_rx,
        })
    }
}
