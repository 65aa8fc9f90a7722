//! Client side and transports for agent session routing.
//!
//! Provides:
//! - `Connector` / `LocalConnector` - how a client opens a connection
//! - `ConnectionLifecycle` - one bound connection per window surface
//! - `RequestClient` - ephemeral request/response with timeout
//! - WebSocket transport (feature: websocket)

pub mod connector;
pub mod lifecycle;
pub mod request;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connector::{ClientLink, Connector, LocalConnector, TransportError};
pub use lifecycle::{ConnectionLifecycle, Consumer, LifecycleState};
pub use request::RequestClient;
