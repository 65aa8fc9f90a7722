//! Background-side multiplexer for agent executions.
//!
//! Provides:
//! - `ConnectionRegistry` - authoritative tab/window to execution bindings
//! - `serve_connection` - transport-agnostic frame loop for one connection

pub mod registry;
pub mod serve;

pub use registry::{ConnectionInfo, ConnectionRegistry, Outbound, RouterError};
pub use serve::serve_connection;
