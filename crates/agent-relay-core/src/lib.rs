//! Core building blocks for routing agent executions to UI surfaces.
//!
//! This crate provides:
//! - `ChannelRegistry` / `EventChannel` - per-execution publish/subscribe
//! - Execution event and message types
//! - The wire protocol (`Frame`, `ClientMessage`, `ServerMessage`)
//! - The `TabHost` capability and an in-memory implementation
//! - `RelayConfig`

pub mod channel;
pub mod config;
pub mod event;
pub mod host;
pub mod protocol;
pub mod traits;

pub use channel::{ChannelRegistry, DeliveryError, EventChannel, Subscription};
pub use config::RelayConfig;
pub use event::{
    ChannelEvent, ExecutionId, Feedback, FeedbackRating, Message, MessageRole, StreamEvent,
    WorkflowStatus,
};
pub use host::MemoryTabHost;
pub use protocol::{ClientMessage, ConnectionKind, Frame, Handshake, ProtocolError, ServerMessage};
pub use traits::{ConnectionId, HostError, TabHost, TabId, WindowId};
