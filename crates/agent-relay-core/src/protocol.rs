//! Wire protocol between connections and the router.
//!
//! Every frame is a JSON object `{ "type": ..., "payload": ..., "id"?: ... }`.
//! Request-style frames carry an `id` which the reply echoes.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::event::{ExecutionId, StreamEvent, WorkflowStatus};
use crate::traits::{TabId, WindowId};

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Role a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// The single visible panel of a window; follows the window's active tab.
    Surface,
    /// Pinned to one tab for its whole life.
    Tab,
    /// Neither tab nor window scoped; binds only on explicit request.
    Observer,
}

impl ConnectionKind {
    /// Whether the connection follows its window's active tab.
    #[must_use]
    pub const fn is_window_scoped(self) -> bool {
        matches!(self, Self::Surface)
    }
}

/// First frame of every connection: who is connecting and what it wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub kind: ConnectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

impl Handshake {
    /// Handshake for a window surface.
    #[must_use]
    pub const fn surface(window_id: WindowId, tab_id: Option<TabId>) -> Self {
        Self {
            kind: ConnectionKind::Surface,
            name: None,
            tab_id,
            window_id: Some(window_id),
            execution_id: None,
        }
    }

    /// Handshake for a connection pinned to a tab.
    #[must_use]
    pub const fn tab(tab_id: TabId) -> Self {
        Self {
            kind: ConnectionKind::Tab,
            name: None,
            tab_id: Some(tab_id),
            window_id: None,
            execution_id: None,
        }
    }

    /// Set the connection name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Ask to be bound to a specific execution.
    #[must_use]
    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

/// Message from client to router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Must be the first frame on a connection.
    Handshake(Handshake),
    /// Ask the router to re-resolve and resend the binding.
    #[serde(rename_all = "camelCase")]
    SyncRequest {
        connection_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
    },
    /// Keepalive.
    Ping,
}

/// Message from router to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Authoritative binding notice. `None` means nothing is running.
    #[serde(rename_all = "camelCase")]
    ExecutionContext {
        execution_id: Option<ExecutionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
    },
    /// Event forwarded from the bound execution's channel.
    #[serde(rename_all = "camelCase")]
    AgentStreamUpdate {
        execution_id: ExecutionId,
        event: StreamEvent,
    },
    /// Execution lifecycle signal.
    #[serde(rename_all = "camelCase")]
    WorkflowStatus {
        execution_id: ExecutionId,
        status: WorkflowStatus,
    },
    /// A provisional execution id was replaced by a durable one.
    ExecutionMigrated { from: ExecutionId, to: ExecutionId },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Build an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Build a binding notice.
    #[must_use]
    pub const fn context(execution_id: Option<ExecutionId>, tab_id: Option<TabId>) -> Self {
        Self::ExecutionContext {
            execution_id,
            tab_id,
        }
    }
}

/// A message plus its optional correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<M> {
    pub id: Option<String>,
    pub message: M,
}

impl<M> Frame<M> {
    /// Frame without correlation id.
    #[must_use]
    pub const fn new(message: M) -> Self {
        Self { id: None, message }
    }

    /// Frame carrying a correlation id.
    #[must_use]
    pub fn request(message: M, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            message,
        }
    }

    /// Build a reply that echoes this frame's id.
    #[must_use]
    pub fn reply<N>(&self, message: N) -> Frame<N> {
        Frame {
            id: self.id.clone(),
            message,
        }
    }
}

impl<M> From<M> for Frame<M> {
    fn from(message: M) -> Self {
        Self::new(message)
    }
}

impl<M: Serialize> Frame<M> {
    /// Encode to JSON text.
    ///
    /// # Errors
    /// Returns error if the message does not serialize to an object.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut value = serde_json::to_value(&self.message)?;
        let Value::Object(map) = &mut value else {
            return Err(ProtocolError::Malformed(
                "message did not serialize to an object".to_string(),
            ));
        };
        if let Some(id) = &self.id {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        Ok(serde_json::to_string(&value)?)
    }
}

impl<M: DeserializeOwned> Frame<M> {
    /// Decode and validate JSON text.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Malformed`] for anything that is not a known,
    /// well-shaped message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(map) = &mut value else {
            return Err(ProtocolError::Malformed("frame is not an object".to_string()));
        };
        let id = match map.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(other) => {
                return Err(ProtocolError::Malformed(format!(
                    "frame id must be a string, got {other}"
                )));
            }
        };
        let message =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(Self { id, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Message, MessageRole};

    #[test]
    fn test_null_context_shape() {
        let frame = Frame::new(ServerMessage::context(None, Some(7)));
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "EXECUTION_CONTEXT");
        assert_eq!(value["payload"]["executionId"], Value::Null);
        assert_eq!(value["payload"]["tabId"], 7);
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_request_id_is_echoed() {
        let request = Frame::request(
            ClientMessage::SyncRequest {
                connection_name: "surface-1".into(),
                tab_id: Some(4),
            },
            "req-1",
        );
        let decoded: Frame<ClientMessage> = Frame::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);

        let reply = decoded.reply(ServerMessage::Pong);
        assert_eq!(reply.id.as_deref(), Some("req-1"));
        let text = reply.encode().unwrap();
        assert!(text.contains("\"PONG\""));
        let back: Frame<ServerMessage> = Frame::decode(&text).unwrap();
        assert_eq!(back.message, ServerMessage::Pong);
    }

    #[test]
    fn test_stream_update_payload() {
        let frame = Frame::new(ServerMessage::AgentStreamUpdate {
            execution_id: "exec-1".into(),
            event: StreamEvent::Message {
                message: Message::new("m1", MessageRole::User, "hello", 5),
            },
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "AGENT_STREAM_UPDATE");
        assert_eq!(value["payload"]["executionId"], "exec-1");
        assert_eq!(value["payload"]["event"]["kind"], "message");
    }

    #[test]
    fn test_handshake_parses_with_sparse_fields() {
        let text = r#"{"type":"HANDSHAKE","payload":{"kind":"tab","tabId":5}}"#;
        let frame: Frame<ClientMessage> = Frame::decode(text).unwrap();
        assert_eq!(frame.message, ClientMessage::Handshake(Handshake::tab(5)));
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        for text in [
            "not json",
            "[1,2,3]",
            r#"{"type":"NO_SUCH_TYPE"}"#,
            r#"{"type":"SYNC_REQUEST","payload":{"tabId":"seven"}}"#,
            r#"{"type":"PING","id":42}"#,
        ] {
            let result = Frame::<ClientMessage>::decode(text);
            assert!(
                matches!(result, Err(ProtocolError::Malformed(_))),
                "accepted {text}"
            );
        }
    }
}
