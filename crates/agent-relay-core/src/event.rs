//! Execution events published onto channels and cached by clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of one running agent execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Wrap a raw id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Thinking,
    Assistant,
    Error,
    Narration,
    PlanEditor,
}

/// One logical conversation entry. `msg_id` is unique within an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub msg_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(
        msg_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            msg_id: msg_id.into(),
            role,
            content: content.into(),
            timestamp,
        }
    }
}

/// Incremental output of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// New message, or a progressive update of one already sent.
    Message { message: Message },
    /// The execution reported an error.
    Error { message: String },
}

/// Execution lifecycle signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Success,
    Error { message: String },
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the execution has stopped doing work.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Everything an execution engine can publish onto a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stream(StreamEvent),
    Status(WorkflowStatus),
}

impl From<StreamEvent> for ChannelEvent {
    fn from(event: StreamEvent) -> Self {
        Self::Stream(event)
    }
}

impl From<WorkflowStatus> for ChannelEvent {
    fn from(status: WorkflowStatus) -> Self {
        Self::Status(status)
    }
}

/// User feedback attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub rating: FeedbackRating,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackRating {
    Positive,
    Negative,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_names() {
        let json = serde_json::to_string(&MessageRole::PlanEditor).unwrap();
        assert_eq!(json, "\"plan_editor\"");
    }

    #[test]
    fn test_stream_event_shape() {
        let event = StreamEvent::Message {
            message: Message::new("m1", MessageRole::Assistant, "hi", 100),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "message");
        assert_eq!(value["message"]["msgId"], "m1");
        assert_eq!(value["message"]["role"], "assistant");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Success.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(
            WorkflowStatus::Error {
                message: "boom".into()
            }
            .is_terminal()
        );
    }
}
