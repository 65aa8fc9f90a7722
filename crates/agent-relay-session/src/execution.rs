//! Cached state of one execution.

use std::collections::HashMap;

use agent_relay_core::{Feedback, Message};
use tokio::time::Instant;

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First message with this id.
    Inserted,
    /// An existing message had its content and timestamp replaced.
    Replaced,
}

/// Messages, flags and feedback of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
    processing: bool,
    error: Option<String>,
    feedback: HashMap<String, Feedback>,
    last_activity_at: Instant,
}

impl ExecutionState {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            messages: Vec::new(),
            index: HashMap::new(),
            processing: false,
            error: None,
            feedback: HashMap::new(),
            last_activity_at: now,
        }
    }

    /// Messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub const fn processing(&self) -> bool {
        self.processing
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub const fn feedback(&self) -> &HashMap<String, Feedback> {
        &self.feedback
    }

    #[must_use]
    pub const fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity_at = self.last_activity_at.max(now);
    }

    /// Insert a new message or replace the content of an existing one.
    ///
    /// Only a new id marks the execution as processing.
    pub(crate) fn upsert(&mut self, message: Message, now: Instant) -> UpsertOutcome {
        self.touch(now);
        if let Some(&position) = self.index.get(&message.msg_id) {
            let existing = &mut self.messages[position];
            existing.content = message.content;
            existing.timestamp = message.timestamp;
            return UpsertOutcome::Replaced;
        }
        self.index.insert(message.msg_id.clone(), self.messages.len());
        self.messages.push(message);
        self.processing = true;
        UpsertOutcome::Inserted
    }

    pub(crate) const fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    pub(crate) fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub(crate) fn set_feedback(&mut self, msg_id: String, feedback: Feedback) {
        self.feedback.insert(msg_id, feedback);
    }

    /// Fold `source` (a provisional identity) into this record.
    ///
    /// Messages are unioned by id with this record winning ties; source-only
    /// messages come first since the provisional identity preceded this one.
    /// When this record already existed its flags win, otherwise the source's
    /// are adopted. Feedback merges with this record's entries winning.
    pub(crate) fn absorb(&mut self, source: Self, existed: bool) {
        let mut merged: Vec<Message> = source
            .messages
            .into_iter()
            .filter(|m| !self.index.contains_key(&m.msg_id))
            .collect();
        merged.append(&mut self.messages);
        self.index = merged
            .iter()
            .enumerate()
            .map(|(position, m)| (m.msg_id.clone(), position))
            .collect();
        self.messages = merged;

        if existed {
            if self.error.is_none() {
                self.error = source.error;
            }
        } else {
            self.processing = source.processing;
            self.error = source.error;
        }

        for (msg_id, feedback) in source.feedback {
            self.feedback.entry(msg_id).or_insert(feedback);
        }
        self.touch(source.last_activity_at);
    }
}

#[cfg(test)]
mod tests {
    use agent_relay_core::{FeedbackRating, MessageRole};

    use super::*;

    fn msg(id: &str, content: &str, ts: i64) -> Message {
        Message::new(id, MessageRole::Assistant, content, ts)
    }

    #[test]
    fn test_replace_keeps_position_and_role() {
        let now = Instant::now();
        let mut state = ExecutionState::new(now);
        state.upsert(Message::new("m1", MessageRole::Thinking, "a", 1), now);
        state.upsert(msg("m2", "b", 2), now);

        assert_eq!(state.upsert(msg("m1", "a!", 3), now), UpsertOutcome::Replaced);
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].content, "a!");
        assert_eq!(state.messages()[0].timestamp, 3);
        assert_eq!(state.messages()[0].role, MessageRole::Thinking);
    }

    #[test]
    fn test_absorb_unions_messages_with_destination_precedence() {
        let now = Instant::now();
        let mut source = ExecutionState::new(now);
        source.upsert(msg("m1", "source", 1), now);
        source.upsert(msg("m2", "only source", 2), now);
        source.set_feedback("m2".into(), Feedback {
            rating: FeedbackRating::Negative,
            comment: None,
        });
        source.set_error(Some("source error".into()));

        let mut dest = ExecutionState::new(now);
        dest.upsert(msg("m1", "dest", 5), now);
        dest.set_processing(false);
        dest.set_feedback("m2".into(), Feedback {
            rating: FeedbackRating::Positive,
            comment: Some("nice".into()),
        });

        dest.absorb(source, true);

        let contents: Vec<&str> = dest.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["only source", "dest"]);
        assert!(!dest.processing());
        assert_eq!(dest.error(), Some("source error"));
        assert_eq!(dest.feedback()["m2"].rating, FeedbackRating::Positive);
    }

    #[test]
    fn test_absorb_into_new_record_adopts_source_flags() {
        let now = Instant::now();
        let mut source = ExecutionState::new(now);
        source.upsert(msg("m1", "x", 1), now);

        let mut dest = ExecutionState::new(now);
        dest.absorb(source, false);
        assert!(dest.processing());
        assert_eq!(dest.messages().len(), 1);
    }
}
