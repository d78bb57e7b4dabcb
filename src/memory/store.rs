//! Conversation history storage
//!
//! Messages are kept in arrival order. Writing a message whose id is already
//! present replaces it in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

/// A single message in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    /// Node that produced an agent message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            source_step: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn agent(content: impl Into<String>, step: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageRole::Agent, content);
        msg.source_step = Some(step.into());
        msg
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Rough token estimate used to size prompt windows
    pub fn token_estimate(&self) -> usize {
        (self.content.len() + 3) / 4
    }
}

/// Ordered message log for one thread
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationHistory {
    messages: Vec<ConversationMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append, or replace in place when the id already exists.
    pub fn upsert(&mut self, message: ConversationMessage) {
        match self
            .messages
            .iter_mut()
            .find(|m| m.message_id == message.message_id)
        {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
    }

    pub fn extend<I: IntoIterator<Item = ConversationMessage>>(&mut self, messages: I) {
        for message in messages {
            self.upsert(message);
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    /// Most recent first
    pub fn recent_messages(
        &self,
        count: usize,
    ) -> impl DoubleEndedIterator<Item = &ConversationMessage> {
        self.messages.iter().rev().take(count)
    }

    pub fn last_user_message(&self) -> Option<&ConversationMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
    }

    /// Agent messages written after the given position
    pub fn agent_replies_since(&self, position: usize) -> Vec<String> {
        self.messages
            .iter()
            .skip(position)
            .filter(|m| m.role == MessageRole::Agent)
            .map(|m| m.content.clone())
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Plain transcript, oldest first
    pub fn to_transcript(&self) -> String {
        let mut out = String::new();
        for msg in &self.messages {
            let role = match msg.role {
                MessageRole::User => "User",
                MessageRole::Agent => "Agent",
                MessageRole::System => "System",
            };
            out.push_str(&format!("{}: {}\n", role, msg.content));
        }
        out
    }
}
