//! Prompt window selection
//!
//! Chooses which part of a thread's history is sent to the LLM interpreter.

use crate::memory::store::{ConversationHistory, ConversationMessage, MessageRole};

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Token ceiling for the selected window
    pub max_context_tokens: usize,
    /// Most recent messages considered
    pub preserve_recent_count: usize,
    pub include_system: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 4_000,
            preserve_recent_count: 12,
            include_system: false,
        }
    }
}

pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
        }
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Recent messages in chronological order, trimmed to the token ceiling.
    /// The newest message is always kept.
    pub fn prepare_context_for_llm<'a>(
        &self,
        history: &'a ConversationHistory,
    ) -> Vec<&'a ConversationMessage> {
        let mut selected = Vec::with_capacity(self.config.preserve_recent_count);
        let mut tokens = 0usize;

        for msg in history.recent_messages(self.config.preserve_recent_count) {
            if msg.role == MessageRole::System && !self.config.include_system {
                continue;
            }
            let cost = msg.token_estimate();
            if !selected.is_empty() && tokens + cost > self.config.max_context_tokens {
                break;
            }
            tokens += cost;
            selected.push(msg);
        }

        selected.reverse();
        selected
    }

    pub fn render(&self, history: &ConversationHistory) -> String {
        self.prepare_context_for_llm(history)
            .into_iter()
            .map(|m| {
                let role = match m.role {
                    MessageRole::User => "User",
                    MessageRole::Agent => "Agent",
                    MessageRole::System => "System",
                };
                format!("{}: {}", role, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}
