//! Conversation memory
//!
//! Message history for a thread and the window of it shown to the LLM.

pub mod context_manager;
pub mod store;

pub use context_manager::{ContextConfig, ContextManager};
pub use store::{ConversationHistory, ConversationMessage, MessageRole};
