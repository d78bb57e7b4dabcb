//! Message interpretation
//!
//! Turns the latest user message into a `Decision`. The keyword interpreter
//! is deterministic and always available; the Gemini interpreter falls back
//! to it whenever the model call or its output is unusable.

use crate::classifier::{ClassifierContext, MessageClassifier};
use crate::models::Decision;
use crate::state::WorkflowState;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub mod gemini;
pub use gemini::GeminiInterpreter;

#[async_trait]
pub trait MessageInterpreter: Send + Sync {
    async fn interpret(&self, state: &WorkflowState, message: &str) -> Result<Decision>;

    fn name(&self) -> &'static str;
}

/// Classifier context derived from the thread state
pub fn classifier_context(state: &WorkflowState) -> ClassifierContext<'_> {
    ClassifierContext {
        awaiting_confirmation: state.is_suspended(),
        candidate_count: state.fund_candidates.len(),
        current_fund: state.data.fund_name.as_deref(),
    }
}

/// Keyword and regex interpreter
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordInterpreter;

#[async_trait]
impl MessageInterpreter for KeywordInterpreter {
    async fn interpret(&self, state: &WorkflowState, message: &str) -> Result<Decision> {
        Ok(MessageClassifier::classify(message, classifier_context(state)))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

/// Gemini when an API key is configured, keywords otherwise.
pub fn build_interpreter(gemini_api_key: Option<&str>) -> Arc<dyn MessageInterpreter> {
    if let Some(key) = gemini_api_key {
        match GeminiInterpreter::new(key) {
            Ok(interpreter) => {
                info!("Message interpreter: gemini");
                return Arc::new(interpreter);
            }
            Err(error) => {
                warn!("Failed to build Gemini interpreter, using keywords: {}", error);
            }
        }
    }

    info!("Message interpreter: keyword");
    Arc::new(KeywordInterpreter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fund, Intent, ScoredCandidate, UserContext};

    #[tokio::test]
    async fn test_keyword_interpreter_uses_candidate_count() {
        let mut state = WorkflowState::new("t", UserContext::new("u", "Kim"));
        state.fund_candidates = vec![
            ScoredCandidate {
                item: Fund {
                    id: "F-1".into(),
                    name: "Evergreen Growth Fund II".into(),
                    currency_code: "USD".into(),
                },
                score: 0.9,
                match_reason: None,
            },
            ScoredCandidate {
                item: Fund {
                    id: "F-2".into(),
                    name: "Evergreen Growth Fund III".into(),
                    currency_code: "USD".into(),
                },
                score: 0.9,
                match_reason: None,
            },
        ];

        let decision = KeywordInterpreter.interpret(&state, "2").await.unwrap();
        assert_eq!(decision.intent, Intent::ProvideData);
        assert_eq!(decision.extraction.candidate_choice, Some(2));
    }

    #[test]
    fn test_build_without_key_uses_keywords() {
        assert_eq!(build_interpreter(None).name(), "keyword");
    }
}
