//! Gemini-backed message interpreter
//!
//! Asks the model for a JSON decision envelope. Any transport or parse
//! failure falls back to the keyword interpreter.

use crate::error::WorkflowError;
use crate::gemini::GeminiClient;
use crate::interpreter::{KeywordInterpreter, MessageInterpreter};
use crate::memory::ContextManager;
use crate::models::{AccountSelection, Decision, Extraction, Intent};
use crate::state::WorkflowState;
use crate::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::warn;

const SYSTEM_PROMPT: &str = r#"You classify messages in a capital call workflow.
Return ONLY a JSON object:
{
  "intent": "fund_lookup|provide_data|modify_data|confirm|reject|cancel|ask_clarification|unknown",
  "confidence": 0.0-1.0,
  "reasoning": "...",
  "needs_clarification": false,
  "clarification_prompt": null,
  "extraction": {
    "fund_query": null,
    "amount": null,
    "submit_date": "YYYY-MM-DD or null",
    "posting_date": "YYYY-MM-DD or null",
    "account_selections": [{"code": "4000", "amount": null}],
    "candidate_choice": null
  }
}
Rules:
- Only extract values the user stated in the latest message
- candidate_choice is the 1-based number of a listed fund candidate
- confirm/reject only apply while a summary awaits confirmation
- If unsure, set needs_clarification and explain in clarification_prompt"#;

pub struct GeminiInterpreter {
    client: GeminiClient,
    context_manager: ContextManager,
    fallback: KeywordInterpreter,
}

impl GeminiInterpreter {
    pub fn new(api_key: &str) -> Result<Self> {
        Ok(Self::with_client(GeminiClient::new(api_key)?))
    }

    pub fn with_client(client: GeminiClient) -> Self {
        Self {
            client,
            context_manager: ContextManager::new(),
            fallback: KeywordInterpreter,
        }
    }

    fn build_prompt(&self, state: &WorkflowState, message: &str) -> String {
        let candidates = state
            .fund_candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. {}", i + 1, c.item.name))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "STATUS: {}\nAWAITING CONFIRMATION: {}\nMISSING FIELDS: {:?}\nFUND CANDIDATES:\n{}\n\nRECENT CONVERSATION:\n{}\n\nLATEST MESSAGE:\n{}",
            state.status(),
            state.is_suspended(),
            state.data.missing_fields(),
            if candidates.is_empty() { "(none)".to_string() } else { candidates },
            self.context_manager.render(&state.conversation.history),
            message
        )
    }

    async fn ask_model(&self, state: &WorkflowState, message: &str) -> Result<Decision> {
        let prompt = self.build_prompt(state, message);
        let (response, model_confidence) = self.client.generate(SYSTEM_PROMPT, &prompt).await?;
        let mut decision = parse_decision_response(&response)?;
        decision.confidence = decision.confidence.min(model_confidence);
        Ok(decision)
    }
}

#[async_trait]
impl MessageInterpreter for GeminiInterpreter {
    async fn interpret(&self, state: &WorkflowState, message: &str) -> Result<Decision> {
        match self.ask_model(state, message).await {
            Ok(decision) => Ok(decision),
            Err(error) => {
                warn!(
                    thread_id = %state.thread_id(),
                    "Gemini interpretation failed, falling back to keywords: {}",
                    error
                );
                self.fallback.interpret(state, message).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    intent: Intent,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    needs_clarification: bool,
    #[serde(default)]
    clarification_prompt: Option<String>,
    #[serde(default)]
    extraction: RawExtraction,
}

#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    fund_query: Option<String>,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    submit_date: Option<String>,
    #[serde(default)]
    posting_date: Option<String>,
    #[serde(default)]
    account_selections: Vec<AccountSelection>,
    #[serde(default)]
    candidate_choice: Option<usize>,
}

fn parse_date(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
}

/// Parse the model's JSON, tolerating a markdown fence around it.
fn parse_decision_response(response: &str) -> Result<Decision> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let raw: RawDecision = serde_json::from_str(cleaned).map_err(|e| {
        WorkflowError::InterpreterError(format!(
            "Failed to parse decision response: {} | raw={}",
            e, response
        ))
    })?;

    let ex = raw.extraction;
    Ok(Decision {
        intent: raw.intent,
        confidence: raw.confidence.clamp(0.0, 1.0),
        reasoning: raw.reasoning,
        needs_clarification: raw.needs_clarification,
        clarification_prompt: raw.clarification_prompt,
        extraction: Extraction {
            fund_query: ex.fund_query.filter(|q| !q.trim().is_empty()),
            amount: ex.amount.filter(|a| *a > 0.0),
            submit_date: parse_date(ex.submit_date),
            posting_date: parse_date(ex.posting_date),
            account_selections: ex.account_selections,
            candidate_choice: ex.candidate_choice.filter(|c| *c > 0),
        },
        decided_at: Utc::now(),
    })
}
