//! Composed workflow state
//!
//! One record per thread, built from named layers:
//! conversation → context → orchestration → domain data.
//! The whole record is the unit of persistence.

pub mod store;
pub mod update;

use crate::memory::ConversationHistory;
use crate::models::{
    CapitalCallData, Decision, Fund, GLAccount, Investor, PendingConfirmation, ScoredCandidate,
    UserContext, WorkflowStatus,
};
use crate::workflow::NodeName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{build_checkpoint_store, Checkpoint, CheckpointStore, InMemoryCheckpointStore};
pub use update::{DataUpdate, Patch, StateUpdate};

//
// ================= Layers =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub history: ConversationHistory,
    /// Classification of the latest user message, used for routing
    pub last_decision: Option<Decision>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadContext {
    pub thread_id: String,
    pub user: UserContext,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationState {
    pub status: WorkflowStatus,
    pub current_step: Option<NodeName>,
    pub error: Option<String>,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub step_history: Vec<NodeName>,
    /// Node to re-enter on resume
    pub suspended_at: Option<NodeName>,
    /// Hash of the data the user approved
    pub approved_data_hash: Option<String>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            status: WorkflowStatus::InProgress,
            current_step: None,
            error: None,
            pending_confirmation: None,
            step_history: Vec::new(),
            suspended_at: None,
            approved_data_hash: None,
        }
    }
}

//
// ================= Composed State =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub conversation: ConversationState,
    pub context: ThreadContext,
    pub orchestration: OrchestrationState,
    pub data: CapitalCallData,
    #[serde(default)]
    pub fund_candidates: Vec<ScoredCandidate<Fund>>,
    #[serde(default)]
    pub available_accounts: Vec<GLAccount>,
    #[serde(default)]
    pub investors: Vec<Investor>,
}

impl WorkflowState {
    pub fn new(thread_id: impl Into<String>, user: UserContext) -> Self {
        Self {
            conversation: ConversationState::default(),
            context: ThreadContext {
                thread_id: thread_id.into(),
                user,
                started_at: Utc::now(),
            },
            orchestration: OrchestrationState::default(),
            data: CapitalCallData::default(),
            fund_candidates: Vec::new(),
            available_accounts: Vec::new(),
            investors: Vec::new(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.context.thread_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.orchestration.status
    }

    pub fn is_suspended(&self) -> bool {
        self.orchestration.status == WorkflowStatus::AwaitingConfirmation
            && self.orchestration.pending_confirmation.is_some()
    }

    pub fn last_decision(&self) -> Option<&Decision> {
        self.conversation.last_decision.as_ref()
    }

    /// Record that `step` is executing.
    pub fn enter_step(&mut self, step: NodeName) {
        self.orchestration.current_step = Some(step);
        self.orchestration.step_history.push(step);
    }

    pub fn to_snapshot(&self, replies: Vec<String>) -> WorkflowSnapshot {
        WorkflowSnapshot {
            thread_id: self.context.thread_id.clone(),
            status: self.orchestration.status,
            current_step: self.orchestration.current_step,
            pending_confirmation: self.orchestration.pending_confirmation.clone(),
            replies,
            missing_fields: self
                .data
                .missing_fields()
                .into_iter()
                .map(str::to_string)
                .collect(),
            error: self.orchestration.error.clone(),
            data: self.data.clone(),
        }
    }
}

/// What the host sees after each call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSnapshot {
    pub thread_id: String,
    pub status: WorkflowStatus,
    pub current_step: Option<NodeName>,
    pub pending_confirmation: Option<PendingConfirmation>,
    /// Agent messages produced by this call
    pub replies: Vec<String>,
    pub missing_fields: Vec<String>,
    pub error: Option<String>,
    pub data: CapitalCallData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationMessage;
    use crate::models::{Intent, UserContext};
    use chrono::NaiveDate;

    #[test]
    fn test_state_json_round_trip() {
        let mut state = WorkflowState::new(
            "thread-42",
            UserContext::new("u-7", "Robin").with_permission("capital_calls:create"),
        );
        state.apply(
            StateUpdate::new()
                .message(ConversationMessage::user("Find Evergreen Growth Fund III"))
                .decision(Decision::new(Intent::FundLookup, 0.92, "fund keyword")),
        );
        state.data.amount = Some(2_500_000.0);
        state.data.submit_date = NaiveDate::from_ymd_opt(2025, 6, 1);
        state.enter_step(NodeName::ParseIntent);
        state.enter_step(NodeName::SearchFund);

        let json = serde_json::to_string(&state).unwrap();
        let restored: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_snapshot_lists_missing_fields() {
        let state = WorkflowState::new("t", UserContext::new("u", "Sam"));
        let snapshot = state.to_snapshot(vec!["hello".into()]);
        assert_eq!(snapshot.status, WorkflowStatus::InProgress);
        assert_eq!(snapshot.missing_fields.len(), 5);
        assert_eq!(snapshot.replies, vec!["hello".to_string()]);
    }

    #[test]
    fn test_enter_step_tracks_history() {
        let mut state = WorkflowState::new("t", UserContext::new("u", "Sam"));
        state.enter_step(NodeName::ParseIntent);
        state.enter_step(NodeName::RequestInput);
        assert_eq!(state.orchestration.current_step, Some(NodeName::RequestInput));
        assert_eq!(
            state.orchestration.step_history,
            vec![NodeName::ParseIntent, NodeName::RequestInput]
        );
    }
}
