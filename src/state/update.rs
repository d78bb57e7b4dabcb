//! Partial state updates and their merge rules
//!
//! Nodes never mutate `WorkflowState` directly. They return a `StateUpdate`
//! and the runtime merges it with `WorkflowState::apply`:
//!
//! - messages: append, replacing in place when the id already exists
//! - optional scalars: `Patch::Keep` / `Patch::Set` / `Patch::Clear`
//! - status: overwritten when present
//! - candidate and reference lists: replaced wholesale when present

use crate::memory::ConversationMessage;
use crate::models::{
    CapitalCallData, Decision, DocumentStatus, Fund, GLAccount, Investor, PendingConfirmation,
    ScoredCandidate, WorkflowStatus,
};
use chrono::NaiveDate;

use super::WorkflowState;

/// Three-way update for an optional field
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    pub fn apply_to(self, target: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Set(value) => *target = Some(value),
            Patch::Clear => *target = None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

impl<T> From<Option<T>> for Patch<T> {
    /// `Some` sets, `None` clears
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Clear,
        }
    }
}

/// Per-field update of `CapitalCallData`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataUpdate {
    pub fund_id: Patch<String>,
    pub fund_name: Patch<String>,
    pub amount: Patch<f64>,
    pub submit_date: Patch<NaiveDate>,
    pub posting_date: Patch<NaiveDate>,
    pub gl_accounts: Option<Vec<GLAccount>>,
    pub document_id: Patch<String>,
    pub document_status: Patch<DocumentStatus>,
}

impl DataUpdate {
    pub fn is_empty(&self) -> bool {
        self.touched_fields().is_empty()
    }

    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.fund_id.is_keep() {
            fields.push("data.fund_id");
        }
        if !self.fund_name.is_keep() {
            fields.push("data.fund_name");
        }
        if !self.amount.is_keep() {
            fields.push("data.amount");
        }
        if !self.submit_date.is_keep() {
            fields.push("data.submit_date");
        }
        if !self.posting_date.is_keep() {
            fields.push("data.posting_date");
        }
        if self.gl_accounts.is_some() {
            fields.push("data.gl_accounts");
        }
        if !self.document_id.is_keep() {
            fields.push("data.document_id");
        }
        if !self.document_status.is_keep() {
            fields.push("data.document_status");
        }
        fields
    }

    fn apply_to(self, data: &mut CapitalCallData) {
        self.fund_id.apply_to(&mut data.fund_id);
        self.fund_name.apply_to(&mut data.fund_name);
        self.amount.apply_to(&mut data.amount);
        self.submit_date.apply_to(&mut data.submit_date);
        self.posting_date.apply_to(&mut data.posting_date);
        if let Some(accounts) = self.gl_accounts {
            data.gl_accounts = accounts;
        }
        self.document_id.apply_to(&mut data.document_id);
        self.document_status.apply_to(&mut data.document_status);
    }
}

/// Delta returned by a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<ConversationMessage>,
    pub last_decision: Patch<Decision>,
    pub status: Option<WorkflowStatus>,
    pub error: Patch<String>,
    pub pending_confirmation: Patch<PendingConfirmation>,
    pub approved_data_hash: Patch<String>,
    pub data: DataUpdate,
    pub fund_candidates: Option<Vec<ScoredCandidate<Fund>>>,
    pub available_accounts: Option<Vec<GLAccount>>,
    pub investors: Option<Vec<Investor>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: ConversationMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn decision(mut self, decision: Decision) -> Self {
        self.last_decision = Patch::Set(decision);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Patch::Set(error.into());
        self
    }

    pub fn pending(mut self, pending: PendingConfirmation) -> Self {
        self.pending_confirmation = Patch::Set(pending);
        self
    }

    pub fn clear_pending(mut self) -> Self {
        self.pending_confirmation = Patch::Clear;
        self
    }

    pub fn data(mut self, data: DataUpdate) -> Self {
        self.data = data;
        self
    }

    pub fn fund_candidates(mut self, candidates: Vec<ScoredCandidate<Fund>>) -> Self {
        self.fund_candidates = Some(candidates);
        self
    }

    pub fn available_accounts(mut self, accounts: Vec<GLAccount>) -> Self {
        self.available_accounts = Some(accounts);
        self
    }

    pub fn investors(mut self, investors: Vec<Investor>) -> Self {
        self.investors = Some(investors);
        self
    }

    /// Field paths this update writes
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.messages.is_empty() {
            fields.push("conversation.messages");
        }
        if !self.last_decision.is_keep() {
            fields.push("conversation.last_decision");
        }
        if self.status.is_some() {
            fields.push("orchestration.status");
        }
        if !self.error.is_keep() {
            fields.push("orchestration.error");
        }
        if !self.pending_confirmation.is_keep() {
            fields.push("orchestration.pending_confirmation");
        }
        if !self.approved_data_hash.is_keep() {
            fields.push("orchestration.approved_data_hash");
        }
        fields.extend(self.data.touched_fields());
        if self.fund_candidates.is_some() {
            fields.push("fund_candidates");
        }
        if self.available_accounts.is_some() {
            fields.push("available_accounts");
        }
        if self.investors.is_some() {
            fields.push("investors");
        }
        fields
    }
}

impl WorkflowState {
    /// Merge a node's update into the state.
    pub fn apply(&mut self, update: StateUpdate) {
        self.conversation.history.extend(update.messages);
        update
            .last_decision
            .apply_to(&mut self.conversation.last_decision);

        if let Some(status) = update.status {
            self.orchestration.status = status;
        }
        update.error.apply_to(&mut self.orchestration.error);
        update
            .pending_confirmation
            .apply_to(&mut self.orchestration.pending_confirmation);
        update
            .approved_data_hash
            .apply_to(&mut self.orchestration.approved_data_hash);

        update.data.apply_to(&mut self.data);

        if let Some(candidates) = update.fund_candidates {
            self.fund_candidates = candidates;
        }
        if let Some(accounts) = update.available_accounts {
            self.available_accounts = accounts;
        }
        if let Some(investors) = update.investors {
            self.investors = investors;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Intent, UserContext};

    fn state() -> WorkflowState {
        WorkflowState::new("t-1", UserContext::new("u-1", "Dana"))
    }

    #[test]
    fn test_patch_semantics() {
        let mut value = Some(1);
        Patch::Keep.apply_to(&mut value);
        assert_eq!(value, Some(1));
        Patch::Set(2).apply_to(&mut value);
        assert_eq!(value, Some(2));
        Patch::<i32>::Clear.apply_to(&mut value);
        assert_eq!(value, None);
    }

    #[test]
    fn test_data_fields_merge_independently() {
        let mut s = state();
        s.apply(StateUpdate::new().data(DataUpdate {
            amount: Patch::Set(500_000.0),
            submit_date: Patch::Set(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()),
            ..Default::default()
        }));
        s.apply(StateUpdate::new().data(DataUpdate {
            fund_id: Patch::Set("F-1".into()),
            fund_name: Patch::Set("Evergreen".into()),
            ..Default::default()
        }));

        assert_eq!(s.data.amount, Some(500_000.0));
        assert_eq!(s.data.fund_id.as_deref(), Some("F-1"));
        assert!(s.data.submit_date.is_some());
        assert!(s.data.posting_date.is_none());
    }

    #[test]
    fn test_lists_replaced_wholesale() {
        let mut s = state();
        let account = |code: &str| GLAccount {
            code: code.into(),
            name: code.into(),
            allocated_amount: None,
        };
        s.apply(StateUpdate::new().available_accounts(vec![account("1"), account("2")]));
        s.apply(StateUpdate::new().available_accounts(vec![account("3")]));
        assert_eq!(s.available_accounts.len(), 1);
        assert_eq!(s.available_accounts[0].code, "3");

        s.apply(StateUpdate::new());
        assert_eq!(s.available_accounts.len(), 1);
    }

    #[test]
    fn test_messages_append_or_replace() {
        let mut s = state();
        let reply = ConversationMessage::agent("draft", "review");
        let mut replacement = ConversationMessage::agent("final", "review");
        replacement.message_id = reply.message_id;

        s.apply(StateUpdate::new().message(ConversationMessage::user("go")).message(reply));
        s.apply(StateUpdate::new().message(replacement));

        let contents: Vec<_> = s
            .conversation
            .history
            .messages()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["go", "final"]);
    }

    #[test]
    fn test_touched_fields() {
        let update = StateUpdate::new()
            .decision(Decision::new(Intent::Confirm, 0.9, "yes"))
            .status(WorkflowStatus::InProgress)
            .clear_pending();
        assert_eq!(
            update.touched_fields(),
            vec![
                "conversation.last_decision",
                "orchestration.status",
                "orchestration.pending_confirmation"
            ]
        );
    }
}
