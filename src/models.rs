//! Core data models for the capital call workflow

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Tolerance used when comparing money amounts.
pub const AMOUNT_EPSILON: f64 = 0.005;

/// Confidence required before a decision is acted on without asking.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.8;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    AwaitingInput,
    AwaitingConfirmation,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Created,
    Submitted,
    Posted,
}

/// Classified intent of a user message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FundLookup,
    ProvideData,
    ModifyData,
    Confirm,
    Reject,
    Cancel,
    AskClarification,
    Unknown,
}

//
// ================= Context =================
//

/// Authenticated user for a thread. Set once when the thread starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            permissions: BTreeSet::new(),
            preferences: BTreeMap::new(),
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_preference(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.preferences.insert(key.into(), value.into());
        self
    }

    pub fn can(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn preference(&self, key: &str) -> Option<&str> {
        self.preferences.get(key).map(|s| s.as_str())
    }
}

pub const PERMISSION_CREATE_CAPITAL_CALL: &str = "capital_calls:create";

//
// ================= Reference Data =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fund {
    pub id: String,
    pub name: String,
    pub currency_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate<T> {
    pub item: T,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GLAccount {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub allocated_amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Investor {
    pub id: String,
    pub name: String,
    pub commitment: f64,
    pub called_amount: f64,
}

impl Investor {
    /// Not clamped: an over-called investor yields a negative remainder.
    pub fn remaining_commitment(&self) -> f64 {
        self.commitment - self.called_amount
    }

    pub fn is_over_called(&self) -> bool {
        self.called_amount > self.commitment + AMOUNT_EPSILON
    }
}

//
// ================= Capital Call =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CapitalCallData {
    pub fund_id: Option<String>,
    pub fund_name: Option<String>,
    pub amount: Option<f64>,
    pub submit_date: Option<NaiveDate>,
    pub posting_date: Option<NaiveDate>,
    #[serde(default)]
    pub gl_accounts: Vec<GLAccount>,
    pub document_id: Option<String>,
    pub document_status: Option<DocumentStatus>,
}

impl CapitalCallData {
    /// Required fields that are still absent, in a fixed order.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.fund_id.is_none() {
            missing.push("fund");
        }
        if self.amount.is_none() {
            missing.push("amount");
        }
        if self.submit_date.is_none() {
            missing.push("submit_date");
        }
        if self.posting_date.is_none() {
            missing.push("posting_date");
        }
        if self.gl_accounts.is_empty() {
            missing.push("gl_accounts");
        }
        missing
    }

    pub fn is_ready_for_creation(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Sum of present allocations; absent allocations count as zero.
    pub fn total_allocated(&self) -> f64 {
        self.gl_accounts
            .iter()
            .filter_map(|a| a.allocated_amount)
            .sum()
    }
}

//
// ================= Decisions =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSelection {
    pub code: String,
    #[serde(default)]
    pub amount: Option<f64>,
}

/// Structured data pulled out of one user message
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Extraction {
    #[serde(default)]
    pub fund_query: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub submit_date: Option<NaiveDate>,
    #[serde(default)]
    pub posting_date: Option<NaiveDate>,
    #[serde(default)]
    pub account_selections: Vec<AccountSelection>,
    /// 1-based index into the listed fund candidates
    #[serde(default)]
    pub candidate_choice: Option<usize>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.fund_query.is_none()
            && !self.has_details()
            && self.account_selections.is_empty()
            && self.candidate_choice.is_none()
    }

    pub fn has_details(&self) -> bool {
        self.amount.is_some() || self.submit_date.is_some() || self.posting_date.is_some()
    }
}

/// Classification of the latest user message, used for routing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub intent: Intent,
    pub confidence: f32,
    pub reasoning: String,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_prompt: Option<String>,
    #[serde(default)]
    pub extraction: Extraction,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(intent: Intent, confidence: f32, reasoning: impl Into<String>) -> Self {
        Self {
            intent,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            needs_clarification: false,
            clarification_prompt: None,
            extraction: Extraction::default(),
            decided_at: Utc::now(),
        }
    }

    pub fn with_extraction(mut self, extraction: Extraction) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn needing_clarification(mut self, prompt: impl Into<String>) -> Self {
        self.needs_clarification = true;
        self.clarification_prompt = Some(prompt.into());
        self
    }

    pub fn is_actionable(&self, threshold: f32) -> bool {
        self.confidence >= threshold && !self.needs_clarification
    }
}

//
// ================= Confirmation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingConfirmation {
    pub suspension_id: Uuid,
    pub summary: String,
    /// Hash of the data the summary was built from
    pub data_hash: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Approve/reject signal supplied by the host at a suspension point
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeDecision {
    pub approved: bool,
    #[serde(default)]
    pub suspension_id: Option<Uuid>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ResumeDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            suspension_id: None,
            comment: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            approved: false,
            suspension_id: None,
            comment: None,
        }
    }

    pub fn for_suspension(mut self, suspension_id: Uuid) -> Self {
        self.suspension_id = Some(suspension_id);
        self
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::AwaitingInput => "awaiting_input",
            WorkflowStatus::AwaitingConfirmation => "awaiting_confirmation",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Draft => "Draft",
            DocumentStatus::Created => "Created",
            DocumentStatus::Submitted => "Submitted",
            DocumentStatus::Posted => "Posted",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(code: &str, amount: Option<f64>) -> GLAccount {
        GLAccount {
            code: code.to_string(),
            name: format!("Account {}", code),
            allocated_amount: amount,
        }
    }

    fn complete_data() -> CapitalCallData {
        CapitalCallData {
            fund_id: Some("F-001".into()),
            fund_name: Some("Evergreen Growth Fund III".into()),
            amount: Some(1_000_000.0),
            submit_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            posting_date: NaiveDate::from_ymd_opt(2025, 3, 15),
            gl_accounts: vec![account("4000", Some(1_000_000.0))],
            document_id: None,
            document_status: None,
        }
    }

    #[test]
    fn test_missing_fields_order() {
        let data = CapitalCallData::default();
        assert_eq!(
            data.missing_fields(),
            vec!["fund", "amount", "submit_date", "posting_date", "gl_accounts"]
        );
        assert!(!data.is_ready_for_creation());
    }

    #[test]
    fn test_ready_iff_no_missing_fields() {
        let full = complete_data();
        assert!(full.missing_fields().is_empty());
        assert!(full.is_ready_for_creation());

        let variants: Vec<Box<dyn Fn(&mut CapitalCallData)>> = vec![
            Box::new(|d| d.fund_id = None),
            Box::new(|d| d.amount = None),
            Box::new(|d| d.submit_date = None),
            Box::new(|d| d.posting_date = None),
            Box::new(|d| d.gl_accounts.clear()),
        ];

        for clear in variants {
            let mut data = complete_data();
            clear(&mut data);
            assert_eq!(data.missing_fields().len(), 1);
            assert_eq!(data.is_ready_for_creation(), data.missing_fields().is_empty());
        }
    }

    #[test]
    fn test_total_allocated() {
        let mut data = CapitalCallData::default();
        assert_eq!(data.total_allocated(), 0.0);

        data.gl_accounts = vec![
            account("4000", Some(250.0)),
            account("4100", None),
            account("4200", Some(750.5)),
        ];
        assert!((data.total_allocated() - 1000.5).abs() < AMOUNT_EPSILON);
    }

    #[test]
    fn test_remaining_commitment_not_clamped() {
        let investor = Investor {
            id: "INV-1".into(),
            name: "Northwind Pension".into(),
            commitment: 100.0,
            called_amount: 130.0,
        };
        assert_eq!(investor.remaining_commitment(), -30.0);
        assert!(investor.is_over_called());
    }

    #[test]
    fn test_decision_actionable() {
        let decision = Decision::new(Intent::ProvideData, 0.9, "amount present");
        assert!(decision.is_actionable(DEFAULT_CONFIDENCE_THRESHOLD));

        let low = Decision::new(Intent::ProvideData, 0.5, "weak");
        assert!(!low.is_actionable(DEFAULT_CONFIDENCE_THRESHOLD));

        let unclear = Decision::new(Intent::Unknown, 0.95, "no cues")
            .needing_clarification("Which fund?");
        assert!(!unclear.is_actionable(DEFAULT_CONFIDENCE_THRESHOLD));
    }

    #[test]
    fn test_status_terminal() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::AwaitingConfirmation.is_terminal());
    }
}
