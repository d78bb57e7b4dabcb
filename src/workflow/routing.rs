//! Routing between nodes
//!
//! Every function here is a pure function of the state: the same state and
//! `last_decision` always select the same next node. Extracted values only
//! count as "unapplied" when they would change the data, so a decision can
//! never send the run around the same loop twice.

use crate::audit::compute_data_hash;
use crate::models::{GLAccount, Intent, WorkflowStatus, AMOUNT_EPSILON};
use crate::state::{DataUpdate, Patch, WorkflowState};
use crate::workflow::NodeName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Next(NodeName),
    /// End the turn and hand control back to the host
    Halt,
}

/// Next node after `node` has run and its update has been merged.
pub fn route(node: NodeName, state: &WorkflowState, confidence_threshold: f32) -> Route {
    match node {
        NodeName::ParseIntent => Route::Next(after_parse_intent(state, confidence_threshold)),
        NodeName::SearchFund => {
            if state.fund_candidates.len() == 1 {
                Route::Next(NodeName::ConfirmFund)
            } else {
                Route::Next(NodeName::RequestInput)
            }
        }
        NodeName::ConfirmFund => {
            if state.data.fund_id.is_some() && state.fund_candidates.is_empty() {
                Route::Next(NodeName::LoadAccounts)
            } else {
                Route::Next(NodeName::RequestInput)
            }
        }
        NodeName::LoadAccounts => Route::Next(NodeName::LoadInvestors),
        NodeName::LoadInvestors | NodeName::CollectDetails | NodeName::SelectAccounts => {
            Route::Next(next_missing(state))
        }
        NodeName::Review => after_review(state),
        NodeName::CreateDocument => match state.data.document_id {
            Some(_) => Route::Next(NodeName::SubmitDocument),
            None => Route::Next(NodeName::HandleError),
        },
        NodeName::SubmitDocument => Route::Next(NodeName::PostDocument),
        NodeName::PostDocument => Route::Next(NodeName::Finalize),
        NodeName::Finalize
        | NodeName::RequestInput
        | NodeName::CancelWorkflow
        | NodeName::HandleError => Route::Halt,
    }
}

fn after_parse_intent(state: &WorkflowState, threshold: f32) -> NodeName {
    let Some(decision) = state.last_decision() else {
        return NodeName::RequestInput;
    };
    let actionable = decision.is_actionable(threshold);

    if decision.intent == Intent::Cancel && actionable {
        return NodeName::CancelWorkflow;
    }
    if !actionable {
        return NodeName::RequestInput;
    }

    let extraction = &decision.extraction;
    let picks_candidate = extraction
        .candidate_choice
        .is_some_and(|choice| (1..=state.fund_candidates.len()).contains(&choice));

    if state.orchestration.pending_confirmation.is_some() {
        return match decision.intent {
            Intent::Confirm | Intent::Reject => NodeName::Review,
            Intent::ModifyData | Intent::ProvideData => {
                if picks_candidate {
                    NodeName::ConfirmFund
                } else if has_unapplied_details(state) {
                    NodeName::CollectDetails
                } else if account_changes(state).is_some() {
                    NodeName::SelectAccounts
                } else if extraction.fund_query.is_some() {
                    NodeName::SearchFund
                } else {
                    NodeName::RequestInput
                }
            }
            Intent::FundLookup if extraction.fund_query.is_some() => NodeName::SearchFund,
            _ => NodeName::RequestInput,
        };
    }

    if decision.intent == Intent::FundLookup && extraction.fund_query.is_some() {
        return NodeName::SearchFund;
    }
    if picks_candidate {
        return NodeName::ConfirmFund;
    }
    if has_unapplied_details(state) {
        return NodeName::CollectDetails;
    }
    if account_changes(state).is_some() {
        return NodeName::SelectAccounts;
    }
    next_missing(state)
}

fn after_review(state: &WorkflowState) -> Route {
    let orchestration = &state.orchestration;
    if orchestration.status != WorkflowStatus::InProgress
        || orchestration.pending_confirmation.is_some()
    {
        return Route::Halt;
    }
    match &orchestration.approved_data_hash {
        Some(hash) if *hash == compute_data_hash(&state.data) => {
            Route::Next(NodeName::CreateDocument)
        }
        _ => Route::Halt,
    }
}

/// Step that fills the next gap in the data, or `review` once it is ready.
pub fn next_missing(state: &WorkflowState) -> NodeName {
    if has_unapplied_details(state) {
        NodeName::CollectDetails
    } else if account_changes(state).is_some() {
        NodeName::SelectAccounts
    } else if state.data.is_ready_for_creation() {
        NodeName::Review
    } else {
        NodeName::RequestInput
    }
}

pub fn has_unapplied_details(state: &WorkflowState) -> bool {
    !detail_changes(state).is_empty()
}

/// Amount and date values in the latest decision that differ from the data.
pub fn detail_changes(state: &WorkflowState) -> DataUpdate {
    let mut update = DataUpdate::default();
    let Some(decision) = state.last_decision() else {
        return update;
    };
    let extraction = &decision.extraction;
    let data = &state.data;

    if let Some(amount) = extraction.amount.filter(|a| *a > 0.0) {
        let unchanged = data
            .amount
            .map(|current| (current - amount).abs() < AMOUNT_EPSILON)
            .unwrap_or(false);
        if !unchanged {
            update.amount = Patch::Set(amount);
        }
    }
    if let Some(date) = extraction.submit_date {
        if data.submit_date != Some(date) {
            update.submit_date = Patch::Set(date);
        }
    }
    if let Some(date) = extraction.posting_date {
        if data.posting_date != Some(date) {
            update.posting_date = Patch::Set(date);
        }
    }
    update
}

/// Accounts the latest decision selects, when they differ from the data.
///
/// Codes that do not exist for the fund are ignored. A single selected
/// account without an explicit amount carries the whole call amount.
pub fn account_changes(state: &WorkflowState) -> Option<Vec<GLAccount>> {
    let decision = state.last_decision()?;
    let selections = &decision.extraction.account_selections;

    let call_amount = decision
        .extraction
        .amount
        .filter(|a| *a > 0.0)
        .or(state.data.amount);
    let single = selections.len() == 1;

    let resolved: Vec<GLAccount> = selections
        .iter()
        .filter_map(|selection| {
            let account = state
                .available_accounts
                .iter()
                .find(|a| a.code.eq_ignore_ascii_case(selection.code.trim()))?;
            Some(GLAccount {
                code: account.code.clone(),
                name: account.name.clone(),
                allocated_amount: selection
                    .amount
                    .or(if single { call_amount } else { None }),
            })
        })
        .collect();

    if resolved.is_empty() || resolved == state.data.gl_accounts {
        None
    } else {
        Some(resolved)
    }
}

/// Selected codes the fund does not have.
pub fn unknown_account_codes(state: &WorkflowState) -> Vec<String> {
    let Some(decision) = state.last_decision() else {
        return Vec::new();
    };
    decision
        .extraction
        .account_selections
        .iter()
        .filter(|s| {
            !state
                .available_accounts
                .iter()
                .any(|a| a.code.eq_ignore_ascii_case(s.code.trim()))
        })
        .map(|s| s.code.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccountSelection, Decision, Extraction, Fund, PendingConfirmation, ScoredCandidate,
        UserContext, DEFAULT_CONFIDENCE_THRESHOLD,
    };
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    const T: f32 = DEFAULT_CONFIDENCE_THRESHOLD;

    fn state() -> WorkflowState {
        WorkflowState::new("t-1", UserContext::new("u-1", "Jordan"))
    }

    fn with_decision(mut s: WorkflowState, intent: Intent, extraction: Extraction) -> WorkflowState {
        s.conversation.last_decision =
            Some(Decision::new(intent, 0.9, "test").with_extraction(extraction));
        s
    }

    fn account(code: &str) -> GLAccount {
        GLAccount {
            code: code.into(),
            name: format!("Account {}", code),
            allocated_amount: None,
        }
    }

    fn candidate(id: &str, name: &str) -> ScoredCandidate<Fund> {
        ScoredCandidate {
            item: Fund {
                id: id.into(),
                name: name.into(),
                currency_code: "USD".into(),
            },
            score: 0.9,
            match_reason: None,
        }
    }

    fn ready(mut s: WorkflowState) -> WorkflowState {
        s.data.fund_id = Some("EGF3".into());
        s.data.fund_name = Some("Evergreen Growth Fund III".into());
        s.data.amount = Some(1_000.0);
        s.data.submit_date = NaiveDate::from_ymd_opt(2025, 3, 1);
        s.data.posting_date = NaiveDate::from_ymd_opt(2025, 3, 15);
        s.data.gl_accounts = vec![GLAccount {
            allocated_amount: Some(1_000.0),
            ..account("4000")
        }];
        s
    }

    fn pending() -> PendingConfirmation {
        PendingConfirmation {
            suspension_id: Uuid::new_v4(),
            summary: "summary".into(),
            data_hash: "hash".into(),
            warnings: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_intent_routes() {
        let lookup = with_decision(
            state(),
            Intent::FundLookup,
            Extraction {
                fund_query: Some("Evergreen".into()),
                ..Default::default()
            },
        );
        assert_eq!(route(NodeName::ParseIntent, &lookup, T), Route::Next(NodeName::SearchFund));

        let cancel = with_decision(state(), Intent::Cancel, Extraction::default());
        assert_eq!(route(NodeName::ParseIntent, &cancel, T), Route::Next(NodeName::CancelWorkflow));

        let details = with_decision(
            state(),
            Intent::ProvideData,
            Extraction {
                amount: Some(500.0),
                ..Default::default()
            },
        );
        assert_eq!(route(NodeName::ParseIntent, &details, T), Route::Next(NodeName::CollectDetails));

        let mut vague = state();
        vague.conversation.last_decision = Some(Decision::new(Intent::Unknown, 0.3, "no cue"));
        assert_eq!(route(NodeName::ParseIntent, &vague, T), Route::Next(NodeName::RequestInput));
    }

    #[test]
    fn test_candidate_choice_requires_listed_candidates() {
        let choice = Extraction {
            candidate_choice: Some(2),
            ..Default::default()
        };

        let mut listed = with_decision(state(), Intent::ProvideData, choice.clone());
        listed.fund_candidates = vec![candidate("A", "Alpha Fund"), candidate("B", "Beta Fund")];
        assert_eq!(route(NodeName::ParseIntent, &listed, T), Route::Next(NodeName::ConfirmFund));

        let unlisted = with_decision(state(), Intent::ProvideData, choice);
        assert_eq!(route(NodeName::ParseIntent, &unlisted, T), Route::Next(NodeName::RequestInput));
    }

    #[test]
    fn test_pending_confirmation_routes() {
        let mut s = ready(state());
        s.orchestration.pending_confirmation = Some(pending());
        s.orchestration.status = WorkflowStatus::AwaitingConfirmation;

        let confirm = with_decision(s.clone(), Intent::Confirm, Extraction::default());
        assert_eq!(route(NodeName::ParseIntent, &confirm, T), Route::Next(NodeName::Review));

        let modify = with_decision(
            s.clone(),
            Intent::ModifyData,
            Extraction {
                amount: Some(2_000.0),
                ..Default::default()
            },
        );
        assert_eq!(route(NodeName::ParseIntent, &modify, T), Route::Next(NodeName::CollectDetails));

        let same_amount = with_decision(
            s,
            Intent::ModifyData,
            Extraction {
                amount: Some(1_000.0),
                ..Default::default()
            },
        );
        assert_eq!(
            route(NodeName::ParseIntent, &same_amount, T),
            Route::Next(NodeName::RequestInput)
        );
    }

    #[test]
    fn test_candidate_choice_while_pending_switches_fund() {
        let mut s = ready(state());
        s.orchestration.pending_confirmation = Some(pending());
        s.orchestration.status = WorkflowStatus::AwaitingConfirmation;
        s.fund_candidates = vec![
            candidate("EGF3", "Evergreen Growth Fund III"),
            candidate("EIF1", "Evergreen Income Fund"),
        ];

        let pick = with_decision(
            s.clone(),
            Intent::ProvideData,
            Extraction {
                candidate_choice: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(route(NodeName::ParseIntent, &pick, T), Route::Next(NodeName::ConfirmFund));

        let out_of_range = with_decision(
            s,
            Intent::ProvideData,
            Extraction {
                candidate_choice: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(
            route(NodeName::ParseIntent, &out_of_range, T),
            Route::Next(NodeName::RequestInput)
        );
    }

    #[test]
    fn test_next_missing_order() {
        let mut s = with_decision(
            state(),
            Intent::ProvideData,
            Extraction {
                account_selections: vec![AccountSelection {
                    code: "4000".into(),
                    amount: None,
                }],
                ..Default::default()
            },
        );
        assert_eq!(next_missing(&s), NodeName::RequestInput);

        s.available_accounts = vec![account("4000"), account("4100")];
        assert_eq!(next_missing(&s), NodeName::SelectAccounts);

        let resolved = account_changes(&s).unwrap();
        s.data.gl_accounts = resolved;
        assert!(account_changes(&s).is_none());
        assert_eq!(next_missing(&s), NodeName::RequestInput);

        let done = ready(state());
        assert_eq!(next_missing(&done), NodeName::Review);
    }

    #[test]
    fn test_single_selection_takes_call_amount() {
        let mut s = with_decision(
            state(),
            Intent::ProvideData,
            Extraction {
                amount: Some(750.0),
                account_selections: vec![AccountSelection {
                    code: "4100".into(),
                    amount: None,
                }],
                ..Default::default()
            },
        );
        s.available_accounts = vec![account("4000"), account("4100")];

        let accounts = account_changes(&s).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].allocated_amount, Some(750.0));
        assert_eq!(accounts[0].name, "Account 4100");
    }

    #[test]
    fn test_search_and_chain_routes() {
        let mut s = state();
        s.fund_candidates = vec![candidate("A", "Alpha Fund")];
        assert_eq!(route(NodeName::SearchFund, &s, T), Route::Next(NodeName::ConfirmFund));

        s.fund_candidates.push(candidate("B", "Beta Fund"));
        assert_eq!(route(NodeName::SearchFund, &s, T), Route::Next(NodeName::RequestInput));

        s.fund_candidates.clear();
        s.data.fund_id = Some("A".into());
        assert_eq!(route(NodeName::ConfirmFund, &s, T), Route::Next(NodeName::LoadAccounts));
        assert_eq!(route(NodeName::LoadAccounts, &s, T), Route::Next(NodeName::LoadInvestors));
        assert_eq!(route(NodeName::PostDocument, &s, T), Route::Next(NodeName::Finalize));
        assert_eq!(route(NodeName::Finalize, &s, T), Route::Halt);
    }

    #[test]
    fn test_review_routes_only_on_matching_approval() {
        let mut s = ready(state());
        s.orchestration.status = WorkflowStatus::AwaitingConfirmation;
        s.orchestration.pending_confirmation = Some(pending());
        assert_eq!(route(NodeName::Review, &s, T), Route::Halt);

        s.orchestration.status = WorkflowStatus::InProgress;
        s.orchestration.pending_confirmation = None;
        s.orchestration.approved_data_hash = Some(compute_data_hash(&s.data));
        assert_eq!(route(NodeName::Review, &s, T), Route::Next(NodeName::CreateDocument));

        s.data.amount = Some(9_999.0);
        assert_eq!(route(NodeName::Review, &s, T), Route::Halt);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let s = with_decision(
            ready(state()),
            Intent::ProvideData,
            Extraction {
                posting_date: NaiveDate::from_ymd_opt(2025, 4, 1),
                ..Default::default()
            },
        );
        let first = route(NodeName::ParseIntent, &s, T);
        for _ in 0..10 {
            assert_eq!(route(NodeName::ParseIntent, &s, T), first);
        }
    }
}
