//! Workflow nodes
//!
//! Each node reads the state and returns a partial update. Service errors
//! are returned as-is; the execution engine turns them into failures that
//! route to `handle_error`.

use crate::audit::compute_data_hash;
use crate::error::WorkflowError;
use crate::memory::ConversationMessage;
use crate::models::{
    CapitalCallData, Decision, DocumentStatus, GLAccount, Intent, PendingConfirmation,
    ResumeDecision, WorkflowStatus, AMOUNT_EPSILON, PERMISSION_CREATE_CAPITAL_CALL,
};
use crate::services::{SearchHit, SearchResults};
use crate::state::{DataUpdate, Patch, StateUpdate, WorkflowState};
use crate::verification::{format_amount, ValidationContext};
use crate::workflow::routing::{account_changes, detail_changes, unknown_account_codes};
use crate::workflow::{Node, NodeDeps, NodeInput, NodeName, NodeOutput};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn reply(node: NodeName, content: impl Into<String>) -> ConversationMessage {
    ConversationMessage::agent(content, node.as_str())
}

fn field_label(field: &str) -> &'static str {
    match field {
        "fund" => "the fund",
        "amount" => "the call amount",
        "submit_date" => "the submit date",
        "posting_date" => "the posting date",
        "gl_accounts" => "the GL account(s) to allocate to",
        _ => "more details",
    }
}

fn missing_sentence(missing: &[&str]) -> String {
    let labels: Vec<&str> = missing.iter().map(|f| field_label(f)).collect();
    format!("To prepare the capital call I still need {}.", labels.join(", "))
}

fn require_fund_id(state: &WorkflowState) -> Result<&str> {
    state
        .data
        .fund_id
        .as_deref()
        .ok_or_else(|| WorkflowError::NodeError("no fund has been confirmed".to_string()))
}

fn require_document_id(state: &WorkflowState) -> Result<&str> {
    state
        .data
        .document_id
        .as_deref()
        .ok_or_else(|| WorkflowError::NodeError("no document has been created".to_string()))
}

//
// ================= Intake =================
//

pub struct ParseIntentNode;

#[async_trait]
impl Node for ParseIntentNode {
    fn name(&self) -> NodeName {
        NodeName::ParseIntent
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let Some(message) = state.conversation.history.last_user_message() else {
            let decision = Decision::new(Intent::Unknown, 0.0, "no user message")
                .needing_clarification("What would you like to do?");
            return Ok(NodeOutput::update(StateUpdate::new().decision(decision)));
        };

        let decision = deps.interpreter.interpret(state, &message.content).await?;
        info!(
            thread_id = %state.thread_id(),
            interpreter = deps.interpreter.name(),
            intent = ?decision.intent,
            confidence = decision.confidence,
            "Message interpreted"
        );

        Ok(NodeOutput::update(StateUpdate::new().decision(decision)))
    }
}

pub struct SearchFundNode;

#[async_trait]
impl Node for SearchFundNode {
    fn name(&self) -> NodeName {
        NodeName::SearchFund
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let query = state
            .last_decision()
            .and_then(|d| d.extraction.fund_query.clone())
            .ok_or_else(|| WorkflowError::NodeError("no fund query to search for".to_string()))?;

        let hits = deps.services.search_funds(&query).await?;
        let results = SearchResults::new(
            hits.into_iter()
                .map(|c| SearchHit { score: c.score, item: c })
                .collect(),
        );

        // A clear winner stands alone; otherwise offer the close matches.
        let candidates: Vec<_> = match results.super_match() {
            Some(hit) => vec![hit.item.clone()],
            None => results
                .candidates()
                .into_iter()
                .map(|h| h.item.clone())
                .collect(),
        };

        debug!(
            thread_id = %state.thread_id(),
            query = %query,
            total = results.len(),
            offered = candidates.len(),
            "Fund search completed"
        );

        let mut update = StateUpdate::new().status(WorkflowStatus::InProgress);
        if candidates.is_empty() {
            update = update.message(reply(
                NodeName::SearchFund,
                format!("I couldn't find a fund matching '{}'.", query),
            ));
        }
        Ok(NodeOutput::update(update.fund_candidates(candidates)))
    }
}

pub struct ConfirmFundNode;

#[async_trait]
impl Node for ConfirmFundNode {
    fn name(&self) -> NodeName {
        NodeName::ConfirmFund
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, _deps: &NodeDeps) -> Result<NodeOutput> {
        let candidates = &state.fund_candidates;
        let picked = if candidates.len() == 1 {
            candidates.first()
        } else {
            state
                .last_decision()
                .and_then(|d| d.extraction.candidate_choice)
                .and_then(|c| c.checked_sub(1))
                .and_then(|i| candidates.get(i))
        };
        let fund = picked
            .map(|c| c.item.clone())
            .ok_or_else(|| WorkflowError::NodeError("no fund candidate selected".to_string()))?;

        let changed = state.data.fund_id.as_deref().is_some_and(|id| id != fund.id);

        let mut data = DataUpdate {
            fund_id: Patch::Set(fund.id.clone()),
            fund_name: Patch::Set(fund.name.clone()),
            ..Default::default()
        };
        let mut update = StateUpdate::new();
        if changed {
            // Accounts belong to the previous fund.
            data.gl_accounts = Some(Vec::new());
            update = update.clear_pending();
            update.approved_data_hash = Patch::Clear;
        }

        info!(thread_id = %state.thread_id(), fund_id = %fund.id, changed, "Fund confirmed");

        Ok(NodeOutput::update(
            update
                .status(WorkflowStatus::InProgress)
                .data(data)
                .fund_candidates(Vec::new())
                .message(reply(
                    NodeName::ConfirmFund,
                    format!("Using fund {} ({}).", fund.name, fund.id),
                )),
        ))
    }
}

pub struct CollectDetailsNode;

#[async_trait]
impl Node for CollectDetailsNode {
    fn name(&self) -> NodeName {
        NodeName::CollectDetails
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, _deps: &NodeDeps) -> Result<NodeOutput> {
        let mut data = detail_changes(state);
        let mut changes = Vec::new();

        if let Patch::Set(amount) = &data.amount {
            changes.push(format!("amount {}", format_amount(*amount)));

            // A lone account tracks the call amount unless it was split by hand.
            if let [account] = state.data.gl_accounts.as_slice() {
                let follows_amount = match (account.allocated_amount, state.data.amount) {
                    (None, _) => true,
                    (Some(allocated), Some(previous)) => (allocated - previous).abs() < AMOUNT_EPSILON,
                    (Some(_), None) => false,
                };
                if follows_amount {
                    data.gl_accounts = Some(vec![GLAccount {
                        allocated_amount: Some(*amount),
                        ..account.clone()
                    }]);
                }
            }
        }
        if let Patch::Set(date) = &data.submit_date {
            changes.push(format!("submit date {}", date));
        }
        if let Patch::Set(date) = &data.posting_date {
            changes.push(format!("posting date {}", date));
        }

        let update = StateUpdate::new().status(WorkflowStatus::InProgress);
        if changes.is_empty() {
            return Ok(NodeOutput::update(update));
        }

        Ok(NodeOutput::update(
            update
                .message(reply(
                    NodeName::CollectDetails,
                    format!("Noted {}.", changes.join(", ")),
                ))
                .data(data),
        ))
    }
}

//
// ================= Reference Data =================
//

pub struct LoadAccountsNode;

#[async_trait]
impl Node for LoadAccountsNode {
    fn name(&self) -> NodeName {
        NodeName::LoadAccounts
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let fund_id = require_fund_id(state)?;
        let accounts = deps.services.get_gl_accounts(fund_id).await?;
        debug!(thread_id = %state.thread_id(), fund_id, count = accounts.len(), "GL accounts loaded");
        Ok(NodeOutput::update(StateUpdate::new().available_accounts(accounts)))
    }
}

pub struct SelectAccountsNode;

#[async_trait]
impl Node for SelectAccountsNode {
    fn name(&self) -> NodeName {
        NodeName::SelectAccounts
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, _deps: &NodeDeps) -> Result<NodeOutput> {
        let accounts = account_changes(state)
            .ok_or_else(|| WorkflowError::NodeError("no applicable account selection".to_string()))?;

        let listed: Vec<String> = accounts
            .iter()
            .map(|a| match a.allocated_amount {
                Some(amount) => format!("{} {} ({})", a.code, a.name, format_amount(amount)),
                None => format!("{} {}", a.code, a.name),
            })
            .collect();
        let mut text = format!("Selected GL accounts: {}.", listed.join("; "));

        let unknown = unknown_account_codes(state);
        if !unknown.is_empty() {
            text.push_str(&format!(
                " Ignored unknown account codes: {}.",
                unknown.join(", ")
            ));
        }

        Ok(NodeOutput::update(
            StateUpdate::new()
                .status(WorkflowStatus::InProgress)
                .data(DataUpdate {
                    gl_accounts: Some(accounts),
                    ..Default::default()
                })
                .message(reply(NodeName::SelectAccounts, text)),
        ))
    }
}

pub struct LoadInvestorsNode;

#[async_trait]
impl Node for LoadInvestorsNode {
    fn name(&self) -> NodeName {
        NodeName::LoadInvestors
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let fund_id = require_fund_id(state)?;
        let investors = deps.services.get_investors(fund_id).await?;
        debug!(thread_id = %state.thread_id(), fund_id, count = investors.len(), "Investors loaded");
        Ok(NodeOutput::update(StateUpdate::new().investors(investors)))
    }
}

//
// ================= Confirmation =================
//

pub struct ReviewNode;

impl ReviewNode {
    /// Decision carried by the latest message while a summary is pending.
    fn message_decision(state: &WorkflowState) -> Option<ResumeDecision> {
        match state.last_decision()?.intent {
            Intent::Confirm => Some(ResumeDecision::approve()),
            Intent::Reject => Some(ResumeDecision::reject()),
            _ => None,
        }
    }

    fn approve(pending: &PendingConfirmation) -> NodeOutput {
        let mut update = StateUpdate::new()
            .clear_pending()
            .status(WorkflowStatus::InProgress)
            .message(reply(
                NodeName::Review,
                "Approved. Creating the capital call document.",
            ));
        update.approved_data_hash = Patch::Set(pending.data_hash.clone());
        NodeOutput::update(update)
    }

    fn reject(decision: &ResumeDecision) -> NodeOutput {
        let mut text = "Okay, I won't create the document. Tell me what you'd like to change.".to_string();
        if let Some(comment) = decision.comment.as_deref().filter(|c| !c.trim().is_empty()) {
            text.push_str(&format!(" (Reviewer note: {})", comment.trim()));
        }
        let mut update = StateUpdate::new()
            .clear_pending()
            .status(WorkflowStatus::AwaitingInput)
            .message(reply(NodeName::Review, text));
        update.approved_data_hash = Patch::Clear;
        NodeOutput::update(update)
    }

    fn not_ready(text: String) -> NodeOutput {
        let mut update = StateUpdate::new()
            .clear_pending()
            .status(WorkflowStatus::AwaitingInput)
            .message(reply(NodeName::Review, text));
        update.approved_data_hash = Patch::Clear;
        NodeOutput::update(update)
    }
}

#[async_trait]
impl Node for ReviewNode {
    fn name(&self) -> NodeName {
        NodeName::Review
    }

    async fn run(&self, state: &WorkflowState, input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let pending = state.orchestration.pending_confirmation.as_ref();
        let decision = input.resume.clone().or_else(|| Self::message_decision(state));

        if let (Some(pending), Some(decision)) = (pending, decision) {
            if compute_data_hash(&state.data) == pending.data_hash {
                info!(
                    thread_id = %state.thread_id(),
                    suspension_id = %pending.suspension_id,
                    approved = decision.approved,
                    "Confirmation resolved"
                );
                return Ok(if decision.approved {
                    Self::approve(pending)
                } else {
                    Self::reject(&decision)
                });
            }
            warn!(thread_id = %state.thread_id(), "Data changed since the summary, rebuilding");
        }

        let missing = state.data.missing_fields();
        if !missing.is_empty() {
            return Ok(Self::not_ready(missing_sentence(&missing)));
        }

        let report = deps.validator.validate(&ValidationContext {
            data: &state.data,
            investors: &state.investors,
        });
        if !report.passed() {
            let problems: Vec<String> = report.blocking().iter().map(|m| format!("- {}", m)).collect();
            return Ok(Self::not_ready(format!(
                "I can't prepare the capital call yet:\n{}",
                problems.join("\n")
            )));
        }

        let warnings: Vec<String> = report.warnings().into_iter().map(str::to_string).collect();
        let summary = build_summary(&state.data, &warnings);
        let pending = PendingConfirmation {
            suspension_id: Uuid::new_v4(),
            summary: summary.clone(),
            data_hash: compute_data_hash(&state.data),
            warnings,
            created_at: Utc::now(),
        };

        info!(
            thread_id = %state.thread_id(),
            suspension_id = %pending.suspension_id,
            "Awaiting confirmation"
        );

        let mut update = StateUpdate::new()
            .pending(pending)
            .status(WorkflowStatus::AwaitingConfirmation)
            .message(reply(NodeName::Review, summary));
        update.approved_data_hash = Patch::Clear;
        Ok(NodeOutput::interrupt(update))
    }
}

/// Human-readable summary of the document about to be created.
pub fn build_summary(data: &CapitalCallData, warnings: &[String]) -> String {
    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());

    let mut lines = vec![
        "Please review the capital call:".to_string(),
        format!(
            "Fund: {} ({})",
            or_dash(data.fund_name.clone()),
            or_dash(data.fund_id.clone())
        ),
        format!("Amount: {}", or_dash(data.amount.map(format_amount))),
        format!("Submit date: {}", or_dash(data.submit_date.map(|d| d.to_string()))),
        format!("Posting date: {}", or_dash(data.posting_date.map(|d| d.to_string()))),
        "GL accounts:".to_string(),
    ];
    for account in &data.gl_accounts {
        let allocation = account
            .allocated_amount
            .map(format_amount)
            .unwrap_or_else(|| "unallocated".to_string());
        lines.push(format!("  - {} {}: {}", account.code, account.name, allocation));
    }
    if !warnings.is_empty() {
        lines.push("Warnings:".to_string());
        lines.extend(warnings.iter().map(|w| format!("  - {}", w)));
    }
    lines.push("Reply 'confirm' to create the document or 'reject' to make changes.".to_string());
    lines.join("\n")
}

//
// ================= Document Lifecycle =================
//

pub struct CreateDocumentNode;

#[async_trait]
impl Node for CreateDocumentNode {
    fn name(&self) -> NodeName {
        NodeName::CreateDocument
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let user = &state.context.user;
        if !user.can(PERMISSION_CREATE_CAPITAL_CALL) {
            return Err(WorkflowError::PermissionDenied(format!(
                "user {} lacks {}",
                user.user_id, PERMISSION_CREATE_CAPITAL_CALL
            )));
        }

        let missing = state.data.missing_fields();
        if !missing.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let hash = compute_data_hash(&state.data);
        if state.orchestration.approved_data_hash.as_deref() != Some(hash.as_str()) {
            return Err(WorkflowError::ValidationError(
                "data differs from what was approved".to_string(),
            ));
        }

        let report = deps.validator.validate(&ValidationContext {
            data: &state.data,
            investors: &state.investors,
        });
        if !report.passed() {
            return Err(WorkflowError::ValidationError(report.blocking().join("; ")));
        }

        let document_id = deps.services.create_document(&state.data).await?;
        info!(thread_id = %state.thread_id(), document_id = %document_id, "Document created");

        Ok(NodeOutput::update(
            StateUpdate::new()
                .data(DataUpdate {
                    document_id: Patch::Set(document_id.clone()),
                    document_status: Patch::Set(DocumentStatus::Created),
                    ..Default::default()
                })
                .message(reply(
                    NodeName::CreateDocument,
                    format!("Created document {}.", document_id),
                )),
        ))
    }
}

pub struct SubmitDocumentNode;

#[async_trait]
impl Node for SubmitDocumentNode {
    fn name(&self) -> NodeName {
        NodeName::SubmitDocument
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let document_id = require_document_id(state)?;
        if !deps.services.submit_document(document_id).await? {
            return Err(WorkflowError::ServiceError(format!(
                "submission of {} was not accepted",
                document_id
            )));
        }
        Ok(NodeOutput::update(StateUpdate::new().data(DataUpdate {
            document_status: Patch::Set(DocumentStatus::Submitted),
            ..Default::default()
        })))
    }
}

pub struct PostDocumentNode;

#[async_trait]
impl Node for PostDocumentNode {
    fn name(&self) -> NodeName {
        NodeName::PostDocument
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let document_id = require_document_id(state)?;
        if !deps.services.post_document(document_id).await? {
            return Err(WorkflowError::ServiceError(format!(
                "posting of {} was not accepted",
                document_id
            )));
        }
        Ok(NodeOutput::update(StateUpdate::new().data(DataUpdate {
            document_status: Patch::Set(DocumentStatus::Posted),
            ..Default::default()
        })))
    }
}

pub struct FinalizeNode;

#[async_trait]
impl Node for FinalizeNode {
    fn name(&self) -> NodeName {
        NodeName::Finalize
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, _deps: &NodeDeps) -> Result<NodeOutput> {
        let data = &state.data;
        let text = format!(
            "Capital call {} for {} ({}) has been created, submitted and posted.",
            data.document_id.as_deref().unwrap_or("-"),
            data.fund_name.as_deref().unwrap_or("-"),
            data.amount.map(format_amount).unwrap_or_default()
        );
        info!(thread_id = %state.thread_id(), "Workflow completed");
        Ok(NodeOutput::update(
            StateUpdate::new()
                .status(WorkflowStatus::Completed)
                .message(reply(NodeName::Finalize, text)),
        ))
    }
}

//
// ================= Control =================
//

pub struct HandleErrorNode;

#[async_trait]
impl Node for HandleErrorNode {
    fn name(&self) -> NodeName {
        NodeName::HandleError
    }

    async fn run(&self, state: &WorkflowState, input: &NodeInput, _deps: &NodeDeps) -> Result<NodeOutput> {
        let error = match &input.failure {
            Some(failure) => format!("{} failed: {}", failure.node, failure.message),
            None => state
                .orchestration
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        };

        warn!(thread_id = %state.thread_id(), error = %error, "Workflow failed");

        let mut text = format!("Something went wrong: {}. The workflow has stopped.", error);
        if let Some(document_id) = &state.data.document_id {
            text.push_str(&format!(" Document {} was already created.", document_id));
        }

        Ok(NodeOutput::update(
            StateUpdate::new()
                .status(WorkflowStatus::Failed)
                .error(error)
                .clear_pending()
                .message(reply(NodeName::HandleError, text)),
        ))
    }
}

fn candidate_lines(state: &WorkflowState) -> impl Iterator<Item = String> + '_ {
    state
        .fund_candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {} ({})", i + 1, c.item.name, c.item.id))
}

pub struct RequestInputNode;

#[async_trait]
impl Node for RequestInputNode {
    fn name(&self) -> NodeName {
        NodeName::RequestInput
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, deps: &NodeDeps) -> Result<NodeOutput> {
        let mut lines = Vec::new();

        if let Some(decision) = state.last_decision() {
            if !decision.is_actionable(deps.config.confidence_threshold) {
                match &decision.clarification_prompt {
                    Some(prompt) => lines.push(prompt.clone()),
                    None => lines.push("Sorry, I didn't quite follow that.".to_string()),
                }
            }
        }

        let status = if state.orchestration.pending_confirmation.is_some() {
            if state.fund_candidates.len() > 1 {
                lines.push("I found several matching funds:".to_string());
                lines.extend(candidate_lines(state));
                lines.push(
                    "Reply with a number to switch to that fund, or 'confirm' to keep the summary above."
                        .to_string(),
                );
            } else if lines.is_empty() {
                lines.push(
                    "The summary above is waiting for your decision: reply 'confirm' to create the document or 'reject' to make changes."
                        .to_string(),
                );
            }
            WorkflowStatus::AwaitingConfirmation
        } else {
            if state.fund_candidates.len() > 1 {
                lines.push("I found several matching funds. Which one did you mean?".to_string());
                lines.extend(candidate_lines(state));
            } else {
                let unknown = unknown_account_codes(state);
                if !unknown.is_empty() && state.data.fund_id.is_some() {
                    lines.push(format!(
                        "This fund has no GL account {}.",
                        unknown.join(", ")
                    ));
                }

                let missing = state.data.missing_fields();
                if missing.is_empty() {
                    lines.push("I have everything I need. Reply 'confirm' to see the summary.".to_string());
                } else {
                    lines.push(missing_sentence(&missing));
                    if state.data.fund_id.is_some()
                        && state.data.gl_accounts.is_empty()
                        && !state.available_accounts.is_empty()
                    {
                        let accounts: Vec<String> = state
                            .available_accounts
                            .iter()
                            .map(|a| format!("{} {}", a.code, a.name))
                            .collect();
                        lines.push(format!("Available GL accounts: {}.", accounts.join(", ")));
                    }
                }
            }
            WorkflowStatus::AwaitingInput
        };

        Ok(NodeOutput::update(
            StateUpdate::new()
                .status(status)
                .message(reply(NodeName::RequestInput, lines.join("\n"))),
        ))
    }
}

pub struct CancelWorkflowNode;

#[async_trait]
impl Node for CancelWorkflowNode {
    fn name(&self) -> NodeName {
        NodeName::CancelWorkflow
    }

    async fn run(&self, state: &WorkflowState, _input: &NodeInput, _deps: &NodeDeps) -> Result<NodeOutput> {
        info!(thread_id = %state.thread_id(), "Workflow cancelled");
        let mut update = StateUpdate::new()
            .status(WorkflowStatus::Cancelled)
            .clear_pending()
            .message(reply(
                NodeName::CancelWorkflow,
                "Cancelled. No capital call document was created.",
            ));
        update.approved_data_hash = Patch::Clear;
        Ok(NodeOutput::update(update))
    }
}
