//! Orchestrator - the runtime loop
//!
//! SELECT NODE → EXECUTE → MERGE → CHECKPOINT → ROUTE → (continue | suspend | halt)
//!
//! One turn runs under a per-thread lock. Every step is checkpointed, so a
//! suspended thread survives a process restart and resumes from its last
//! checkpoint.

use crate::audit::{build_trail, StepRecord};
use crate::config::{AppConfig, WorkflowConfig};
use crate::error::WorkflowError;
use crate::execution::{ExecutionEngine, StepOutcome};
use crate::interpreter::{build_interpreter, MessageInterpreter};
use crate::memory::ConversationMessage;
use crate::models::{ResumeDecision, UserContext, WorkflowStatus};
use crate::services::{build_accounting_service, AccountingService};
use crate::state::{
    build_checkpoint_store, Checkpoint, CheckpointStore, StateUpdate, WorkflowSnapshot,
    WorkflowState,
};
use crate::verification::create_default_validation_engine;
use crate::workflow::{build_default_registry, route, NodeDeps, NodeFailure, NodeInput, NodeName, Route};
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    engine: ExecutionEngine,
    store: Arc<dyn CheckpointStore>,
    config: WorkflowConfig,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        services: Arc<dyn AccountingService>,
        interpreter: Arc<dyn MessageInterpreter>,
        store: Arc<dyn CheckpointStore>,
        config: WorkflowConfig,
    ) -> Self {
        let deps = NodeDeps {
            services,
            interpreter,
            validator: Arc::new(create_default_validation_engine(config.allocation_policy)),
            config: config.clone(),
        };

        Self {
            engine: ExecutionEngine::new(build_default_registry(), deps),
            store,
            config,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    /// HTTP accounting service, configured interpreter and checkpoint backend.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            build_accounting_service(config)?,
            build_interpreter(config.gemini_api_key.as_deref()),
            build_checkpoint_store(config.database_url.as_deref()),
            config.workflow.clone(),
        ))
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    //
    // ================= Host Operations =================
    //

    pub async fn start_thread(
        &self,
        thread_id: Option<String>,
        user: UserContext,
    ) -> Result<WorkflowSnapshot> {
        let thread_id = thread_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.with_thread_lock(&thread_id, self.start_locked(&thread_id, user))
            .await
    }

    pub async fn send_message(&self, thread_id: &str, text: &str) -> Result<WorkflowSnapshot> {
        if text.trim().is_empty() {
            return Err(WorkflowError::ValidationError("message is empty".to_string()));
        }

        self.with_thread_lock(thread_id, self.send_locked(thread_id, text.trim()))
            .await
    }

    /// Re-enter the suspended node with the host's decision.
    pub async fn resume(&self, thread_id: &str, decision: ResumeDecision) -> Result<WorkflowSnapshot> {
        self.with_thread_lock(thread_id, self.resume_locked(thread_id, decision))
            .await
    }

    pub async fn snapshot(&self, thread_id: &str) -> Result<WorkflowSnapshot> {
        let state = self.load(thread_id).await?;
        Ok(state.to_snapshot(Vec::new()))
    }

    /// Audit trail of every checkpointed step.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<StepRecord>> {
        let checkpoints = self.store.list(thread_id).await?;
        if checkpoints.is_empty() {
            return Err(WorkflowError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(build_trail(&checkpoints))
    }

    async fn start_locked(&self, thread_id: &str, user: UserContext) -> Result<WorkflowSnapshot> {
        if self.store.latest(thread_id).await?.is_some() {
            return Err(WorkflowError::ThreadExists(thread_id.to_string()));
        }

        let greeting = format!(
            "Hi {}, let's prepare a capital call. Which fund is it for?",
            user.display_name
        );
        let mut state = WorkflowState::new(thread_id, user);
        state.apply(StateUpdate::new().message(ConversationMessage::agent(greeting.clone(), "start")));

        self.store.save(&Checkpoint::new(None, state.clone())).await?;
        info!(thread_id, user_id = %state.context.user.user_id, "Thread started");

        Ok(state.to_snapshot(vec![greeting]))
    }

    async fn send_locked(&self, thread_id: &str, text: &str) -> Result<WorkflowSnapshot> {
        let mut state = self.load_open(thread_id).await?;
        let position = state.conversation.history.message_count();
        state.apply(StateUpdate::new().message(ConversationMessage::user(text)));

        let state = self
            .run_turn(state, NodeName::ParseIntent, NodeInput::default())
            .await?;
        Ok(state.to_snapshot(state.conversation.history.agent_replies_since(position)))
    }

    async fn resume_locked(&self, thread_id: &str, decision: ResumeDecision) -> Result<WorkflowSnapshot> {
        let state = self.load_open(thread_id).await?;
        let pending = match (&state.orchestration.pending_confirmation, state.is_suspended()) {
            (Some(pending), true) => pending,
            _ => return Err(WorkflowError::NotSuspended(thread_id.to_string())),
        };
        if let Some(received) = decision.suspension_id {
            if received != pending.suspension_id {
                return Err(WorkflowError::StaleResume {
                    expected: pending.suspension_id.to_string(),
                    received: received.to_string(),
                });
            }
        }

        info!(thread_id, approved = decision.approved, "Resuming thread");

        let node = state.orchestration.suspended_at.unwrap_or(NodeName::Review);
        let position = state.conversation.history.message_count();
        let state = self.run_turn(state, node, NodeInput::resume(decision)).await?;
        Ok(state.to_snapshot(state.conversation.history.agent_replies_since(position)))
    }

    //
    // ================= Runtime Loop =================
    //

    async fn run_turn(
        &self,
        mut state: WorkflowState,
        start: NodeName,
        input: NodeInput,
    ) -> Result<WorkflowState> {
        let max_steps = self.config.max_steps_per_turn;
        let mut node = start;
        let mut input = input;
        let mut steps: u32 = 0;

        loop {
            steps += 1;
            if steps > max_steps && node != NodeName::HandleError {
                warn!(thread_id = %state.thread_id(), max_steps, "Step budget exhausted");
                input = NodeInput::failure(NodeFailure {
                    node,
                    message: WorkflowError::StepLimitExceeded(max_steps).to_string(),
                });
                node = NodeName::HandleError;
            }

            state.enter_step(node);
            let execution = self.engine.execute(node, &state, &input).await;

            let next = match execution.outcome {
                StepOutcome::Completed(output) => {
                    state.apply(output.update);
                    if state.orchestration.pending_confirmation.is_none() {
                        state.orchestration.suspended_at = None;
                    }
                    if output.interrupt {
                        state.orchestration.suspended_at = Some(node);
                    }
                    self.store.save(&Checkpoint::new(Some(node), state.clone())).await?;

                    if output.interrupt {
                        info!(thread_id = %state.thread_id(), node = %node, "Thread suspended");
                        break;
                    }
                    match route(node, &state, self.config.confidence_threshold) {
                        Route::Next(next) => Some((next, NodeInput::default())),
                        Route::Halt => None,
                    }
                }
                StepOutcome::Failed(failure) => {
                    if node == NodeName::HandleError {
                        // Nothing left to route to.
                        state.orchestration.status = WorkflowStatus::Failed;
                        state.orchestration.error = Some(failure.message);
                        self.store.save(&Checkpoint::new(Some(node), state.clone())).await?;
                        None
                    } else {
                        self.store.save(&Checkpoint::new(Some(node), state.clone())).await?;
                        Some((NodeName::HandleError, NodeInput::failure(failure)))
                    }
                }
            };

            match next {
                Some((next_node, next_input)) => {
                    debug!(thread_id = %state.thread_id(), from = %node, to = %next_node, "Routing");
                    node = next_node;
                    input = next_input;
                }
                None => break,
            }
        }

        info!(
            thread_id = %state.thread_id(),
            status = %state.status(),
            steps,
            "Turn finished"
        );
        Ok(state)
    }

    //
    // ================= Thread Access =================
    //

    /// Runs `op` while holding the thread's lock. The lock entry is dropped
    /// again once no other caller is holding or waiting on it.
    async fn with_thread_lock<T, F>(&self, thread_id: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lock = {
            let mut locks = self.thread_locks.lock().await;
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        drop(lock);

        let mut locks = self.thread_locks.lock().await;
        if locks
            .get(thread_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(thread_id);
        }
        result
    }

    async fn load(&self, thread_id: &str) -> Result<WorkflowState> {
        self.store
            .latest(thread_id)
            .await?
            .map(|checkpoint| checkpoint.state)
            .ok_or_else(|| WorkflowError::ThreadNotFound(thread_id.to_string()))
    }

    async fn load_open(&self, thread_id: &str) -> Result<WorkflowState> {
        let state = self.load(thread_id).await?;
        if state.status().is_terminal() {
            return Err(WorkflowError::ThreadClosed {
                thread_id: thread_id.to_string(),
                status: state.status().to_string(),
            });
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::KeywordInterpreter;
    use crate::models::{DocumentStatus, PERMISSION_CREATE_CAPITAL_CALL};
    use crate::services::{InMemoryAccountingService, InjectedFailure, ServiceOperation};
    use crate::state::InMemoryCheckpointStore;
    use tokio_test::{assert_err, assert_ok};

    const DETAILS: &str =
        "Amount $1,000,000, submit date 2025-03-01, posting date 2025-03-15, GL 4000";

    fn orchestrator_with(
        services: Arc<InMemoryAccountingService>,
        config: WorkflowConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            services,
            Arc::new(KeywordInterpreter),
            Arc::new(InMemoryCheckpointStore::new()),
            config,
        )
    }

    fn setup() -> (Orchestrator, Arc<InMemoryAccountingService>) {
        let services = Arc::new(InMemoryAccountingService::seeded());
        (orchestrator_with(services.clone(), WorkflowConfig::default()), services)
    }

    fn user() -> UserContext {
        UserContext::new("u-1", "Morgan").with_permission(PERMISSION_CREATE_CAPITAL_CALL)
    }

    /// Drives a thread to the confirmation point.
    async fn suspended(orchestrator: &Orchestrator, thread_id: &str) -> WorkflowSnapshot {
        orchestrator
            .start_thread(Some(thread_id.to_string()), user())
            .await
            .unwrap();
        let found = orchestrator
            .send_message(thread_id, "Find Evergreen Growth Fund III")
            .await
            .unwrap();
        assert_eq!(found.status, WorkflowStatus::AwaitingInput);
        assert_eq!(found.data.fund_id.as_deref(), Some("EGF3"));

        orchestrator.send_message(thread_id, DETAILS).await.unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_approval_creates_summarized_document() {
        let (orchestrator, services) = setup();

        let snapshot = suspended(&orchestrator, "t-e2e").await;
        assert_eq!(snapshot.status, WorkflowStatus::AwaitingConfirmation);
        assert!(snapshot.missing_fields.is_empty());

        let pending = snapshot.pending_confirmation.clone().unwrap();
        assert!(pending.summary.contains("Evergreen Growth Fund III"));
        assert!(pending.summary.contains("1,000,000.00"));

        let summarized = snapshot.data.clone();
        let done = orchestrator
            .resume(
                "t-e2e",
                ResumeDecision::approve().for_suspension(pending.suspension_id),
            )
            .await
            .unwrap();

        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.pending_confirmation.is_none());
        assert_eq!(done.data.document_status, Some(DocumentStatus::Posted));

        let documents = services.documents().await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].data, summarized);
        assert_eq!(services.call_count(ServiceOperation::CreateDocument).await, 1);
    }

    #[tokio::test]
    async fn test_rejection_returns_to_awaiting_input() {
        let (orchestrator, services) = setup();
        let snapshot = suspended(&orchestrator, "t-reject").await;

        let rejected = orchestrator
            .send_message("t-reject", "No, reject it")
            .await
            .unwrap();

        assert_eq!(rejected.status, WorkflowStatus::AwaitingInput);
        assert!(rejected.pending_confirmation.is_none());
        assert_eq!(rejected.current_step, Some(NodeName::Review));
        assert_eq!(rejected.data, snapshot.data);
        assert!(services.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_message_approves() {
        let (orchestrator, services) = setup();
        suspended(&orchestrator, "t-yes").await;

        let done = orchestrator
            .send_message("t-yes", "Yes, looks good")
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(services.documents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_modification_rebuilds_summary() {
        let (orchestrator, _) = setup();
        let first = suspended(&orchestrator, "t-modify").await;
        let first_id = first.pending_confirmation.unwrap().suspension_id;

        let modified = orchestrator
            .send_message("t-modify", "change the amount to $2m")
            .await
            .unwrap();

        assert_eq!(modified.status, WorkflowStatus::AwaitingConfirmation);
        let pending = modified.pending_confirmation.unwrap();
        assert_ne!(pending.suspension_id, first_id);
        assert!(pending.summary.contains("2,000,000.00"));
        assert_eq!(modified.data.gl_accounts[0].allocated_amount, Some(2_000_000.0));
    }

    #[tokio::test]
    async fn test_stale_and_unexpected_resume_rejected() {
        let (orchestrator, _) = setup();
        orchestrator
            .start_thread(Some("t-stale".into()), user())
            .await
            .unwrap();

        let err = orchestrator
            .resume("t-stale", ResumeDecision::approve())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotSuspended(_)));

        orchestrator
            .send_message("t-stale", "Find Evergreen Growth Fund III")
            .await
            .unwrap();
        orchestrator.send_message("t-stale", DETAILS).await.unwrap();

        let err = orchestrator
            .resume(
                "t-stale",
                ResumeDecision::approve().for_suspension(Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::StaleResume { .. }));

        let still = orchestrator.snapshot("t-stale").await.unwrap();
        assert_eq!(still.status, WorkflowStatus::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn test_service_failure_fails_workflow() {
        let services = Arc::new(InMemoryAccountingService::seeded());
        services
            .fail_next(ServiceOperation::GetGlAccounts, InjectedFailure::Permanent, 1)
            .await;
        let orchestrator = orchestrator_with(services, WorkflowConfig::default());

        orchestrator
            .start_thread(Some("t-fail".into()), user())
            .await
            .unwrap();
        let failed = orchestrator
            .send_message("t-fail", "Find Evergreen Growth Fund III")
            .await
            .unwrap();

        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(failed.error.unwrap().contains("load_accounts"));

        let err = assert_err!(orchestrator.send_message("t-fail", "hello").await);
        assert!(matches!(err, WorkflowError::ThreadClosed { .. }));
    }

    #[tokio::test]
    async fn test_failure_after_create_keeps_document_id() {
        let services = Arc::new(InMemoryAccountingService::seeded());
        services
            .fail_next(ServiceOperation::SubmitDocument, InjectedFailure::Permanent, 1)
            .await;
        let orchestrator = orchestrator_with(services.clone(), WorkflowConfig::default());

        let snapshot = suspended(&orchestrator, "t-submit").await;
        let pending = snapshot.pending_confirmation.unwrap();
        let failed = orchestrator
            .resume(
                "t-submit",
                ResumeDecision::approve().for_suspension(pending.suspension_id),
            )
            .await
            .unwrap();

        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.data.document_id.as_deref(), Some("CC-00001"));
        assert_eq!(failed.data.document_status, Some(DocumentStatus::Created));
        assert!(failed.error.unwrap().contains("submit_document"));

        let documents = services.documents().await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].status, DocumentStatus::Created);
    }

    #[tokio::test]
    async fn test_switching_fund_while_awaiting_confirmation() {
        let (orchestrator, services) = setup();
        let first = suspended(&orchestrator, "t-switch").await;

        let listed = orchestrator
            .send_message("t-switch", "Find Evergreen")
            .await
            .unwrap();
        assert_eq!(listed.status, WorkflowStatus::AwaitingConfirmation);
        let text = listed.replies.join("\n");
        assert!(text.contains("1. Evergreen Growth Fund III (EGF3)"));
        assert!(text.contains("2. Evergreen Income Fund (EIF1)"));

        let switched = orchestrator.send_message("t-switch", "2").await.unwrap();
        assert_eq!(switched.data.fund_id.as_deref(), Some("EIF1"));
        assert!(switched.pending_confirmation.is_none());
        assert_eq!(switched.status, WorkflowStatus::AwaitingInput);
        assert_eq!(switched.data.amount, first.data.amount);
        assert!(switched.data.gl_accounts.is_empty());
        assert!(services.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_naming_current_fund_while_confirming_approves() {
        let (orchestrator, services) = setup();
        suspended(&orchestrator, "t-named").await;

        let done = orchestrator
            .send_message("t-named", "Yes, go ahead with Evergreen Growth Fund III")
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(services.documents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_thread_lock_entries_are_released() {
        let (orchestrator, _) = setup();

        suspended(&orchestrator, "t-locks").await;
        assert_err!(orchestrator.send_message("unknown", "hello").await);
        let (a, b) = tokio::join!(
            orchestrator.send_message("t-locks", "cancel"),
            orchestrator.send_message("unknown-2", "hello"),
        );
        assert_ok!(a);
        assert_err!(b);

        assert!(orchestrator.thread_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_step_budget_routes_to_handle_error() {
        let services = Arc::new(InMemoryAccountingService::seeded());
        let config = WorkflowConfig {
            max_steps_per_turn: 2,
            ..WorkflowConfig::default()
        };
        let orchestrator = orchestrator_with(services, config);

        orchestrator
            .start_thread(Some("t-budget".into()), user())
            .await
            .unwrap();
        let snapshot = orchestrator
            .send_message("t-budget", "Find Evergreen Growth Fund III")
            .await
            .unwrap();

        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        assert!(snapshot.error.unwrap().contains("Step limit"));
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let (orchestrator, _) = setup();
        orchestrator.start_thread(Some("a".into()), user()).await.unwrap();
        orchestrator.start_thread(Some("b".into()), user()).await.unwrap();

        let (a, b) = tokio::join!(
            orchestrator.send_message("a", "Find Evergreen Growth Fund III"),
            orchestrator.send_message("b", "cancel"),
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.data.fund_id.as_deref(), Some("EGF3"));
        assert_eq!(b.status, WorkflowStatus::Cancelled);
        assert!(b.data.fund_id.is_none());
        assert_eq!(
            orchestrator.snapshot("a").await.unwrap().status,
            WorkflowStatus::AwaitingInput
        );
    }

    #[tokio::test]
    async fn test_thread_lifecycle_errors_and_history() {
        let (orchestrator, _) = setup();

        let err = assert_err!(orchestrator.send_message("missing", "hi").await);
        assert!(matches!(err, WorkflowError::ThreadNotFound(_)));

        let started = orchestrator.start_thread(None, user()).await.unwrap();
        assert_eq!(started.replies.len(), 1);
        let err = orchestrator
            .start_thread(Some(started.thread_id.clone()), user())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ThreadExists(_)));

        orchestrator
            .send_message(&started.thread_id, "Find Evergreen Growth Fund III")
            .await
            .unwrap();
        let history = assert_ok!(orchestrator.history(&started.thread_id).await);
        let steps: Vec<_> = history.iter().map(|r| r.step).collect();
        assert_eq!(
            steps,
            vec![
                None,
                Some(NodeName::ParseIntent),
                Some(NodeName::SearchFund),
                Some(NodeName::ConfirmFund),
                Some(NodeName::LoadAccounts),
                Some(NodeName::LoadInvestors),
                Some(NodeName::RequestInput),
            ]
        );
    }

    #[tokio::test]
    async fn test_checkpoints_survive_a_new_orchestrator() {
        let services = Arc::new(InMemoryAccountingService::seeded());
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let first = Orchestrator::new(
            services.clone(),
            Arc::new(KeywordInterpreter),
            store.clone(),
            WorkflowConfig::default(),
        );
        let snapshot = suspended(&first, "t-restart").await;
        drop(first);

        let second = Orchestrator::new(
            services.clone(),
            Arc::new(KeywordInterpreter),
            store,
            WorkflowConfig::default(),
        );
        let pending = snapshot.pending_confirmation.unwrap();
        let done = second
            .resume(
                "t-restart",
                ResumeDecision::approve().for_suspension(pending.suspension_id),
            )
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(services.documents().await.len(), 1);
    }
}
