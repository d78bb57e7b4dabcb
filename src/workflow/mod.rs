//! Workflow graph: node names, the node trait and the node registry
//!
//! A node reads the composed state and returns a `StateUpdate`; it never
//! mutates state itself. Routing between nodes lives in `routing`.

pub mod nodes;
pub mod routing;

use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::interpreter::MessageInterpreter;
use crate::models::ResumeDecision;
use crate::services::AccountingService;
use crate::state::{StateUpdate, WorkflowState};
use crate::verification::ValidationEngine;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use routing::{next_missing, route, Route};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeName {
    ParseIntent,
    SearchFund,
    ConfirmFund,
    CollectDetails,
    LoadAccounts,
    SelectAccounts,
    LoadInvestors,
    Review,
    CreateDocument,
    SubmitDocument,
    PostDocument,
    HandleError,
    RequestInput,
    CancelWorkflow,
    Finalize,
}

impl NodeName {
    pub const ALL: [NodeName; 15] = [
        NodeName::ParseIntent,
        NodeName::SearchFund,
        NodeName::ConfirmFund,
        NodeName::CollectDetails,
        NodeName::LoadAccounts,
        NodeName::SelectAccounts,
        NodeName::LoadInvestors,
        NodeName::Review,
        NodeName::CreateDocument,
        NodeName::SubmitDocument,
        NodeName::PostDocument,
        NodeName::HandleError,
        NodeName::RequestInput,
        NodeName::CancelWorkflow,
        NodeName::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeName::ParseIntent => "parse_intent",
            NodeName::SearchFund => "search_fund",
            NodeName::ConfirmFund => "confirm_fund",
            NodeName::CollectDetails => "collect_details",
            NodeName::LoadAccounts => "load_accounts",
            NodeName::SelectAccounts => "select_accounts",
            NodeName::LoadInvestors => "load_investors",
            NodeName::Review => "review",
            NodeName::CreateDocument => "create_document",
            NodeName::SubmitDocument => "submit_document",
            NodeName::PostDocument => "post_document",
            NodeName::HandleError => "handle_error",
            NodeName::RequestInput => "request_input",
            NodeName::CancelWorkflow => "cancel_workflow",
            NodeName::Finalize => "finalize",
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeName {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        NodeName::ALL
            .iter()
            .copied()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| WorkflowError::CheckpointError(format!("unknown node '{}'", s)))
    }
}

/// A node error captured at the node boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeFailure {
    pub node: NodeName,
    pub message: String,
}

/// Extra input bound to a node invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInput {
    /// Host decision when re-entering a suspended node
    pub resume: Option<ResumeDecision>,
    /// Failure being handled, for `handle_error`
    pub failure: Option<NodeFailure>,
}

impl NodeInput {
    pub fn resume(decision: ResumeDecision) -> Self {
        Self {
            resume: Some(decision),
            failure: None,
        }
    }

    pub fn failure(failure: NodeFailure) -> Self {
        Self {
            resume: None,
            failure: Some(failure),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub update: StateUpdate,
    /// Suspend the run after merging the update
    pub interrupt: bool,
}

impl NodeOutput {
    pub fn update(update: StateUpdate) -> Self {
        Self {
            update,
            interrupt: false,
        }
    }

    pub fn interrupt(update: StateUpdate) -> Self {
        Self {
            update,
            interrupt: true,
        }
    }
}

/// Everything a node may call out to
#[derive(Clone)]
pub struct NodeDeps {
    pub services: Arc<dyn AccountingService>,
    pub interpreter: Arc<dyn MessageInterpreter>,
    pub validator: Arc<ValidationEngine>,
    pub config: WorkflowConfig,
}

#[async_trait::async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> NodeName;

    async fn run(
        &self,
        state: &WorkflowState,
        input: &NodeInput,
        deps: &NodeDeps,
    ) -> Result<NodeOutput>;
}

/// Node lookup by name
pub struct NodeRegistry {
    nodes: HashMap<NodeName, Arc<dyn Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    pub fn register(&mut self, node: Arc<dyn Node>) {
        self.nodes.insert(node.name(), node);
    }

    pub fn get(&self, name: NodeName) -> Option<Arc<dyn Node>> {
        self.nodes.get(&name).cloned()
    }

    pub fn list(&self) -> Vec<NodeName> {
        let mut names: Vec<NodeName> = self.nodes.keys().copied().collect();
        names.sort();
        names
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry holding every workflow node.
pub fn build_default_registry() -> NodeRegistry {
    use nodes::*;

    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(ParseIntentNode));
    registry.register(Arc::new(SearchFundNode));
    registry.register(Arc::new(ConfirmFundNode));
    registry.register(Arc::new(CollectDetailsNode));
    registry.register(Arc::new(LoadAccountsNode));
    registry.register(Arc::new(SelectAccountsNode));
    registry.register(Arc::new(LoadInvestorsNode));
    registry.register(Arc::new(ReviewNode));
    registry.register(Arc::new(CreateDocumentNode));
    registry.register(Arc::new(SubmitDocumentNode));
    registry.register(Arc::new(PostDocumentNode));
    registry.register(Arc::new(HandleErrorNode));
    registry.register(Arc::new(RequestInputNode));
    registry.register(Arc::new(CancelWorkflowNode));
    registry.register(Arc::new(FinalizeNode));
    registry
}
