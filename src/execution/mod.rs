//! Execution engine for workflow nodes
//!
//! Runs exactly one node per call. Node errors never escape: they come back
//! as a `NodeFailure` that the orchestrator routes to `handle_error`.

use crate::state::WorkflowState;
use crate::workflow::{NodeDeps, NodeFailure, NodeInput, NodeName, NodeOutput, NodeRegistry};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(NodeOutput),
    Failed(NodeFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepExecution {
    pub node: NodeName,
    pub outcome: StepOutcome,
    pub execution_time_ms: u64,
}

pub struct ExecutionEngine {
    registry: NodeRegistry,
    deps: NodeDeps,
}

impl ExecutionEngine {
    pub fn new(registry: NodeRegistry, deps: NodeDeps) -> Self {
        Self { registry, deps }
    }

    pub fn deps(&self) -> &NodeDeps {
        &self.deps
    }

    pub async fn execute(
        &self,
        node: NodeName,
        state: &WorkflowState,
        input: &NodeInput,
    ) -> StepExecution {
        let start = Instant::now();

        let outcome = match self.registry.get(node) {
            Some(handler) => match handler.run(state, input, &self.deps).await {
                Ok(output) => StepOutcome::Completed(output),
                Err(e) => {
                    warn!(
                        thread_id = %state.thread_id(),
                        node = %node,
                        error = %e,
                        "Node execution failed"
                    );
                    StepOutcome::Failed(NodeFailure {
                        node,
                        message: e.to_string(),
                    })
                }
            },
            None => {
                warn!(node = %node, "Node not registered");
                StepOutcome::Failed(NodeFailure {
                    node,
                    message: "node not registered".to_string(),
                })
            }
        };

        let execution_time_ms = start.elapsed().as_millis() as u64;
        debug!(
            thread_id = %state.thread_id(),
            node = %node,
            execution_time_ms,
            failed = matches!(outcome, StepOutcome::Failed(_)),
            "Node executed"
        );

        StepExecution {
            node,
            outcome,
            execution_time_ms,
        }
    }
}
