//! Capital Call Agent
//!
//! A conversational workflow that prepares, confirms and posts capital call
//! documents in an external accounting system:
//! - Interprets free-text user messages into intents and field values
//! - Looks up funds, GL accounts and investors through the accounting API
//! - Validates the call before it is shown for review
//! - Suspends for human confirmation and resumes from a checkpoint
//! - Records every step for audit
//!
//! RUNTIME LOOP:
//! MESSAGE → PARSE → ROUTE → NODE → CHECKPOINT → (continue | suspend | halt)

pub mod agent;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod gemini;
pub mod interpreter;
pub mod memory;
pub mod models;
pub mod services;
pub mod state;
pub mod verification;
pub mod workflow;

pub use error::Result;

// Re-export common types
pub use agent::Orchestrator;
pub use models::*;
pub use state::WorkflowSnapshot;
