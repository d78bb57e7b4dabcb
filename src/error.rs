//! Error types for the capital call workflow

use thiserror::Error;

/// Result type alias for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug)]
pub enum WorkflowError {

    // =============================
    // Workflow Errors
    // =============================

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Node error: {0}")]
    NodeError(String),

    #[error("Interpreter error: {0}")]
    InterpreterError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Step limit exceeded: {0} steps in one turn")]
    StepLimitExceeded(u32),

    // =============================
    // Thread Lifecycle Errors
    // =============================

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Thread already exists: {0}")]
    ThreadExists(String),

    #[error("Thread {thread_id} is closed ({status})")]
    ThreadClosed { thread_id: String, status: String },

    #[error("Thread {0} is not awaiting confirmation")]
    NotSuspended(String),

    #[error("Stale resume: expected suspension {expected}, got {received}")]
    StaleResume { expected: String, received: String },

    // =============================
    // Service Errors
    // =============================

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Service timeout: {0}")]
    ServiceTimeout(String),

    #[error("Task {task_id} failed with status {status}")]
    TaskFailed { task_id: String, status: String },

    #[error("Task {task_id} timed out after {attempts} attempts")]
    TaskTimeout { task_id: String, attempts: u32 },

    // =============================
    // Persistence & Config Errors
    // =============================

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkflowError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkflowError::ServiceUnavailable(_) | WorkflowError::ServiceTimeout(_) => true,
            WorkflowError::HttpError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e
                        .status()
                        .map(|s| s.as_u16() == 429 || s.is_server_error())
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(WorkflowError::ServiceTimeout("funds".into()).is_transient());
        assert!(WorkflowError::ServiceUnavailable("503".into()).is_transient());
        assert!(!WorkflowError::ServiceError("400 bad request".into()).is_transient());
        assert!(!WorkflowError::TaskFailed {
            task_id: "t-1".into(),
            status: "Failed".into()
        }
        .is_transient());
    }
}
