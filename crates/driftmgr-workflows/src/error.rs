//! Error types for workflow operations

use thiserror::Error;

/// Errors that can occur during workflow operations
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Workflow or execution not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid workflow definition
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    /// Workflow ID already registered
    #[error("Workflow with ID {0} already exists")]
    AlreadyExists(String),

    /// Step action is not one of the known actions
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Step execution failed
    #[error("Step failed: {0}")]
    StepFailed(String),

    /// Step or workflow exceeded its timeout
    #[error("Timed out after {seconds}s")]
    Timeout {
        /// Timeout that elapsed, in seconds
        seconds: u64,
    },

    /// Execution was cancelled by the caller
    #[error("Execution cancelled")]
    Cancelled,

    /// Workflow conditions evaluated to false
    #[error("Workflow conditions not met")]
    ConditionsNotMet,

    /// External command failed
    #[error("Command `{command}` failed: {output}")]
    CommandFailed {
        /// Command line that was run
        command: String,
        /// Combined stdout and stderr
        output: String,
    },

    /// YAML serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkflowError {
    /// Whether this error came from cancellation rather than a failing action
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WorkflowError::Cancelled)
    }
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;
