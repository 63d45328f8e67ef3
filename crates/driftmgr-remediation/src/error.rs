//! Error types for remediation operations

use crate::models::{ApplyResult, PlanStatus};
use driftmgr_workflows::WorkflowError;
use thiserror::Error;

/// Errors that can occur while planning, approving, applying or rolling back
#[derive(Debug, Error)]
pub enum RemediationError {
    /// Plan, backup or approval request not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Plan or drift record is malformed
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Plan was refused by validation
    #[error("Plan failed validation: {}", errors.join("; "))]
    ValidationFailed {
        /// Error-severity findings and security issues
        errors: Vec<String>,
    },

    /// Plan is parked until enough approvals are recorded
    #[error("Manual approval required for plan {plan_id} (risk score: {risk_score:.1})")]
    ApprovalRequired {
        /// Plan awaiting approval
        plan_id: String,
        /// Risk score that triggered the gate
        risk_score: f64,
    },

    /// An approver rejected the plan
    #[error("Plan {0} was rejected")]
    ApprovalRejected(String),

    /// The approval window closed before enough approvals arrived
    #[error("Approval for plan {0} expired")]
    ApprovalExpired(String),

    /// Vote refused (duplicate, unknown approver, decided request)
    #[error("Invalid approval: {0}")]
    InvalidApproval(String),

    /// Plan is applying or already finished
    #[error("Plan {plan_id} cannot be applied in status {status:?}")]
    InvalidState {
        /// Plan that was refused
        plan_id: String,
        /// Status it was found in
        status: PlanStatus,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Apply attempted outside the plan's schedule window
    #[error("Plan {0} is outside its scheduled window")]
    OutsideSchedule(String),

    /// Backup could not be written or verified
    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// Code generation failed
    #[error("Code generation failed: {0}")]
    CodeGeneration(String),

    /// External apply tool failed; the partial result is attached
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        /// Result with logs and failed changes
        result: Box<ApplyResult>,
        /// Failure description including tool output
        message: String,
    },

    /// Rollback itself failed; infrastructure may be inconsistent
    #[error("Rollback failed: {message}")]
    RollbackFailed {
        /// Result of the rollback run
        result: Box<ApplyResult>,
        /// Failure description
        message: String,
    },

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Error from the workflow engine or command runner
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

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

impl RemediationError {
    /// Whether the error came from cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        match self {
            RemediationError::Cancelled => true,
            RemediationError::Workflow(e) => e.is_cancellation(),
            _ => false,
        }
    }

    /// Whether the error leaves the plan waiting on approvers
    pub fn is_approval_pending(&self) -> bool {
        matches!(self, RemediationError::ApprovalRequired { .. })
    }
}

/// Result type for remediation operations
pub type Result<T> = std::result::Result<T, RemediationError>;
