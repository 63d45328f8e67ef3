//! Core data models for remediation

use crate::state::{get_path, StateMap, StateValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Kind of corrective change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationType {
    /// Create a missing resource
    Create,
    /// Update attributes in place
    Update,
    /// Destroy and recreate
    Replace,
    /// Destroy an unwanted resource
    Delete,
    /// Bring an unmanaged resource under management
    Import,
}

impl RemediationType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationType::Create => "create",
            RemediationType::Update => "update",
            RemediationType::Replace => "replace",
            RemediationType::Delete => "delete",
            RemediationType::Import => "import",
        }
    }
}

impl fmt::Display for RemediationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a change does to an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Attribute is added
    Add,
    /// Attribute value changes
    Update,
    /// Attribute is removed
    Remove,
}

/// How dangerous a change to an attribute is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    /// Cosmetic (tags, metadata)
    Low,
    /// Capacity and sizing
    Medium,
    /// Network placement
    High,
    /// Security posture
    Critical,
}

/// A single attribute change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Dotted attribute path
    pub path: String,
    /// Change kind
    pub action: ChangeAction,
    /// Value before the change (the observed value)
    #[serde(default)]
    pub old_value: Option<StateValue>,
    /// Value after the change (the declared value)
    #[serde(default)]
    pub new_value: Option<StateValue>,
    /// Sensitivity of the attribute
    pub sensitivity: Sensitivity,
}

/// Severity of a finding or an impact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Low,
    /// Worth a warning
    Medium,
    /// Blocks the plan
    High,
    /// Blocks the plan
    Critical,
}

impl Severity {
    /// Map a risk score to a severity band
    pub fn from_risk_score(score: f64) -> Self {
        if score >= 8.0 {
            Severity::Critical
        } else if score >= 6.0 {
            Severity::High
        } else if score >= 4.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

/// Lifecycle status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Generated, not yet applied
    Draft,
    /// Waiting on approvers
    PendingApproval,
    /// Approved, ready to apply
    Approved,
    /// Rejected by an approver
    Rejected,
    /// Being applied
    Applying,
    /// Applied successfully
    Applied,
    /// Apply failed and nothing recovered it
    Failed,
    /// Apply failed and the rollback succeeded
    RolledBack,
}

impl PlanStatus {
    /// Whether an apply may start from this status
    ///
    /// Once an apply starts the plan is read-only; finished plans are
    /// archived and never re-applied.
    pub fn is_applicable(self) -> bool {
        matches!(
            self,
            PlanStatus::Draft | PlanStatus::PendingApproval | PlanStatus::Approved
        )
    }
}

/// Monetary impact estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostImpact {
    /// Monthly cost before the change
    pub current_monthly_cost: f64,
    /// Monthly cost after the change
    pub new_monthly_cost: f64,
    /// Current minus new; negative means the change costs more
    pub monthly_savings: f64,
    /// One-time cost of the change
    pub one_time_cost: f64,
    /// ISO currency code
    pub currency: String,
}

/// Qualitative security impact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityImpact {
    /// Score before the change
    pub current_score: f64,
    /// Score after the change
    pub new_score: f64,
    /// Improvements the change brings
    pub improvements: Vec<String>,
    /// Risks the change introduces
    pub new_risks: Vec<String>,
    /// Compliance areas touched
    pub compliance_impact: Vec<String>,
}

/// Qualitative performance impact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceImpact {
    /// Latency change
    pub latency_change: String,
    /// Throughput change
    pub throughput_change: String,
    /// Availability change
    pub availability_change: String,
    /// Capacity metrics affected
    pub metrics: Vec<String>,
}

/// Impact assessment of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    /// Severity band of the risk score
    pub severity: Severity,
    /// Risk score in `[0, 10]`
    pub risk_score: f64,
    /// Expected downtime
    pub estimated_downtime: Duration,
    /// Affected resource addresses
    pub affected_resources: Vec<String>,
    /// Cost estimate
    pub cost_impact: CostImpact,
    /// Security estimate
    pub security_impact: SecurityImpact,
    /// Performance estimate
    pub performance_impact: PerformanceImpact,
    /// Severity alone demands human approval
    pub requires_approval: bool,
    /// Why approval is required
    #[serde(default)]
    pub approval_reason: Option<String>,
}

/// Outcome of validating a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// No error-severity rule or security issue fired
    pub valid: bool,
    /// Error-severity findings
    pub errors: Vec<String>,
    /// Medium-severity findings
    pub warnings: Vec<String>,
    /// Security scan findings
    pub security_issues: Vec<String>,
    /// Informational findings
    pub best_practices: Vec<String>,
    /// Number of changes in the plan
    pub estimated_changes: usize,
}

/// Approval policy of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Approvals needed
    #[serde(default = "default_min_approvers")]
    pub min_approvers: u32,
    /// Window in seconds after the request during which votes count
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
    /// Allowed approvers; empty allows anyone
    #[serde(default)]
    pub approvers: Vec<String>,
}

fn default_min_approvers() -> u32 {
    1
}

fn default_approval_timeout() -> u64 {
    24 * 60 * 60
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            min_approvers: default_min_approvers(),
            timeout_secs: default_approval_timeout(),
            approvers: Vec::new(),
        }
    }
}

/// Post-apply check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationStep {
    /// Execution order
    pub order: u32,
    /// What the check verifies
    pub description: String,
    /// Command line to run in the execution workspace
    pub command: String,
}

/// Window during which a plan may be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Window start
    pub start: DateTime<Utc>,
    /// Window end
    pub end: DateTime<Utc>,
}

impl Schedule {
    /// Whether `at` falls inside the window
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// What to do when a rollback step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop and report the rollback as failed
    Abort,
    /// Run the step once more, then abort
    Retry,
    /// Record a warning and move on
    Continue,
}

/// One step of a rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    /// Execution order
    pub order: u32,
    /// What the step does
    pub description: String,
    /// Command line
    pub command: String,
    /// Command line verifying the step
    #[serde(default)]
    pub validation: Option<String>,
    /// Failure policy
    pub on_failure: OnFailure,
}

/// Inverse of a remediation plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    /// Rollback identifier
    pub id: String,
    /// Plan this rollback undoes
    pub plan_id: String,
    /// Snapshot identifier
    pub snapshot_id: String,
    /// Directory holding the pre-change backup
    pub backup_location: PathBuf,
    /// Steps executed in order
    pub rollback_steps: Vec<RollbackStep>,
    /// Expected rollback duration
    pub estimated_time: Duration,
    /// Run automatically when the forward apply fails
    pub auto_rollback: bool,
    /// Configuration restoring the pre-change state
    pub rollback_code: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A typed, validated description of the change resolving one drift
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationPlan {
    /// Plan identifier
    pub id: String,
    /// Cloud resource identifier
    pub resource_id: String,
    /// Resource type, e.g. `aws_instance`
    pub resource_type: String,
    /// Resource name in configuration
    pub resource_name: String,
    /// Provider name
    pub provider: String,
    /// Change kind
    #[serde(rename = "type")]
    pub remediation_type: RemediationType,
    /// Observed attributes
    pub current_state: StateMap,
    /// Declared attributes
    pub desired_state: StateMap,
    /// Attribute changes
    pub changes: Vec<Change>,
    /// Generated configuration
    #[serde(default)]
    pub terraform_code: String,
    /// Import commands for unmanaged resources
    #[serde(default)]
    pub import_commands: Vec<String>,
    /// Impact, set once at generation time
    #[serde(default)]
    pub estimated_impact: Option<ImpactAssessment>,
    /// Human approval needed before apply
    pub requires_approval: bool,
    /// Approval policy
    #[serde(default)]
    pub approval_config: ApprovalConfig,
    /// Lifecycle status
    pub status: PlanStatus,
    /// Post-apply checks
    #[serde(default)]
    pub validation_steps: Vec<ValidationStep>,
    /// Apply window
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Inverse plan
    #[serde(default)]
    pub rollback_plan: Option<RollbackPlan>,
    /// Validation errors found at generation time
    #[serde(default)]
    pub validation_errors: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl RemediationPlan {
    /// Resource address, `type.name`
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.resource_name)
    }

    /// Value of `tags.environment` in the observed state
    pub fn environment(&self) -> Option<&str> {
        get_path(&self.current_state, "tags.environment").and_then(StateValue::as_str)
    }

    /// Number of critical-sensitivity changes
    pub fn critical_change_count(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| c.sensitivity == Sensitivity::Critical)
            .count()
    }

    /// Risk score of the attached impact assessment
    pub fn risk_score(&self) -> Option<f64> {
        self.estimated_impact.as_ref().map(|i| i.risk_score)
    }
}

/// Severity of an execution log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Debug detail
    Debug,
    /// Progress
    Info,
    /// Recoverable problem
    Warn,
    /// Failure
    Error,
}

/// Structured log entry captured during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Time of the entry
    pub timestamp: DateTime<Utc>,
    /// Level
    pub level: LogLevel,
    /// Message, including captured tool output
    pub message: String,
    /// Key/value context
    #[serde(default)]
    pub context: std::collections::BTreeMap<String, String>,
}

/// Outcome of applying a plan or a rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Whether the run succeeded
    pub success: bool,
    /// Plan or rollback identifier
    pub plan_id: String,
    /// Simulated run; nothing was mutated
    pub dry_run: bool,
    /// Changes applied
    pub applied_changes: Vec<Change>,
    /// Changes that failed
    pub failed_changes: Vec<Change>,
    /// Errors
    pub errors: Vec<String>,
    /// Warnings
    pub warnings: Vec<String>,
    /// Log entries in order
    pub logs: Vec<LogEntry>,
    /// State reported by the apply tool after a successful run
    #[serde(default)]
    pub final_state: Option<Value>,
    /// Wall time
    pub execution_time: Duration,
    /// Start time
    pub started_at: DateTime<Utc>,
}

impl ApplyResult {
    /// Start a successful, empty result
    pub fn new(plan_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            success: true,
            plan_id: plan_id.into(),
            dry_run,
            applied_changes: Vec::new(),
            failed_changes: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            logs: Vec::new(),
            final_state: None,
            execution_time: Duration::ZERO,
            started_at: Utc::now(),
        }
    }

    /// Append a log entry
    pub fn log<I, K, V>(&mut self, level: LogLevel, message: impl Into<String>, context: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            context: context
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
    }

    /// Record a failure
    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.errors.push(error.into());
    }

    /// Stamp the elapsed time
    pub fn finish(&mut self) {
        self.execution_time = (Utc::now() - self.started_at).to_std().unwrap_or_default();
    }
}

/// Kind of divergence reported by drift detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    /// Exists in the cloud but not in configuration
    Created,
    /// Declared in configuration but missing from the cloud
    Deleted,
    /// Exists in both with differing attributes
    Modified,
    /// Exists in the cloud, never managed
    Unmanaged,
}

/// One attribute divergence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftChange {
    /// Dotted attribute path
    pub field: String,
    /// Declared value
    #[serde(default)]
    pub old_value: Option<StateValue>,
    /// Observed value
    #[serde(default)]
    pub new_value: Option<StateValue>,
}

impl DriftChange {
    /// Create a drift change
    pub fn new(
        field: impl Into<String>,
        declared: Option<StateValue>,
        observed: Option<StateValue>,
    ) -> Self {
        Self {
            field: field.into(),
            old_value: declared,
            new_value: observed,
        }
    }
}

/// A detected drift, as supplied by the drift source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftItem {
    /// Cloud resource identifier
    pub resource_id: String,
    /// Resource type
    pub resource_type: String,
    /// Resource name in configuration; defaults to a sanitized ID
    #[serde(default)]
    pub resource_name: String,
    /// Provider name
    #[serde(default)]
    pub provider: String,
    /// Divergence kind
    pub drift_type: DriftType,
    /// Attribute divergences
    #[serde(default)]
    pub changes: Vec<DriftChange>,
    /// Full observed attributes, when known
    #[serde(default)]
    pub observed_state: StateMap,
    /// Full declared attributes, when known
    #[serde(default)]
    pub declared_state: StateMap,
}

impl DriftItem {
    /// Create a drift item with no attribute changes
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        drift_type: DriftType,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            resource_name: String::new(),
            provider: String::new(),
            drift_type,
            changes: Vec::new(),
            observed_state: StateMap::new(),
            declared_state: StateMap::new(),
        }
    }

    /// Set the configuration name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = name.into();
        self
    }

    /// Set the provider
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Add an attribute divergence
    pub fn with_change(mut self, change: DriftChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Set the observed attributes
    pub fn with_observed_state(mut self, state: StateMap) -> Self {
        self.observed_state = state;
        self
    }

    /// Set the declared attributes
    pub fn with_declared_state(mut self, state: StateMap) -> Self {
        self.declared_state = state;
        self
    }
}
