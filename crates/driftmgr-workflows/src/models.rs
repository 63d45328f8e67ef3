//! Core data models for workflows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A workflow definition
///
/// Definitions are immutable once registered. Every execution references the
/// registered definition by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier
    pub id: String,
    /// Workflow name
    pub name: String,
    /// Workflow description
    #[serde(default)]
    pub description: String,
    /// Workflow steps in declaration order
    pub steps: Vec<WorkflowStep>,
    /// Events or schedules that start this workflow
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
    /// Preconditions checked before any step runs
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    /// Rollback policy
    #[serde(default)]
    pub rollback: Option<WorkflowRollback>,
    /// Timeout for the whole forward run in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Default retry budget for steps that do not set their own
    #[serde(default)]
    pub retries: Option<u32>,
    /// Registration time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Create an empty workflow definition
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            triggers: Vec::new(),
            conditions: Vec::new(),
            rollback: None,
            timeout_ms: None,
            retries: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Append a step
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a precondition
    pub fn with_condition(mut self, condition: WorkflowCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add a trigger
    pub fn with_trigger(mut self, trigger: WorkflowTrigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Set the rollback policy
    pub fn with_rollback(mut self, steps: Vec<WorkflowStep>, auto: bool) -> Self {
        self.rollback = Some(WorkflowRollback { steps, auto });
        self
    }

    /// Set the default step retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the forward run timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Parse a workflow definition from YAML
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Whether any trigger of this workflow fires on the given event
    pub fn is_triggered_by(&self, event: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| t.trigger_type == TriggerType::Event && t.event.as_deref() == Some(event))
    }
}

/// A single step in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique step identifier
    pub id: String,
    /// Step name
    pub name: String,
    /// Action dispatched for this step
    pub action: StepAction,
    /// Resource address the action targets
    #[serde(default)]
    pub resource: String,
    /// Action parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Per-attempt timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry budget; falls back to the workflow default
    #[serde(default)]
    pub retries: Option<u32>,
    /// Step is skipped unless this condition holds
    #[serde(default)]
    pub condition: Option<StepCondition>,
    /// Step IDs that follow on success
    #[serde(default)]
    pub on_success: Vec<String>,
    /// Step IDs that follow on failure
    #[serde(default)]
    pub on_failure: Vec<String>,
    /// A failing required step stops sequential iteration
    #[serde(default = "default_required")]
    pub required: bool,
    /// Run concurrently with the following steps
    #[serde(default)]
    pub parallel: bool,
}

fn default_required() -> bool {
    true
}

impl WorkflowStep {
    /// Create a required, sequential step
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            resource: String::new(),
            parameters: BTreeMap::new(),
            timeout_ms: None,
            retries: None,
            condition: None,
            on_success: Vec::new(),
            on_failure: Vec::new(),
            required: true,
            parallel: false,
        }
    }

    /// Set the target resource
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Set an action parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the per-attempt timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Gate the step on a condition
    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Mark whether a failure stops the run
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Run the step concurrently
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

/// Fixed set of actions a step can dispatch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepAction {
    /// `terraform plan`
    TerraformPlan,
    /// `terraform apply`
    TerraformApply,
    /// `terraform destroy`
    TerraformDestroy,
    /// Snapshot a resource before mutation
    BackupResource,
    /// Restore a resource from its snapshot
    RestoreResource,
    /// `terraform validate`
    ValidateConfiguration,
    /// Post-change health probe
    HealthCheck,
    /// Emit a notification
    Notify,
    /// Sleep for the `duration` parameter
    Wait,
    /// Any other name; dispatching it fails the step
    Unknown(String),
}

impl StepAction {
    /// Wire name of the action
    pub fn as_str(&self) -> &str {
        match self {
            StepAction::TerraformPlan => "terraform_plan",
            StepAction::TerraformApply => "terraform_apply",
            StepAction::TerraformDestroy => "terraform_destroy",
            StepAction::BackupResource => "backup_resource",
            StepAction::RestoreResource => "restore_resource",
            StepAction::ValidateConfiguration => "validate_configuration",
            StepAction::HealthCheck => "health_check",
            StepAction::Notify => "notify",
            StepAction::Wait => "wait",
            StepAction::Unknown(name) => name,
        }
    }
}

impl From<String> for StepAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "terraform_plan" => StepAction::TerraformPlan,
            "terraform_apply" => StepAction::TerraformApply,
            "terraform_destroy" => StepAction::TerraformDestroy,
            "backup_resource" => StepAction::BackupResource,
            "restore_resource" => StepAction::RestoreResource,
            "validate_configuration" => StepAction::ValidateConfiguration,
            "health_check" => StepAction::HealthCheck,
            "notify" => StepAction::Notify,
            "wait" => StepAction::Wait,
            _ => StepAction::Unknown(value),
        }
    }
}

impl From<&str> for StepAction {
    fn from(value: &str) -> Self {
        StepAction::from(value.to_string())
    }
}

impl From<StepAction> for String {
    fn from(action: StepAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison used by conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Field equals value
    Equals,
    /// Field differs from value
    NotEquals,
    /// Numeric field greater than value
    GreaterThan,
    /// Numeric field less than value
    LessThan,
    /// String field contains value, or list field contains element
    Contains,
    /// Field is present
    Exists,
    /// Field is absent
    NotExists,
}

/// Condition gating a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    /// Dotted context path, e.g. `parameters.environment`
    pub field: String,
    /// Comparison operator
    pub operator: ConditionOperator,
    /// Right-hand value
    #[serde(default)]
    pub value: Value,
}

impl StepCondition {
    /// Create a condition
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Workflow-level precondition; same shape as a step condition
pub type WorkflowCondition = StepCondition;

/// Kind of workflow trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Started explicitly by a caller
    Manual,
    /// Started on a cron schedule
    Scheduled,
    /// Started when a named event occurs
    Event,
}

/// What starts a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    /// Trigger kind
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Optional free-form condition
    #[serde(default)]
    pub condition: Option<String>,
    /// Cron expression for scheduled triggers
    #[serde(default)]
    pub schedule: Option<String>,
    /// Event name for event triggers
    #[serde(default)]
    pub event: Option<String>,
}

impl WorkflowTrigger {
    /// Trigger on a named event
    pub fn on_event(event: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Event,
            condition: None,
            schedule: None,
            event: Some(event.into()),
        }
    }
}

/// Rollback policy of a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRollback {
    /// Steps executed in order to undo the forward run
    pub steps: Vec<WorkflowStep>,
    /// Run the rollback automatically when a step fails
    #[serde(default)]
    pub auto: bool,
}

/// Inputs of one workflow execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Workflow being executed
    #[serde(default)]
    pub workflow_id: String,
    /// Execution identifier; generated when empty
    #[serde(default)]
    pub execution_id: String,
    /// Caller-supplied parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Resource addresses in scope
    #[serde(default)]
    pub resources: Vec<String>,
    /// Observed state snapshots keyed by resource address
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
    /// User that started the execution
    #[serde(default)]
    pub user: String,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl WorkflowContext {
    /// Create a context for a user
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    /// Set a parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Set the state snapshot of a resource
    pub fn with_state(mut self, resource: impl Into<String>, value: Value) -> Self {
        self.state.insert(resource.into(), value);
        self
    }

    /// Use a fixed execution ID
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }
}

/// Workflow execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// Not started
    #[serde(rename = "pending")]
    Pending,
    /// Steps are executing
    #[serde(rename = "running")]
    Running,
    /// All steps succeeded
    #[serde(rename = "completed")]
    Completed,
    /// A step failed and nothing recovered it
    #[serde(rename = "failed")]
    Failed,
    /// Cancelled by the caller
    #[serde(rename = "cancelled")]
    Cancelled,
    /// A step failed and the rollback succeeded
    #[serde(rename = "rolled_back")]
    RolledBack,
}

impl WorkflowStatus {
    /// Terminal states never transition further
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepStatus {
    /// Not started
    #[serde(rename = "pending")]
    Pending,
    /// Executing
    #[serde(rename = "running")]
    Running,
    /// Succeeded
    #[serde(rename = "completed")]
    Completed,
    /// Failed after exhausting its attempts
    #[serde(rename = "failed")]
    Failed,
    /// Condition not met
    #[serde(rename = "skipped")]
    Skipped,
}

/// Result of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step identifier
    pub step_id: String,
    /// Final status
    pub status: StepStatus,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// Error of the last failed attempt
    pub error: Option<String>,
    /// Output produced by the action
    #[serde(default)]
    pub output: BTreeMap<String, Value>,
    /// Retries consumed beyond the first attempt
    pub retries: u32,
    /// Attempts made; zero for skipped steps
    pub attempts: u32,
}

impl StepResult {
    /// Start a step result
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            error: None,
            output: BTreeMap::new(),
            retries: 0,
            attempts: 0,
        }
    }

    /// Record the terminal status
    pub fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
    }
}

/// Outcome of a rollback run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    /// Final status (`completed` or `failed`)
    pub status: StepStatus,
    /// Rollback step results
    pub steps: Vec<StepResult>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// Error of the failing rollback step
    pub error: Option<String>,
}

/// Record of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Execution identifier
    pub execution_id: String,
    /// Executed workflow
    pub workflow_id: String,
    /// Current status
    pub status: WorkflowStatus,
    /// Results of attempted steps
    pub steps: Vec<StepResult>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// Failure description
    pub error: Option<String>,
    /// Rollback outcome, when one ran
    pub rollback: Option<RollbackResult>,
    /// Outputs collected from steps, keyed by step ID
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl WorkflowResult {
    /// Create a running result
    pub fn running(execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Running,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            error: None,
            rollback: None,
            outputs: BTreeMap::new(),
        }
    }

    /// Results of a given step
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Aggregated execution metrics of one workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMetrics {
    /// Terminal executions recorded
    pub total_executions: u64,
    /// Executions that completed
    pub successful_executions: u64,
    /// Executions that ended in any other terminal state
    pub failed_executions: u64,
    /// Running average duration in milliseconds
    pub average_duration_ms: u64,
    /// Completion time of the last execution
    pub last_execution: Option<DateTime<Utc>>,
}

impl WorkflowMetrics {
    /// Fold one terminal result into the metrics
    pub fn record(&mut self, result: &WorkflowResult) {
        self.total_executions += 1;
        self.last_execution = result.completed_at;
        if result.status == WorkflowStatus::Completed {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        let previous = self.average_duration_ms as u128 * (self.total_executions as u128 - 1);
        self.average_duration_ms =
            ((previous + result.duration_ms as u128) / self.total_executions as u128) as u64;
    }
}
