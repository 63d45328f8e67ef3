//! Remediation engine
//!
//! Turns detected drift into plans and drives them through validation, the
//! approval gate, backup, execution and rollback:
//!
//! ```text
//! DriftItem -> generate_plan -> validate -> approve -> backup -> apply
//!                                                                 |
//!                                           rollback <- failure --+
//! ```

use crate::approval::{ApprovalManager, ApprovalStatus};
use crate::audit::AuditLogger;
use crate::codegen::{config_file_name, CodeGenerator, HclCodeGenerator};
use crate::config::RemediationConfig;
use crate::error::{RemediationError, Result};
use crate::executor::{write_json, PlanExecutor};
use crate::impact::ImpactAnalyzer;
use crate::models::{
    ApplyResult, Change, ChangeAction, DriftItem, DriftType, LogLevel, PlanStatus,
    RemediationPlan, RemediationType, Sensitivity, ValidationResult,
};
use crate::rollback::RollbackManager;
use crate::state::{remove_path, set_path, to_json, StateMap, StateValue};
use crate::validator::{PlanValidator, SyntaxValidator, TerraformSyntaxValidator, ValidationRule};
use chrono::{DateTime, Utc};
use driftmgr_workflows::{
    CommandRunner, StepAction, TokioCommandRunner, Workflow, WorkflowContext, WorkflowStep,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CRITICAL_FIELDS: &[&str] = &[
    "security_group",
    "network_acl",
    "iam",
    "policy",
    "encryption",
    "ssl",
    "tls",
];
const HIGH_FIELDS: &[&str] = &["subnet", "vpc", "cidr", "ip", "dns", "route"];
const MEDIUM_FIELDS: &[&str] = &["instance_type", "size", "capacity", "memory", "cpu", "storage"];
const LOW_FIELDS: &[&str] = &["tag", "metadata"];

fn field_matches(field: &str, keyword: &str) -> bool {
    // short keywords only match at the start of a path token ("ip" in
    // "private_ip", not in "description")
    if keyword.len() <= 3 {
        field
            .split(['.', '_', '-'])
            .any(|token| token.starts_with(keyword))
    } else {
        field.contains(keyword)
    }
}

/// Sensitivity of an attribute, judged by its path
pub fn classify_sensitivity(field: &str) -> Sensitivity {
    let field = field.to_lowercase();
    let tables = [
        (CRITICAL_FIELDS, Sensitivity::Critical),
        (HIGH_FIELDS, Sensitivity::High),
        (MEDIUM_FIELDS, Sensitivity::Medium),
        (LOW_FIELDS, Sensitivity::Low),
    ];
    tables
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| field_matches(&field, k)))
        .map(|(_, sensitivity)| *sensitivity)
        .unwrap_or(Sensitivity::Medium)
}

/// Attributes whose change forces the resource to be replaced
pub fn force_new_fields(resource_type: &str) -> &'static [&'static str] {
    match resource_type {
        "aws_instance" => &["ami", "instance_type", "availability_zone", "subnet_id"],
        "aws_rds_instance" => &["engine", "engine_version", "allocated_storage"],
        "aws_s3_bucket" => &["bucket", "region"],
        "azurerm_virtual_machine" => &["location", "vm_size"],
        "google_compute_instance" => &["machine_type", "zone", "boot_disk"],
        _ => &[],
    }
}

/// Remediation needed to resolve a drift
pub fn remediation_type_for(drift: &DriftItem) -> RemediationType {
    match drift.drift_type {
        DriftType::Created => RemediationType::Delete,
        DriftType::Deleted => RemediationType::Create,
        DriftType::Unmanaged => RemediationType::Import,
        DriftType::Modified => {
            let force_new = force_new_fields(&drift.resource_type);
            let replaces = drift.changes.iter().any(|c| {
                let root = c.field.split('.').next().unwrap_or(&c.field);
                force_new.contains(&root)
            });
            if replaces {
                RemediationType::Replace
            } else {
                RemediationType::Update
            }
        }
    }
}

fn change_action(declared: bool, observed: bool) -> ChangeAction {
    match (declared, observed) {
        (false, true) => ChangeAction::Remove,
        (true, false) => ChangeAction::Add,
        _ => ChangeAction::Update,
    }
}

fn apply_field(state: &mut StateMap, field: &str, value: Option<StateValue>) {
    match value {
        Some(value) => set_path(state, field, value),
        None => {
            remove_path(state, field);
        }
    }
}

fn sanitize_name(resource_id: &str) -> String {
    let mut name: String = resource_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert_str(0, "r_");
    }
    name
}

fn generate_plan_id() -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect();
    format!("plan-{}-{}", Utc::now().timestamp(), suffix)
}

/// How a batch handles generated plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// Generate and apply
    #[default]
    Auto,
    /// Generate plans only, leaving apply to an operator
    Manual,
}

/// Options of a batch remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Apply or only plan
    pub strategy: BatchStrategy,
    /// Remediate drifts concurrently
    pub parallel: bool,
    /// Concurrency bound in parallel mode; 0 uses the engine's `max_parallel`
    pub max_workers: usize,
    /// Simulate every apply
    pub dry_run: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            strategy: BatchStrategy::Auto,
            parallel: false,
            max_workers: 5,
            dry_run: false,
        }
    }
}

/// Outcome of one drift in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Drifted resource
    pub resource_id: String,
    /// Generated plan, if generation succeeded
    pub plan_id: Option<String>,
    /// Apply result, if an apply ran
    pub result: Option<ApplyResult>,
    /// Failure, if any
    pub error: Option<String>,
}

impl BatchItemResult {
    /// Whether the item finished without error
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Archived plan with its final outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedPlan {
    /// Plan with its final status
    pub plan: RemediationPlan,
    /// Result of the last apply, if one ran
    pub result: Option<ApplyResult>,
    /// Archive time
    pub archived_at: DateTime<Utc>,
}

/// Plans, gates and applies remediations
pub struct RemediationEngine {
    config: RemediationConfig,
    plans: RwLock<HashMap<String, RemediationPlan>>,
    impact_analyzer: ImpactAnalyzer,
    validator: PlanValidator,
    approvals: ApprovalManager,
    rollback: RollbackManager,
    executor: PlanExecutor,
    code_generator: Arc<dyn CodeGenerator>,
    audit: AuditLogger,
}

impl RemediationEngine {
    /// Create an engine invoking the real apply tool
    pub fn new(config: RemediationConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(TokioCommandRunner::new()))
    }

    /// Create an engine with an injected command runner
    pub fn with_runner(config: RemediationConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        config.validate()?;
        let work_dir = config.work_dir.clone();
        Ok(Self {
            plans: RwLock::new(HashMap::new()),
            impact_analyzer: ImpactAnalyzer::new(),
            validator: PlanValidator::new()
                .with_syntax_validator(Arc::new(TerraformSyntaxValidator::new(runner.clone()))),
            approvals: ApprovalManager::new(config.require_approval_above),
            rollback: RollbackManager::with_runner(work_dir.clone(), runner.clone()),
            executor: PlanExecutor::with_runner(work_dir, runner).with_dry_run(config.dry_run),
            code_generator: Arc::new(HclCodeGenerator::new(config.output_format)),
            audit: AuditLogger::new(config.audit_log_path()),
            config,
        })
    }

    /// Replace the code generator
    pub fn with_code_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.code_generator = generator;
        self
    }

    /// Replace the syntax validator used before real applies
    pub fn with_syntax_validator(mut self, validator: Arc<dyn SyntaxValidator>) -> Self {
        self.validator = std::mem::take(&mut self.validator).with_syntax_validator(validator);
        self
    }

    /// Add or replace a validation rule
    pub fn add_validation_rule(&mut self, rule: ValidationRule) {
        self.validator.add_rule(rule);
    }

    /// Engine settings
    pub fn config(&self) -> &RemediationConfig {
        &self.config
    }

    /// Approval state machine
    pub fn approvals(&self) -> &ApprovalManager {
        &self.approvals
    }

    /// Rollback manager
    pub fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    /// Audit trail
    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit
    }

    fn plan_path(&self, plan_id: &str) -> PathBuf {
        self.config.work_dir.join("plans").join(format!("{plan_id}.json"))
    }

    fn archive_path(&self, plan_id: &str) -> PathBuf {
        self.config.work_dir.join("archive").join(format!("{plan_id}.json"))
    }

    async fn audit<I, K, V>(&self, level: LogLevel, message: &str, context: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if let Err(e) = self.audit.log(level, message, context).await {
            warn!(error = %e, message, "Failed to write audit entry");
        }
    }

    /// Build, assess and persist the plan resolving a drift
    pub async fn generate_plan(&self, drift: &DriftItem) -> Result<RemediationPlan> {
        if drift.resource_id.trim().is_empty() {
            return Err(RemediationError::InvalidPlan(
                "drift has no resource ID".to_string(),
            ));
        }
        if drift.resource_type.trim().is_empty() {
            return Err(RemediationError::InvalidPlan(format!(
                "drift for {} has no resource type",
                drift.resource_id
            )));
        }

        let remediation_type = remediation_type_for(drift);
        let mut current_state = drift.observed_state.clone();
        let mut desired_state = drift.declared_state.clone();
        let mut changes = Vec::with_capacity(drift.changes.len());
        for drift_change in &drift.changes {
            apply_field(&mut current_state, &drift_change.field, drift_change.new_value.clone());
            apply_field(&mut desired_state, &drift_change.field, drift_change.old_value.clone());
            changes.push(Change {
                path: drift_change.field.clone(),
                action: change_action(
                    drift_change.old_value.is_some(),
                    drift_change.new_value.is_some(),
                ),
                old_value: drift_change.new_value.clone(),
                new_value: drift_change.old_value.clone(),
                sensitivity: classify_sensitivity(&drift_change.field),
            });
        }

        let resource_name = if drift.resource_name.is_empty() {
            sanitize_name(&drift.resource_id)
        } else {
            drift.resource_name.clone()
        };
        let provider = if drift.provider.is_empty() {
            drift
                .resource_type
                .split('_')
                .next()
                .unwrap_or_default()
                .to_string()
        } else {
            drift.provider.clone()
        };

        let mut plan = RemediationPlan {
            id: generate_plan_id(),
            resource_id: drift.resource_id.clone(),
            resource_type: drift.resource_type.clone(),
            resource_name,
            provider,
            remediation_type,
            current_state,
            desired_state,
            changes,
            terraform_code: String::new(),
            import_commands: Vec::new(),
            estimated_impact: None,
            requires_approval: false,
            approval_config: self.config.approval.clone(),
            status: PlanStatus::Draft,
            validation_steps: Vec::new(),
            schedule: None,
            rollback_plan: None,
            validation_errors: Vec::new(),
            created_at: Utc::now(),
        };

        plan.terraform_code = self.code_generator.generate_code(&plan)?;
        if self.config.generate_import_commands && remediation_type == RemediationType::Import {
            plan.import_commands = self.code_generator.generate_import_commands(&plan);
        }

        let impact = self.impact_analyzer.analyze(&plan);
        plan.requires_approval =
            impact.requires_approval || impact.risk_score >= self.config.require_approval_above;
        plan.status = if plan.requires_approval {
            PlanStatus::PendingApproval
        } else {
            PlanStatus::Draft
        };
        let risk_score = impact.risk_score;
        plan.estimated_impact = Some(impact);

        let mut rollback = self.rollback.create_rollback_plan(&plan);
        rollback.auto_rollback = self.config.auto_rollback;
        plan.rollback_plan = Some(rollback);

        let validation = self.validator.validate(&plan);
        plan.validation_errors = validation
            .errors
            .into_iter()
            .chain(validation.security_issues)
            .collect();

        self.save_plan(&plan).await?;

        info!(
            plan_id = %plan.id,
            resource = %plan.address(),
            remediation_type = %plan.remediation_type,
            risk_score,
            requires_approval = plan.requires_approval,
            validation_errors = plan.validation_errors.len(),
            "Remediation plan generated"
        );
        self.audit(
            LogLevel::Info,
            "Remediation plan generated",
            [
                ("plan_id", plan.id.clone()),
                ("resource_id", plan.resource_id.clone()),
                ("type", plan.remediation_type.to_string()),
                ("risk_score", format!("{risk_score:.1}")),
            ],
        )
        .await;

        Ok(plan)
    }

    /// Store a plan in memory and under `{work_dir}/plans`
    pub async fn save_plan(&self, plan: &RemediationPlan) -> Result<()> {
        write_json(&self.plan_path(&plan.id), plan).await?;
        self.plans
            .write()
            .await
            .insert(plan.id.clone(), plan.clone());
        debug!(plan_id = %plan.id, status = ?plan.status, "Plan saved");
        Ok(())
    }

    /// Load a plan from memory, falling back to disk
    pub async fn get_plan(&self, plan_id: &str) -> Result<RemediationPlan> {
        if let Some(plan) = self.plans.read().await.get(plan_id) {
            return Ok(plan.clone());
        }

        let data = match fs::read(self.plan_path(plan_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemediationError::NotFound(format!("plan {plan_id}")))
            }
            Err(e) => return Err(e.into()),
        };
        let plan: RemediationPlan = serde_json::from_slice(&data)?;
        self.plans
            .write()
            .await
            .insert(plan.id.clone(), plan.clone());
        Ok(plan)
    }

    /// Every known plan, oldest first
    pub async fn list_plans(&self) -> Result<Vec<RemediationPlan>> {
        let mut plans = self.plans.read().await.clone();

        let dir = self.config.work_dir.join("plans");
        match fs::read_dir(&dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let data = fs::read(&path).await?;
                    match serde_json::from_slice::<RemediationPlan>(&data) {
                        Ok(plan) => {
                            plans.entry(plan.id.clone()).or_insert(plan);
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable plan"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut plans: Vec<_> = plans.into_values().collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    /// Archived record of a finished plan
    pub async fn get_archived(&self, plan_id: &str) -> Result<ArchivedPlan> {
        let data = fs::read(self.archive_path(plan_id))
            .await
            .map_err(|_| RemediationError::NotFound(format!("archived plan {plan_id}")))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Run the local validation rules on a stored plan
    pub async fn validate_plan(&self, plan_id: &str) -> Result<ValidationResult> {
        let plan = self.get_plan(plan_id).await?;
        Ok(self.validator.validate(&plan))
    }

    /// Run the local rules and the syntax validator on a stored plan
    pub async fn validate_plan_comprehensive(
        &self,
        plan_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult> {
        let plan = self.get_plan(plan_id).await?;
        self.validator.validate_comprehensive(&plan, cancel).await
    }

    /// Record an approval vote on a plan
    pub async fn approve(
        &self,
        plan_id: &str,
        approver: &str,
        approve: bool,
        comment: Option<String>,
    ) -> Result<ApprovalStatus> {
        let plan = self.get_plan(plan_id).await?;
        if self.approvals.get_request(plan_id).await.is_none() {
            match self.approvals.request_approval(&plan).await {
                Ok(_) => {}
                Err(e) if e.is_approval_pending() => {}
                Err(e) => return Err(e),
            }
        }

        let status = self
            .approvals
            .add_approval(plan_id, approver, approve, comment)
            .await?;
        let plan_status = match status {
            ApprovalStatus::Approved => Some(PlanStatus::Approved),
            ApprovalStatus::Rejected => Some(PlanStatus::Rejected),
            _ => None,
        };
        if let Some(plan_status) = plan_status {
            let mut plan = plan;
            plan.status = plan_status;
            self.save_plan(&plan).await?;
        }

        self.audit(
            if approve { LogLevel::Info } else { LogLevel::Warn },
            "Approval vote recorded",
            [
                ("plan_id", plan_id.to_string()),
                ("approver", approver.to_string()),
                ("approve", approve.to_string()),
                ("status", format!("{status:?}")),
            ],
        )
        .await;
        Ok(status)
    }

    /// Apply a plan using the configured dry-run setting
    pub async fn apply_plan(&self, plan_id: &str, cancel: &CancellationToken) -> Result<ApplyResult> {
        self.apply_plan_with(plan_id, self.config.dry_run, cancel)
            .await
    }

    /// Apply a plan
    ///
    /// Refuses plans outside their schedule, plans failing validation and
    /// plans the approval gate holds back. Backs up before mutating. On
    /// failure with auto-rollback the rollback runs on its own token; a
    /// successful rollback still returns the original failure, a failed one
    /// returns [`RemediationError::RollbackFailed`].
    pub async fn apply_plan_with(
        &self,
        plan_id: &str,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult> {
        let plan = self.get_plan(plan_id).await?;
        Self::ensure_applicable(&plan)?;

        if let Some(schedule) = &plan.schedule {
            if !schedule.contains(Utc::now()) {
                warn!(plan_id, "Apply refused outside the scheduled window");
                self.audit(
                    LogLevel::Warn,
                    "Apply refused outside schedule",
                    [("plan_id", plan_id)],
                )
                .await;
                return Err(RemediationError::OutsideSchedule(plan.id));
            }
        }

        if self.config.validate_before_apply {
            // a dry run never reaches an external tool, not even the validator
            let validation = if dry_run {
                self.validator.validate(&plan)
            } else {
                self.validator.validate_comprehensive(&plan, cancel).await?
            };
            if !validation.valid {
                let errors: Vec<String> = validation
                    .errors
                    .into_iter()
                    .chain(validation.security_issues)
                    .collect();
                warn!(plan_id, errors = errors.len(), "Plan failed validation");
                self.audit(
                    LogLevel::Error,
                    "Plan failed validation",
                    [("plan_id", plan_id.to_string()), ("errors", errors.join("; "))],
                )
                .await;
                return Err(RemediationError::ValidationFailed { errors });
            }
        }

        if let Err(e) = self.approvals.request_approval(&plan).await {
            self.audit(
                LogLevel::Warn,
                "Plan held by approval gate",
                [("plan_id", plan_id.to_string()), ("reason", e.to_string())],
            )
            .await;
            return Err(e);
        }

        let (plan, previous) = self.claim_for_apply(plan_id).await?;

        if !dry_run && self.config.backup_before_apply {
            let backup = self.rollback.create_backup(&plan).await.map_err(|e| match e {
                RemediationError::BackupFailed(_) => e,
                other => RemediationError::BackupFailed(other.to_string()),
            });
            let location = match backup {
                Ok(location) => location,
                Err(e) => {
                    self.release(plan, previous).await;
                    return Err(e);
                }
            };
            self.audit(
                LogLevel::Info,
                "Backup created",
                [
                    ("plan_id", plan_id.to_string()),
                    ("location", location.display().to_string()),
                ],
            )
            .await;
        }

        info!(plan_id, dry_run, resource = %plan.address(), "Applying remediation plan");
        self.audit(
            LogLevel::Info,
            "Applying remediation plan",
            [("plan_id", plan_id.to_string()), ("dry_run", dry_run.to_string())],
        )
        .await;

        match self.executor.execute_with(&plan, dry_run, cancel).await {
            Ok(result) => {
                self.finalize(plan, PlanStatus::Applied, Some(&result)).await;
                self.audit(
                    LogLevel::Info,
                    "Remediation plan applied",
                    [("plan_id", plan_id.to_string()), ("dry_run", dry_run.to_string())],
                )
                .await;
                Ok(result)
            }
            Err(failure) => self.recover(plan, failure, dry_run).await,
        }
    }

    fn ensure_applicable(plan: &RemediationPlan) -> Result<()> {
        match plan.status {
            status if status.is_applicable() => Ok(()),
            PlanStatus::Rejected => Err(RemediationError::ApprovalRejected(plan.id.clone())),
            status => Err(RemediationError::InvalidState {
                plan_id: plan.id.clone(),
                status,
            }),
        }
    }

    /// Move a plan to `Applying` unless another apply already owns it
    ///
    /// Returns the claimed plan and the status it was claimed from.
    async fn claim_for_apply(&self, plan_id: &str) -> Result<(RemediationPlan, PlanStatus)> {
        let mut plans = self.plans.write().await;
        let plan = plans
            .get_mut(plan_id)
            .ok_or_else(|| RemediationError::NotFound(format!("plan {plan_id}")))?;
        Self::ensure_applicable(plan)?;

        let previous = plan.status;
        plan.status = PlanStatus::Applying;
        if let Err(e) = write_json(&self.plan_path(plan_id), &*plan).await {
            plan.status = previous;
            return Err(e);
        }
        debug!(plan_id, from = ?previous, "Plan claimed for apply");
        Ok((plan.clone(), previous))
    }

    /// Hand a claimed plan back when the apply stops before executing
    async fn release(&self, mut plan: RemediationPlan, previous: PlanStatus) {
        plan.status = previous;
        if let Err(e) = self.save_plan(&plan).await {
            warn!(plan_id = %plan.id, error = %e, "Failed to release plan");
        }
    }

    async fn recover(
        &self,
        plan: RemediationPlan,
        failure: RemediationError,
        dry_run: bool,
    ) -> Result<ApplyResult> {
        let failed_result = match &failure {
            RemediationError::ExecutionFailed { result, .. } => Some(result.as_ref().clone()),
            _ => None,
        };
        let plan_id = plan.id.clone();

        let rollback = plan
            .rollback_plan
            .clone()
            .filter(|r| r.auto_rollback && self.config.auto_rollback && !dry_run);
        let Some(rollback) = rollback else {
            error!(plan_id = %plan_id, error = %failure, "Remediation failed");
            self.finalize(plan, PlanStatus::Failed, failed_result.as_ref()).await;
            self.audit(
                LogLevel::Error,
                "Remediation plan failed",
                [("plan_id", plan_id), ("error", failure.to_string())],
            )
            .await;
            return Err(failure);
        };

        warn!(plan_id = %plan_id, error = %failure, rollback_id = %rollback.id, "Apply failed, rolling back");
        // the caller's token may already be cancelled; the rollback must finish
        match self
            .rollback
            .execute_rollback(&rollback, &CancellationToken::new())
            .await
        {
            Ok(_) => {
                self.finalize(plan, PlanStatus::RolledBack, failed_result.as_ref()).await;
                self.audit(
                    LogLevel::Warn,
                    "Remediation plan rolled back",
                    [("plan_id", plan_id), ("error", failure.to_string())],
                )
                .await;
                Err(failure)
            }
            Err(rollback_error) => {
                error!(plan_id = %plan_id, error = %rollback_error, "Rollback failed, infrastructure may be inconsistent");
                self.finalize(plan, PlanStatus::Failed, failed_result.as_ref()).await;
                self.audit(
                    LogLevel::Error,
                    "Rollback failed",
                    [
                        ("plan_id", plan_id),
                        ("error", failure.to_string()),
                        ("rollback_error", rollback_error.to_string()),
                    ],
                )
                .await;
                Err(rollback_error)
            }
        }
    }

    async fn finalize(&self, mut plan: RemediationPlan, status: PlanStatus, result: Option<&ApplyResult>) {
        plan.status = status;
        if let Err(e) = self.save_plan(&plan).await {
            warn!(plan_id = %plan.id, error = %e, "Failed to persist final plan status");
        }
        let path = self.archive_path(&plan.id);
        let record = ArchivedPlan {
            plan,
            result: result.cloned(),
            archived_at: Utc::now(),
        };
        if let Err(e) = write_json(&path, &record).await {
            warn!(plan_id = %record.plan.id, error = %e, "Failed to archive plan");
        }
    }

    /// Remediate many drifts, returning one result per drift in input order
    pub async fn batch_remediate(
        self: &Arc<Self>,
        drifts: Vec<DriftItem>,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> Vec<BatchItemResult> {
        let dry_run = options.dry_run || self.config.dry_run;
        let strategy = options.strategy;
        let max_workers = match options.max_workers {
            0 => self.config.max_parallel,
            n => n,
        };
        info!(
            drifts = drifts.len(),
            parallel = options.parallel,
            max_workers,
            strategy = ?strategy,
            dry_run,
            "Starting batch remediation"
        );

        if !options.parallel {
            let mut results = Vec::with_capacity(drifts.len());
            for drift in drifts {
                results.push(self.remediate_one(drift, strategy, dry_run, cancel).await);
            }
            return results;
        }

        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let (resource_ids, handles): (Vec<_>, Vec<_>) = drifts
            .into_iter()
            .map(|drift| {
                let engine = Arc::clone(self);
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let resource_id = drift.resource_id.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    engine.remediate_one(drift, strategy, dry_run, &cancel).await
                });
                (resource_id, handle)
            })
            .unzip();

        join_all(handles)
            .await
            .into_iter()
            .zip(resource_ids)
            .map(|(joined, resource_id)| {
                joined.unwrap_or_else(|e| BatchItemResult {
                    resource_id,
                    plan_id: None,
                    result: None,
                    error: Some(format!("remediation task failed: {e}")),
                })
            })
            .collect()
    }

    async fn remediate_one(
        &self,
        drift: DriftItem,
        strategy: BatchStrategy,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> BatchItemResult {
        let plan = match self.generate_plan(&drift).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(resource_id = %drift.resource_id, error = %e, "Plan generation failed");
                return BatchItemResult {
                    resource_id: drift.resource_id,
                    plan_id: None,
                    result: None,
                    error: Some(e.to_string()),
                };
            }
        };

        if strategy == BatchStrategy::Manual {
            return BatchItemResult {
                resource_id: drift.resource_id,
                plan_id: Some(plan.id),
                result: None,
                error: None,
            };
        }

        match self.apply_plan_with(&plan.id, dry_run, cancel).await {
            Ok(result) => BatchItemResult {
                resource_id: drift.resource_id,
                plan_id: Some(plan.id),
                result: Some(result),
                error: None,
            },
            Err(e) => {
                let result = match &e {
                    RemediationError::ExecutionFailed { result, .. }
                    | RemediationError::RollbackFailed { result, .. } => Some(result.as_ref().clone()),
                    _ => None,
                };
                BatchItemResult {
                    resource_id: drift.resource_id,
                    plan_id: Some(plan.id),
                    result,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Express a plan as a workflow with automatic rollback
    ///
    /// Steps: backup, validate, plan, apply, health check. The rollback
    /// restores the backup and re-applies the rollback configuration. The
    /// returned context carries the observed state the backup step snapshots.
    pub async fn build_workflow(&self, plan_id: &str) -> Result<(Workflow, WorkflowContext)> {
        let plan = self.get_plan(plan_id).await?;
        Self::ensure_applicable(&plan)?;
        let validation = self.validator.validate(&plan);
        if !validation.valid {
            return Err(RemediationError::ValidationFailed {
                errors: validation
                    .errors
                    .into_iter()
                    .chain(validation.security_issues)
                    .collect(),
            });
        }
        self.approvals.request_approval(&plan).await?;

        let root = self.config.work_dir.join("workflows").join(&plan.id);
        let workspace = root.join("workspace");
        let rollback_workspace = root.join("rollback");
        let backup_dir = root.join("backups").display().to_string();
        fs::create_dir_all(&workspace).await?;
        fs::write(
            workspace.join(config_file_name(&plan.terraform_code)),
            &plan.terraform_code,
        )
        .await?;
        fs::create_dir_all(&rollback_workspace).await?;
        let rollback_code = plan
            .rollback_plan
            .as_ref()
            .map(|r| r.rollback_code.clone())
            .unwrap_or_else(|| RollbackManager::rollback_code(&plan));
        fs::write(
            rollback_workspace.join(config_file_name(&rollback_code)),
            &rollback_code,
        )
        .await?;

        let address = plan.address();
        let dir = workspace.display().to_string();
        let workflow = Workflow::new(
            format!("remediate-{}", plan.id),
            format!("Remediate {address}"),
        )
        .with_step(
            WorkflowStep::new("backup", "Back up current state", StepAction::BackupResource)
                .with_resource(&address)
                .with_parameter("backup_dir", backup_dir.clone()),
        )
        .with_step(
            WorkflowStep::new("validate", "Validate configuration", StepAction::ValidateConfiguration)
                .with_parameter("working_dir", dir.clone()),
        )
        .with_step(
            WorkflowStep::new("plan", "Plan changes", StepAction::TerraformPlan)
                .with_resource(&address)
                .with_parameter("working_dir", dir.clone()),
        )
        .with_step(
            WorkflowStep::new("apply", "Apply changes", StepAction::TerraformApply)
                .with_resource(&address)
                .with_parameter("working_dir", dir.clone()),
        )
        .with_step(
            WorkflowStep::new("health_check", "Verify resource", StepAction::HealthCheck)
                .with_parameter("working_dir", dir)
                .with_parameter("command", format!("terraform state show {address}")),
        )
        .with_rollback(
            vec![
                WorkflowStep::new("restore", "Restore backup", StepAction::RestoreResource)
                    .with_resource(&address)
                    .with_parameter("backup_dir", backup_dir),
                WorkflowStep::new(
                    "rollback_apply",
                    "Re-apply previous configuration",
                    StepAction::TerraformApply,
                )
                .with_parameter("working_dir", rollback_workspace.display().to_string()),
            ],
            self.config.auto_rollback,
        );

        let context = WorkflowContext::new("driftmgr")
            .with_parameter("plan_id", plan.id.clone())
            .with_parameter("remediation_type", plan.remediation_type.as_str())
            .with_state(address, to_json(&plan.current_state));

        debug!(plan_id, workflow_id = %workflow.id, "Remediation workflow built");
        Ok((workflow, context))
    }
}
