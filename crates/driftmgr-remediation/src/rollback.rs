//! Rollback plans, pre-apply backups and rollback execution

use crate::codegen::{config_file_name, render_key, render_value};
use crate::error::{RemediationError, Result};
use crate::models::{
    ApplyResult, LogLevel, OnFailure, RemediationPlan, RemediationType, RollbackPlan, RollbackStep,
};
use chrono::{DateTime, Utc};
use driftmgr_workflows::{CommandRunner, CommandSpec, TokioCommandRunner, WorkflowError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CURRENT_STATE_FILE: &str = "current_state.json";
const PLAN_FILE: &str = "plan.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Digest manifest written next to a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Plan the backup belongs to
    pub plan_id: String,
    /// Backup time
    pub created_at: DateTime<Utc>,
    /// SHA-256 hex digest per file name
    pub files: BTreeMap<String, String>,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Derives, persists and executes rollbacks
pub struct RollbackManager {
    work_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl RollbackManager {
    /// Create a manager rooted at `work_dir` using the system command runner
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(work_dir, Arc::new(TokioCommandRunner::new()))
    }

    /// Create a manager with an injected command runner
    pub fn with_runner(work_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            work_dir: work_dir.into(),
            runner,
        }
    }

    /// Directory holding the backup of a plan
    pub fn backup_dir(&self, plan_id: &str) -> PathBuf {
        self.work_dir.join("rollback-backups").join(plan_id)
    }

    /// Derive the inverse of a plan
    pub fn create_rollback_plan(&self, plan: &RemediationPlan) -> RollbackPlan {
        let address = plan.address();
        let step = match plan.remediation_type {
            RemediationType::Create => RollbackStep {
                order: 1,
                description: "Delete created resource".to_string(),
                command: format!("terraform destroy -target={address} -auto-approve"),
                validation: Some("terraform state list".to_string()),
                on_failure: OnFailure::Abort,
            },
            RemediationType::Delete => RollbackStep {
                order: 1,
                description: "Restore deleted resource".to_string(),
                command: "terraform apply -auto-approve".to_string(),
                validation: Some(format!("terraform state show {address}")),
                on_failure: OnFailure::Abort,
            },
            RemediationType::Update | RemediationType::Replace | RemediationType::Import => {
                RollbackStep {
                    order: 1,
                    description: "Restore previous configuration".to_string(),
                    command: "terraform apply -auto-approve".to_string(),
                    validation: Some("terraform plan -detailed-exitcode".to_string()),
                    on_failure: OnFailure::Retry,
                }
            }
        };

        let now = Utc::now();
        RollbackPlan {
            id: format!("rollback-{}", plan.id),
            plan_id: plan.id.clone(),
            snapshot_id: format!("snapshot-{}-{}", plan.id, now.timestamp()),
            backup_location: self.backup_dir(&plan.id),
            rollback_steps: vec![step],
            estimated_time: Duration::from_secs(5 * 60),
            auto_rollback: true,
            rollback_code: Self::rollback_code(plan),
            created_at: now,
        }
    }

    /// Configuration restoring the observed state of a plan
    pub fn rollback_code(plan: &RemediationPlan) -> String {
        let mut code = format!("# Rollback configuration for plan: {}\n\n", plan.id);
        let _ = writeln!(
            code,
            "resource \"{}\" \"{}\" {{",
            plan.resource_type, plan.resource_name
        );
        for (key, value) in &plan.current_state {
            let _ = writeln!(code, "  {} = {}", render_key(key), render_value(value, 1));
        }
        code.push_str("}\n");
        code
    }

    /// Persist the observed state and the plan before any mutation
    pub async fn create_backup(&self, plan: &RemediationPlan) -> Result<PathBuf> {
        let dir = self.backup_dir(&plan.id);
        fs::create_dir_all(&dir).await.map_err(|e| {
            RemediationError::BackupFailed(format!("cannot create {}: {e}", dir.display()))
        })?;

        let state = serde_json::to_vec_pretty(&plan.current_state)?;
        let plan_json = serde_json::to_vec_pretty(plan)?;

        let mut files = BTreeMap::new();
        for (name, data) in [(CURRENT_STATE_FILE, &state), (PLAN_FILE, &plan_json)] {
            fs::write(dir.join(name), data).await.map_err(|e| {
                RemediationError::BackupFailed(format!("cannot write {name}: {e}"))
            })?;
            files.insert(name.to_string(), sha256_hex(data));
        }

        let manifest = BackupManifest {
            plan_id: plan.id.clone(),
            created_at: Utc::now(),
            files,
        };
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)
            .await
            .map_err(|e| RemediationError::BackupFailed(format!("cannot write manifest: {e}")))?;

        info!(plan_id = %plan.id, location = %dir.display(), "Backup created");
        Ok(dir)
    }

    /// Recompute backup digests against the manifest
    pub async fn verify_backup(&self, plan_id: &str) -> Result<BackupManifest> {
        let dir = self.backup_dir(plan_id);
        let manifest_raw = fs::read(dir.join(MANIFEST_FILE))
            .await
            .map_err(|_| RemediationError::NotFound(format!("backup for plan {plan_id}")))?;
        let manifest: BackupManifest = serde_json::from_slice(&manifest_raw)?;

        for (name, expected) in &manifest.files {
            let data = fs::read(dir.join(name))
                .await
                .map_err(|e| RemediationError::BackupFailed(format!("cannot read {name}: {e}")))?;
            let actual = sha256_hex(&data);
            if &actual != expected {
                warn!(plan_id, file = %name, "Backup digest mismatch");
                return Err(RemediationError::BackupFailed(format!(
                    "digest mismatch for {name}"
                )));
            }
        }
        Ok(manifest)
    }

    /// Load the observed state recorded by a backup
    pub async fn load_backup_state(&self, plan_id: &str) -> Result<crate::state::StateMap> {
        self.verify_backup(plan_id).await?;
        let data = fs::read(self.backup_dir(plan_id).join(CURRENT_STATE_FILE)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Run a rollback plan step by step
    ///
    /// An `abort` failure (or a `retry` failure that fails again) returns
    /// [`RemediationError::RollbackFailed`] carrying the partial result.
    pub async fn execute_rollback(
        &self,
        rollback: &RollbackPlan,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult> {
        let mut result = ApplyResult::new(rollback.id.clone(), false);
        let workspace = self.work_dir.join("rollbacks").join(&rollback.id);
        fs::create_dir_all(&workspace).await?;
        if !rollback.rollback_code.is_empty() {
            let file = config_file_name(&rollback.rollback_code);
            fs::write(workspace.join(file), &rollback.rollback_code).await?;
        }

        info!(rollback_id = %rollback.id, plan_id = %rollback.plan_id, steps = rollback.rollback_steps.len(), "Executing rollback");

        let mut steps: Vec<&RollbackStep> = rollback.rollback_steps.iter().collect();
        steps.sort_by_key(|s| s.order);

        for step in steps {
            let Err(first) = self.execute_step(step, &workspace, &mut result, cancel).await else {
                continue;
            };

            let outcome = match step.on_failure {
                OnFailure::Continue if !first.is_cancellation() => {
                    warn!(rollback_id = %rollback.id, order = step.order, error = %first, "Rollback step failed, continuing");
                    result.warnings.push(first.to_string());
                    result.log(LogLevel::Warn, first.to_string(), [("order", step.order.to_string())]);
                    Ok(())
                }
                OnFailure::Retry if !first.is_cancellation() => {
                    warn!(rollback_id = %rollback.id, order = step.order, error = %first, "Retrying rollback step");
                    result.log(LogLevel::Warn, first.to_string(), [("order", step.order.to_string())]);
                    self.execute_step(step, &workspace, &mut result, cancel).await
                }
                _ => Err(first),
            };

            if let Err(e) = outcome {
                error!(rollback_id = %rollback.id, order = step.order, error = %e, "Rollback failed");
                let message = e.to_string();
                result.fail(message.clone());
                result.log(LogLevel::Error, message.clone(), [("order", step.order.to_string())]);
                result.finish();
                return Err(RemediationError::RollbackFailed {
                    result: Box::new(result),
                    message,
                });
            }
        }

        result.finish();
        info!(rollback_id = %rollback.id, elapsed_ms = result.execution_time.as_millis() as u64, "Rollback completed");
        Ok(result)
    }

    async fn execute_step(
        &self,
        step: &RollbackStep,
        workspace: &Path,
        result: &mut ApplyResult,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), WorkflowError> {
        let message = format!("Executing rollback step {}: {}", step.order, step.description);
        debug!(order = step.order, command = %step.command, "{}", message);
        result.log(LogLevel::Info, message, [("command", step.command.clone())]);

        let spec = CommandSpec::parse(&step.command, workspace)?;
        let output = self.runner.run(&spec, cancel).await?;
        if !output.output.is_empty() {
            result.log(LogLevel::Debug, output.output.clone(), [("command", spec.display())]);
        }
        if !output.success() {
            return Err(WorkflowError::StepFailed(format!(
                "rollback step {} failed: {}",
                step.order,
                output.output.trim()
            )));
        }

        if let Some(validation) = &step.validation {
            let spec = CommandSpec::parse(validation, workspace)?;
            let output = self.runner.run(&spec, cancel).await?;
            if !output.success() {
                return Err(WorkflowError::StepFailed(format!(
                    "rollback validation failed for step {}: {}",
                    step.order,
                    output.output.trim()
                )));
            }
        }
        Ok(())
    }
}
