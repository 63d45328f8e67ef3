//! Applies remediation plans through the external apply tool

use crate::codegen::config_file_name;
use crate::error::{RemediationError, Result};
use crate::models::{ApplyResult, LogLevel, RemediationPlan, ValidationStep};
use driftmgr_workflows::{CommandRunner, CommandSpec, TokioCommandRunner, WorkflowError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs `init → plan → apply` for a plan in an isolated workspace
pub struct PlanExecutor {
    work_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    dry_run: bool,
}

impl PlanExecutor {
    /// Create an executor rooted at `work_dir` using the system command runner
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(work_dir, Arc::new(TokioCommandRunner::new()))
    }

    /// Create an executor with an injected command runner
    pub fn with_runner(work_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            work_dir: work_dir.into(),
            runner,
            dry_run: false,
        }
    }

    /// Simulate every execution
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Workspace of a plan's execution
    pub fn execution_dir(&self, plan_id: &str) -> PathBuf {
        self.work_dir.join("executions").join(plan_id)
    }

    /// Location of a plan's persisted result
    pub fn result_path(&self, plan_id: &str) -> PathBuf {
        self.work_dir.join("results").join(format!("{plan_id}.json"))
    }

    /// Apply a plan using the executor's dry-run setting
    pub async fn execute(&self, plan: &RemediationPlan, cancel: &CancellationToken) -> Result<ApplyResult> {
        self.execute_with(plan, self.dry_run, cancel).await
    }

    /// Apply a plan
    ///
    /// A dry run records every change as applied without running any
    /// command. On tool failure every change is reported failed and
    /// [`RemediationError::ExecutionFailed`] carries the result.
    pub async fn execute_with(
        &self,
        plan: &RemediationPlan,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult> {
        let mut result = ApplyResult::new(plan.id.clone(), dry_run);
        result.log(
            LogLevel::Info,
            "Starting plan execution",
            [("plan_id", plan.id.as_str()), ("resource", plan.address().as_str())],
        );

        if dry_run {
            info!(plan_id = %plan.id, changes = plan.changes.len(), "Dry run, no changes applied");
            result.applied_changes = plan.changes.clone();
            result.log(
                LogLevel::Info,
                "Dry run: no changes applied",
                [("changes", plan.changes.len().to_string())],
            );
            result.finish();
            self.save_result(&result).await;
            return Ok(result);
        }

        match self.apply(plan, &mut result, cancel).await {
            Ok(()) => {
                result.applied_changes = plan.changes.clone();
                self.run_validation_steps(plan, &mut result, cancel).await;
                result.finish();
                info!(
                    plan_id = %plan.id,
                    elapsed_ms = result.execution_time.as_millis() as u64,
                    warnings = result.warnings.len(),
                    "Plan applied"
                );
                self.save_result(&result).await;
                Ok(result)
            }
            Err(e) if e.is_cancellation() => {
                warn!(plan_id = %plan.id, "Plan execution cancelled");
                result.failed_changes = plan.changes.clone();
                result.fail(e.to_string());
                result.finish();
                self.save_result(&result).await;
                Err(RemediationError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                error!(plan_id = %plan.id, error = %message, "Plan execution failed");
                result.failed_changes = plan.changes.clone();
                result.fail(message.clone());
                result.log(LogLevel::Error, message.clone(), [("plan_id", plan.id.as_str())]);
                result.finish();
                self.save_result(&result).await;
                Err(RemediationError::ExecutionFailed {
                    result: Box::new(result),
                    message,
                })
            }
        }
    }

    async fn apply(
        &self,
        plan: &RemediationPlan,
        result: &mut ApplyResult,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), WorkflowError> {
        let workspace = self.execution_dir(&plan.id);
        fs::create_dir_all(&workspace).await?;
        let file = config_file_name(&plan.terraform_code);
        fs::write(workspace.join(file), &plan.terraform_code).await?;

        for args in [
            &["init", "-input=false"][..],
            &["plan", "-input=false", "-out=tfplan"][..],
            &["apply", "-auto-approve", "tfplan"][..],
        ] {
            let spec = CommandSpec::new("terraform", args.iter().copied(), &workspace);
            self.run_logged(&spec, result, cancel).await?;
        }

        let show = CommandSpec::new("terraform", ["show", "-json"], &workspace);
        match self.runner.run(&show, cancel).await {
            Ok(output) if output.success() => {
                result.final_state = serde_json::from_str(&output.output).ok();
            }
            Ok(output) => debug!(plan_id = %plan.id, output = %output.output, "Final state unavailable"),
            Err(e) => debug!(plan_id = %plan.id, error = %e, "Final state unavailable"),
        }
        Ok(())
    }

    async fn run_logged(
        &self,
        spec: &CommandSpec,
        result: &mut ApplyResult,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), WorkflowError> {
        let command = spec.display();
        debug!(command = %command, "Running apply tool");
        result.log(LogLevel::Info, format!("Running {command}"), [("command", command.as_str())]);

        let output = self.runner.run(spec, cancel).await?;
        let level = if output.success() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        if !output.output.is_empty() {
            result.log(level, output.output.clone(), [("command", command.as_str())]);
        }
        output.into_result(spec).map(|_| ())
    }

    async fn run_validation_steps(
        &self,
        plan: &RemediationPlan,
        result: &mut ApplyResult,
        cancel: &CancellationToken,
    ) {
        let workspace = self.execution_dir(&plan.id);
        let mut steps: Vec<&ValidationStep> = plan.validation_steps.iter().collect();
        steps.sort_by_key(|s| s.order);

        for step in steps {
            let outcome = match CommandSpec::parse(&step.command, &workspace) {
                Ok(spec) => self.run_logged(&spec, result, cancel).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                let warning = format!(
                    "validation step {} ({}) failed: {e}",
                    step.order, step.description
                );
                warn!(plan_id = %plan.id, order = step.order, "{}", warning);
                result.warnings.push(warning);
            }
        }
    }

    async fn save_result(&self, result: &ApplyResult) {
        if let Err(e) = write_json(&self.result_path(&result.plan_id), result).await {
            warn!(plan_id = %result.plan_id, error = %e, "Failed to persist apply result");
        }
    }
}

pub(crate) async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?).await?;
    Ok(())
}
