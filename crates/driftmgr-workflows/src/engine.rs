//! Workflow execution engine

use crate::actions::{ActionHandler, StandardActionHandler};
use crate::condition::ConditionEvaluator;
use crate::error::{Result, WorkflowError};
use crate::models::{
    RollbackResult, StepAction, StepResult, StepStatus, Workflow, WorkflowContext,
    WorkflowMetrics, WorkflowResult, WorkflowStatus, WorkflowStep,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unit of the linear retry backoff; attempt `n` sleeps `n * retry_backoff`
    pub retry_backoff: Duration,
    /// Timeout applied to workflows registered without one
    pub default_timeout: Duration,
    /// Retry budget applied to workflows registered without one
    pub default_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(1),
            default_timeout: Duration::from_secs(30 * 60),
            default_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Set the retry backoff unit
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Handle to a running or finished execution
///
/// The result is mutated only by the task running the execution; the handle
/// reads snapshots and can await the terminal state.
#[derive(Clone)]
pub struct WorkflowExecution {
    execution_id: String,
    result: Arc<RwLock<WorkflowResult>>,
    done: watch::Receiver<bool>,
}

impl WorkflowExecution {
    /// Execution identifier
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Current copy of the result
    pub async fn snapshot(&self) -> WorkflowResult {
        self.result.read().await.clone()
    }

    /// Whether the execution reached a terminal state
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait for the terminal state and return the final result
    pub async fn wait(&self) -> WorkflowResult {
        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.snapshot().await
    }
}

/// Runs individual steps with retry, timeout and condition handling
#[derive(Clone)]
struct StepRunner {
    handler: Arc<dyn ActionHandler>,
    retry_backoff: Duration,
}

impl StepRunner {
    async fn execute_step(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
        cancel: &CancellationToken,
        default_retries: u32,
    ) -> StepResult {
        let mut result = StepResult::started(&step.id);

        if let Some(condition) = &step.condition {
            if !ConditionEvaluator::evaluate(condition, context) {
                debug!(step_id = %step.id, "Step condition not met, skipping");
                result.finish(StepStatus::Skipped);
                return result;
            }
        }

        if let StepAction::Unknown(name) = &step.action {
            error!(step_id = %step.id, action = %name, "Unknown step action");
            result.attempts = 1;
            result.error = Some(WorkflowError::UnknownAction(name.clone()).to_string());
            result.finish(StepStatus::Failed);
            return result;
        }

        let retries = step.retries.unwrap_or(default_retries);
        for attempt in 0..=retries {
            result.retries = attempt;

            if cancel.is_cancelled() {
                result.error = Some(WorkflowError::Cancelled.to_string());
                result.finish(StepStatus::Failed);
                return result;
            }

            result.attempts = attempt + 1;
            debug!(step_id = %step.id, attempt = attempt + 1, "Executing step");

            let outcome = match step.timeout_ms {
                Some(ms) => {
                    match tokio::time::timeout(
                        Duration::from_millis(ms),
                        self.handler.execute(step, context, cancel),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(WorkflowError::Timeout { seconds: ms / 1000 }),
                    }
                }
                None => self.handler.execute(step, context, cancel).await,
            };

            match outcome {
                Ok(output) => {
                    result.output = output;
                    result.error = None;
                    result.finish(StepStatus::Completed);
                    return result;
                }
                Err(e) => {
                    let cancelled = e.is_cancellation() || cancel.is_cancelled();
                    result.error = Some(if cancelled {
                        WorkflowError::Cancelled.to_string()
                    } else {
                        e.to_string()
                    });

                    if cancelled || attempt == retries {
                        warn!(step_id = %step.id, attempts = attempt + 1, error = %e, "Step failed");
                        result.finish(StepStatus::Failed);
                        return result;
                    }

                    let delay = self.retry_backoff * (attempt + 1);
                    warn!(
                        step_id = %step.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            result.error = Some(WorkflowError::Cancelled.to_string());
                            result.finish(StepStatus::Failed);
                            return result;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        result.finish(StepStatus::Failed);
        result
    }

    /// Run forward steps in declaration order
    ///
    /// Sequential results are published as they finish; parallel steps are
    /// joined before returning.
    async fn execute_steps(
        &self,
        workflow: &Arc<Workflow>,
        context: &Arc<WorkflowContext>,
        cancel: &CancellationToken,
        result: &Arc<RwLock<WorkflowResult>>,
    ) -> Vec<StepResult> {
        let default_retries = workflow.retries.unwrap_or(0);
        let mut sequential = Vec::new();
        let mut handles = Vec::new();

        for step in &workflow.steps {
            if step.parallel {
                let handle = self.spawn_step(step, context, cancel, default_retries);
                handles.push((step.id.clone(), handle));
                continue;
            }

            let step_result = self
                .execute_isolated(step, context, cancel, default_retries)
                .await;
            let stop = step_result.status == StepStatus::Failed && step.required;
            result.write().await.steps.push(step_result.clone());
            sequential.push(step_result);

            if stop {
                info!(step_id = %step.id, "Required step failed, stopping sequential execution");
                break;
            }
        }

        let mut all = sequential;
        for (step_id, handle) in handles {
            let step_result = Self::joined(&step_id, handle.await);
            result.write().await.steps.push(step_result.clone());
            all.push(step_result);
        }
        all
    }

    /// Run a step on its own task so a panicking handler fails only the step
    fn spawn_step(
        &self,
        step: &WorkflowStep,
        context: &Arc<WorkflowContext>,
        cancel: &CancellationToken,
        default_retries: u32,
    ) -> JoinHandle<StepResult> {
        let runner = self.clone();
        let step = step.clone();
        let context = Arc::clone(context);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            runner
                .execute_step(&step, &context, &cancel, default_retries)
                .await
        })
    }

    async fn execute_isolated(
        &self,
        step: &WorkflowStep,
        context: &Arc<WorkflowContext>,
        cancel: &CancellationToken,
        default_retries: u32,
    ) -> StepResult {
        let handle = self.spawn_step(step, context, cancel, default_retries);
        Self::joined(&step.id, handle.await)
    }

    fn joined(step_id: &str, joined: std::result::Result<StepResult, JoinError>) -> StepResult {
        match joined {
            Ok(step_result) => step_result,
            Err(e) => {
                error!(step_id = %step_id, error = %e, "Step task aborted");
                let mut failed = StepResult::started(step_id);
                failed.attempts = 1;
                failed.error = Some(format!("step task aborted: {e}"));
                failed.finish(StepStatus::Failed);
                failed
            }
        }
    }

    async fn execute_rollback(
        &self,
        workflow: &Workflow,
        context: &Arc<WorkflowContext>,
    ) -> RollbackResult {
        let started_at = Utc::now();
        let steps = workflow
            .rollback
            .as_ref()
            .map(|r| r.steps.as_slice())
            .unwrap_or_default();
        let default_retries = workflow.retries.unwrap_or(0);
        // Rollback runs to completion even if the forward request was cancelled
        let cancel = CancellationToken::new();

        info!(workflow_id = %workflow.id, steps = steps.len(), "Starting workflow rollback");

        let mut results = Vec::with_capacity(steps.len());
        let mut failure = None;
        for step in steps {
            let step_result = self
                .execute_isolated(step, context, &cancel, default_retries)
                .await;
            let failed = step_result.status == StepStatus::Failed;
            results.push(step_result);
            if failed {
                failure = Some(format!("rollback step {} failed", step.id));
                break;
            }
        }

        let completed_at = Utc::now();
        let status = if failure.is_none() {
            info!(workflow_id = %workflow.id, "Workflow rollback completed");
            StepStatus::Completed
        } else {
            error!(workflow_id = %workflow.id, error = ?failure, "Workflow rollback failed");
            StepStatus::Failed
        };

        RollbackResult {
            status,
            steps: results,
            started_at,
            completed_at: Some(completed_at),
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            error: failure,
        }
    }
}

/// Central coordinator for workflow registration and execution
///
/// Owns the definition registry and the execution records, each behind its
/// own lock. Executions run on spawned tasks; callers get a handle back
/// immediately.
pub struct WorkflowEngine {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    executions: RwLock<HashMap<String, WorkflowExecution>>,
    metrics: Arc<RwLock<HashMap<String, WorkflowMetrics>>>,
    runner: StepRunner,
    config: EngineConfig,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowEngine {
    /// Create an engine with the standard action handler
    pub fn new() -> Self {
        Self::with_handler(Arc::new(StandardActionHandler::default()), EngineConfig::default())
    }

    /// Create an engine with a custom action handler
    pub fn with_handler(handler: Arc<dyn ActionHandler>, config: EngineConfig) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            metrics: Arc::new(RwLock::new(HashMap::new())),
            runner: StepRunner {
                handler,
                retry_backoff: config.retry_backoff,
            },
            config,
        }
    }

    /// Register a workflow definition
    ///
    /// Fills the default timeout and retry budget when unset.
    pub async fn register_workflow(&self, mut workflow: Workflow) -> Result<()> {
        if workflow.id.trim().is_empty() {
            return Err(WorkflowError::Invalid("workflow ID cannot be empty".to_string()));
        }
        Self::validate_steps(&workflow)?;

        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(WorkflowError::AlreadyExists(workflow.id));
        }

        let now = Utc::now();
        workflow.created_at = Some(now);
        workflow.updated_at = Some(now);
        workflow
            .timeout_ms
            .get_or_insert(self.config.default_timeout.as_millis() as u64);
        workflow.retries.get_or_insert(self.config.default_retries);

        info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "Workflow registered");
        workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    fn validate_steps(workflow: &Workflow) -> Result<()> {
        let mut ids = HashSet::new();
        for step in &workflow.steps {
            if step.id.is_empty() {
                return Err(WorkflowError::Invalid(format!(
                    "workflow {} has a step without an ID",
                    workflow.id
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(WorkflowError::Invalid(format!(
                    "duplicate step ID {} in workflow {}",
                    step.id, workflow.id
                )));
            }
        }
        for step in &workflow.steps {
            for target in step.on_success.iter().chain(&step.on_failure) {
                if !ids.contains(target.as_str()) {
                    return Err(WorkflowError::Invalid(format!(
                        "step {} references unknown step {}",
                        step.id, target
                    )));
                }
            }
        }

        if let Some(rollback) = &workflow.rollback {
            let mut rollback_ids = HashSet::new();
            for step in &rollback.steps {
                if !rollback_ids.insert(step.id.as_str()) {
                    return Err(WorkflowError::Invalid(format!(
                        "duplicate rollback step ID {} in workflow {}",
                        step.id, workflow.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Get a registered workflow
    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow {workflow_id}")))
    }

    /// All registered workflows, ordered by ID
    pub async fn list_workflows(&self) -> Vec<Arc<Workflow>> {
        let mut workflows: Vec<_> = self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    /// Registered workflows triggered by an event, ordered by ID
    pub async fn find_triggered(&self, event: &str) -> Vec<Arc<Workflow>> {
        self.list_workflows()
            .await
            .into_iter()
            .filter(|w| w.is_triggered_by(event))
            .collect()
    }

    /// Start executing a workflow
    ///
    /// Returns as soon as the execution is recorded with status `running`;
    /// steps run on a spawned task governed by `cancel`.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        mut context: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution> {
        let workflow = self.get_workflow(workflow_id).await?;

        context.workflow_id = workflow.id.clone();
        if context.execution_id.is_empty() {
            context.execution_id = Uuid::new_v4().to_string();
        }
        let execution_id = context.execution_id.clone();

        let result = Arc::new(RwLock::new(WorkflowResult::running(
            &execution_id,
            &workflow.id,
        )));
        let (done_tx, done_rx) = watch::channel(false);
        let execution = WorkflowExecution {
            execution_id: execution_id.clone(),
            result: Arc::clone(&result),
            done: done_rx,
        };

        {
            let mut executions = self.executions.write().await;
            if executions.contains_key(&execution_id) {
                return Err(WorkflowError::Invalid(format!(
                    "execution {execution_id} already exists"
                )));
            }
            executions.insert(execution_id.clone(), execution.clone());
        }

        info!(workflow_id = %workflow.id, execution_id = %execution_id, "Workflow execution started");

        let runner = self.runner.clone();
        let metrics = Arc::clone(&self.metrics);
        let timeout = workflow
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        tokio::spawn(async move {
            let context = Arc::new(context);
            let forward = cancel.child_token();
            let deadline = {
                let forward = forward.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    forward.cancel();
                })
            };

            let (status, error, rollback) =
                if !ConditionEvaluator::evaluate_all(&workflow.conditions, &context) {
                    warn!(workflow_id = %workflow.id, "Workflow conditions not met");
                    (
                        WorkflowStatus::Failed,
                        Some(WorkflowError::ConditionsNotMet.to_string()),
                        None,
                    )
                } else {
                    let steps = runner
                        .execute_steps(&workflow, &context, &forward, &result)
                        .await;
                    Self::conclude(&runner, &workflow, &context, &steps, &cancel, &forward).await
                };
            deadline.abort();

            let finished = {
                let mut guard = result.write().await;
                let now = Utc::now();
                guard.status = status;
                guard.error = error;
                guard.rollback = rollback;
                guard.completed_at = Some(now);
                guard.duration_ms = (now - guard.started_at).num_milliseconds().max(0) as u64;
                let outputs: Vec<(String, Value)> = guard
                    .steps
                    .iter()
                    .filter(|s| !s.output.is_empty())
                    .map(|s| (s.step_id.clone(), serde_json::json!(s.output)))
                    .collect();
                guard.outputs.extend(outputs);
                guard.clone()
            };

            metrics
                .write()
                .await
                .entry(finished.workflow_id.clone())
                .or_default()
                .record(&finished);

            info!(
                workflow_id = %finished.workflow_id,
                execution_id = %finished.execution_id,
                status = ?finished.status,
                duration_ms = finished.duration_ms,
                "Workflow execution finished"
            );
            let _ = done_tx.send(true);
        });

        Ok(execution)
    }

    async fn conclude(
        runner: &StepRunner,
        workflow: &Workflow,
        context: &Arc<WorkflowContext>,
        steps: &[StepResult],
        cancel: &CancellationToken,
        forward: &CancellationToken,
    ) -> (WorkflowStatus, Option<String>, Option<RollbackResult>) {
        if !steps.iter().any(|s| s.status == StepStatus::Failed) {
            return (WorkflowStatus::Completed, None, None);
        }

        let (mut status, error) = if cancel.is_cancelled() {
            (WorkflowStatus::Cancelled, WorkflowError::Cancelled.to_string())
        } else if forward.is_cancelled() {
            (
                WorkflowStatus::Failed,
                format!(
                    "workflow timed out after {}ms",
                    workflow.timeout_ms.unwrap_or_default()
                ),
            )
        } else {
            (
                WorkflowStatus::Failed,
                "one or more workflow steps failed".to_string(),
            )
        };

        let auto = workflow.rollback.as_ref().map_or(false, |r| r.auto);
        if !auto {
            return (status, Some(error), None);
        }

        let rollback = runner.execute_rollback(workflow, context).await;
        if rollback.error.is_none() {
            status = WorkflowStatus::RolledBack;
        }
        (status, Some(error), Some(rollback))
    }

    /// Snapshot of an execution record
    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowResult> {
        let handle = self.execution_handle(execution_id).await?;
        Ok(handle.snapshot().await)
    }

    /// Handle to an execution, for awaiting its terminal state
    pub async fn execution_handle(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("execution {execution_id}")))
    }

    /// Metrics of a workflow that has finished at least one execution
    pub async fn get_metrics(&self, workflow_id: &str) -> Result<WorkflowMetrics> {
        self.metrics
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("metrics for workflow {workflow_id}")))
    }
}
