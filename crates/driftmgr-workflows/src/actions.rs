//! Step action dispatch

use crate::error::{Result, WorkflowError};
use crate::models::{StepAction, WorkflowContext, WorkflowStep};
use crate::process::{CommandRunner, CommandSpec, TokioCommandRunner};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output map produced by an action
pub type ActionOutput = BTreeMap<String, Value>;

/// Executes the action of a workflow step
///
/// The engine owns retries, timeouts and condition checks; a handler runs
/// exactly one attempt.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run one attempt of the step's action
    async fn execute(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<ActionOutput>;
}

/// Default handler for the built-in actions
pub struct StandardActionHandler {
    runner: Arc<dyn CommandRunner>,
}

impl Default for StandardActionHandler {
    fn default() -> Self {
        Self::new(Arc::new(TokioCommandRunner::new()))
    }
}

impl StandardActionHandler {
    /// Create a handler running commands through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn param<'a>(step: &'a WorkflowStep, context: &'a WorkflowContext, key: &str) -> Option<&'a Value> {
        step.parameters.get(key).or_else(|| context.parameters.get(key))
    }

    fn string_param(step: &WorkflowStep, context: &WorkflowContext, key: &str) -> Option<String> {
        Self::param(step, context, key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn working_dir(step: &WorkflowStep, context: &WorkflowContext) -> Result<PathBuf> {
        Self::string_param(step, context, "working_dir")
            .map(PathBuf::from)
            .ok_or_else(|| {
                WorkflowError::Invalid(format!(
                    "step {} ({}) requires a working_dir parameter",
                    step.id, step.action
                ))
            })
    }

    async fn run_terraform(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ActionOutput> {
        let dir = Self::working_dir(step, context)?;
        let mut args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        if !step.resource.is_empty() && step.action != StepAction::ValidateConfiguration {
            args.push(format!("-target={}", step.resource));
        }
        let spec = CommandSpec::new("terraform", args, dir);
        let output = self.runner.run(&spec, cancel).await?.into_result(&spec)?;

        let mut out = ActionOutput::new();
        out.insert("command".to_string(), json!(spec.display()));
        out.insert("output".to_string(), json!(output.output));
        Ok(out)
    }

    fn backup_path(step: &WorkflowStep, context: &WorkflowContext) -> Result<PathBuf> {
        if step.resource.is_empty() {
            return Err(WorkflowError::Invalid(format!(
                "step {} requires a resource",
                step.id
            )));
        }
        let dir = Self::string_param(step, context, "backup_dir").ok_or_else(|| {
            WorkflowError::Invalid(format!("step {} requires a backup_dir parameter", step.id))
        })?;
        let file = step.resource.replace(['/', '\\'], "_");
        Ok(PathBuf::from(dir).join(format!("{file}.json")))
    }

    async fn backup(&self, step: &WorkflowStep, context: &WorkflowContext) -> Result<ActionOutput> {
        let path = Self::backup_path(step, context)?;
        let snapshot = context.state.get(&step.resource).ok_or_else(|| {
            WorkflowError::NotFound(format!("no state captured for {}", step.resource))
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(snapshot)?).await?;
        debug!(resource = %step.resource, path = %path.display(), "Resource snapshot written");

        let mut out = ActionOutput::new();
        out.insert("backup_path".to_string(), json!(path.display().to_string()));
        Ok(out)
    }

    async fn restore(&self, step: &WorkflowStep, context: &WorkflowContext) -> Result<ActionOutput> {
        let path = Self::backup_path(step, context)?;
        let data = tokio::fs::read(&path).await?;
        let snapshot: Value = serde_json::from_slice(&data)?;
        debug!(resource = %step.resource, path = %path.display(), "Resource snapshot restored");

        let mut out = ActionOutput::new();
        out.insert("backup_path".to_string(), json!(path.display().to_string()));
        out.insert("restored".to_string(), snapshot);
        Ok(out)
    }

    async fn health_check(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<ActionOutput> {
        let line = Self::string_param(step, context, "command").ok_or_else(|| {
            WorkflowError::Invalid(format!("health check {} requires a command parameter", step.id))
        })?;
        let dir = Self::working_dir(step, context).unwrap_or_else(|_| PathBuf::from("."));
        let spec = CommandSpec::parse(&line, dir)?;
        let output = self.runner.run(&spec, cancel).await?.into_result(&spec)?;

        let mut out = ActionOutput::new();
        out.insert("healthy".to_string(), json!(true));
        out.insert("output".to_string(), json!(output.output));
        Ok(out)
    }

    fn notify(&self, step: &WorkflowStep, context: &WorkflowContext) -> ActionOutput {
        let message = Self::string_param(step, context, "message")
            .unwrap_or_else(|| format!("Workflow step {} reached", step.name));
        let channel = Self::string_param(step, context, "channel").unwrap_or_else(|| "log".to_string());
        info!(
            workflow_id = %context.workflow_id,
            execution_id = %context.execution_id,
            channel = %channel,
            "{}",
            message
        );

        let mut out = ActionOutput::new();
        out.insert("message".to_string(), json!(message));
        out.insert("channel".to_string(), json!(channel));
        out
    }

    async fn wait(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<ActionOutput> {
        let duration = match Self::param(step, context, "duration") {
            Some(Value::String(s)) => parse_duration(s)?,
            Some(Value::Number(n)) => seconds(n.as_f64().unwrap_or(0.0).max(0.0))
                .ok_or_else(|| WorkflowError::Invalid(format!("invalid wait duration: {n}")))?,
            Some(other) => {
                return Err(WorkflowError::Invalid(format!("invalid wait duration: {other}")))
            }
            None => Duration::ZERO,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
            _ = tokio::time::sleep(duration) => {
                let mut out = ActionOutput::new();
                out.insert("waited_ms".to_string(), json!(duration.as_millis() as u64));
                Ok(out)
            }
        }
    }
}

#[async_trait]
impl ActionHandler for StandardActionHandler {
    async fn execute(
        &self,
        step: &WorkflowStep,
        context: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<ActionOutput> {
        match &step.action {
            StepAction::TerraformPlan => {
                self.run_terraform(step, context, &["plan", "-input=false"], cancel)
                    .await
            }
            StepAction::TerraformApply => {
                self.run_terraform(step, context, &["apply", "-auto-approve", "-input=false"], cancel)
                    .await
            }
            StepAction::TerraformDestroy => {
                self.run_terraform(step, context, &["destroy", "-auto-approve", "-input=false"], cancel)
                    .await
            }
            StepAction::ValidateConfiguration => {
                self.run_terraform(step, context, &["validate"], cancel).await
            }
            StepAction::BackupResource => self.backup(step, context).await,
            StepAction::RestoreResource => self.restore(step, context).await,
            StepAction::HealthCheck => self.health_check(step, context, cancel).await,
            StepAction::Notify => Ok(self.notify(step, context)),
            StepAction::Wait => self.wait(step, context, cancel).await,
            StepAction::Unknown(name) => Err(WorkflowError::UnknownAction(name.clone())),
        }
    }
}

fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Parse a duration such as `500ms`, `30s`, `5m`, `1h` or `1m30s`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(WorkflowError::Invalid("empty duration".to_string()));
    }
    let invalid = || WorkflowError::Invalid(format!("invalid duration: {input}"));
    if let Ok(secs) = input.parse::<f64>() {
        return seconds(secs).ok_or_else(invalid);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(split);
        let value: f64 = number.parse().map_err(|_| invalid())?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(invalid()),
        };
        total = total
            .checked_add(seconds(secs).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
        rest = next;
    }
    Ok(total)
}
