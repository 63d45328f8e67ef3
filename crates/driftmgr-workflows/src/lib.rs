#![warn(missing_docs)]

//! Driftmgr Workflows
//!
//! Declarative remediation workflows: registration, conditional and parallel
//! step execution with retries and timeouts, automatic rollback and
//! per-workflow execution metrics.
//!
//! ```
//! use driftmgr_workflows::{
//!     StepAction, Workflow, WorkflowContext, WorkflowEngine, WorkflowStatus, WorkflowStep,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let engine = WorkflowEngine::new();
//! let workflow = Workflow::new("announce", "Announce remediation").with_step(
//!     WorkflowStep::new("notify", "Notify operators", StepAction::Notify)
//!         .with_parameter("message", "remediation starting"),
//! );
//! engine.register_workflow(workflow).await.unwrap();
//!
//! let execution = engine
//!     .execute_workflow("announce", WorkflowContext::new("ops"), CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert_eq!(execution.wait().await.status, WorkflowStatus::Completed);
//! # });
//! ```

pub mod actions;
pub mod condition;
pub mod engine;
pub mod error;
pub mod models;
pub mod process;

#[cfg(test)]
mod engine_properties;

pub use actions::{parse_duration, ActionHandler, ActionOutput, StandardActionHandler};
pub use condition::ConditionEvaluator;
pub use engine::{EngineConfig, WorkflowEngine, WorkflowExecution};
pub use error::*;
pub use models::*;
pub use process::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
