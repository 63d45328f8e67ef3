#![warn(missing_docs)]

//! Driftmgr Remediation
//!
//! Turns detected infrastructure drift into typed remediation plans and
//! applies them safely:
//! - Plan generation with attribute sensitivity and force-new detection
//! - Risk, cost, security and performance impact assessment
//! - Validation rules, security scanning and external syntax validation
//! - A threshold-driven, multi-party approval gate with expiry
//! - Configuration generation and import commands
//! - Backups with integrity digests, rollback plans and rollback execution
//! - Audited apply, batch remediation and workflow bridging
//!
//! ```
//! use driftmgr_remediation::{DriftItem, DriftType, RemediationConfig, RemediationEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let work_dir = tempfile::tempdir().unwrap();
//! let engine = RemediationEngine::new(RemediationConfig::new(work_dir.path())).unwrap();
//!
//! let drift = DriftItem::new("i-0abc", "aws_instance", DriftType::Unmanaged);
//! let plan = engine.generate_plan(&drift).await.unwrap();
//!
//! // a dry run records the changes without invoking terraform
//! let result = engine
//!     .apply_plan_with(&plan.id, true, &CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert!(result.dry_run);
//! # });
//! ```

pub mod approval;
pub mod audit;
pub mod codegen;
pub mod config;
pub mod cost;
pub mod engine;
pub mod error;
pub mod executor;
pub mod impact;
pub mod models;
pub mod risk;
pub mod rollback;
pub mod state;
pub mod validator;

#[cfg(test)]
mod risk_properties;
#[cfg(test)]
mod validator_properties;

pub use approval::{ApprovalManager, ApprovalRequest, ApprovalStatus, ApprovalVote};
pub use audit::AuditLogger;
pub use codegen::{CodeGenerator, HclCodeGenerator};
pub use config::{OutputFormat, RemediationConfig};
pub use cost::CostCalculator;
pub use engine::{
    classify_sensitivity, remediation_type_for, ArchivedPlan, BatchItemResult, BatchOptions,
    BatchStrategy, RemediationEngine,
};
pub use error::{RemediationError, Result};
pub use executor::PlanExecutor;
pub use impact::ImpactAnalyzer;
pub use models::*;
pub use risk::{RiskAssessor, MAX_RISK_SCORE};
pub use rollback::{BackupManifest, RollbackManager};
pub use state::{StateMap, StateValue};
pub use validator::{
    PlanValidator, SyntaxValidator, TerraformSyntaxValidator, ValidationRule, MAX_CRITICAL_CHANGES,
};
