//! Remediation engine configuration

use crate::error::{RemediationError, Result};
use crate::models::ApprovalConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Format of generated configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// HCL (`main.tf`)
    #[default]
    Hcl,
    /// JSON (`main.tf.json`)
    Json,
}

/// Remediation engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Root for plans, backups, executions, results and archives
    pub work_dir: PathBuf,
    /// Simulate applies without invoking the apply tool
    pub dry_run: bool,
    /// Default concurrency for batch remediation
    pub max_parallel: usize,
    /// Plans scoring at or above this need human approval
    pub require_approval_above: f64,
    /// Run the rollback plan when an apply fails
    pub auto_rollback: bool,
    /// Back up the observed state before applying
    pub backup_before_apply: bool,
    /// Refuse plans that fail validation
    pub validate_before_apply: bool,
    /// Attach import commands to import plans
    pub generate_import_commands: bool,
    /// Generated configuration format
    pub output_format: OutputFormat,
    /// Approval policy copied onto new plans
    pub approval: ApprovalConfig,
    /// Audit log file; `{work_dir}/audit.log` when unset
    pub audit_log: Option<PathBuf>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".driftmgr"),
            dry_run: false,
            max_parallel: 5,
            require_approval_above: 7.0,
            auto_rollback: true,
            backup_before_apply: true,
            validate_before_apply: true,
            generate_import_commands: true,
            output_format: OutputFormat::Hcl,
            approval: ApprovalConfig::default(),
            audit_log: None,
        }
    }
}

impl RemediationConfig {
    /// Create a configuration rooted at `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a YAML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: RemediationConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            other => {
                return Err(RemediationError::Config(format!(
                    "unsupported config format {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=10.0).contains(&self.require_approval_above) {
            return Err(RemediationError::Config(format!(
                "require_approval_above must be within [0, 10], got {}",
                self.require_approval_above
            )));
        }
        if self.max_parallel == 0 {
            return Err(RemediationError::Config(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.approval.min_approvers == 0 {
            return Err(RemediationError::Config(
                "approval.min_approvers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the audit log
    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| self.work_dir.join("audit.log"))
    }

    /// Enable or disable dry-run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the approval threshold
    pub fn with_approval_threshold(mut self, threshold: f64) -> Self {
        self.require_approval_above = threshold;
        self
    }

    /// Enable or disable automatic rollback
    pub fn with_auto_rollback(mut self, auto_rollback: bool) -> Self {
        self.auto_rollback = auto_rollback;
        self
    }

    /// Enable or disable pre-apply backups
    pub fn with_backup_before_apply(mut self, backup: bool) -> Self {
        self.backup_before_apply = backup;
        self
    }

    /// Enable or disable pre-apply validation
    pub fn with_validate_before_apply(mut self, validate: bool) -> Self {
        self.validate_before_apply = validate;
        self
    }

    /// Set the approval policy
    pub fn with_approval(mut self, approval: ApprovalConfig) -> Self {
        self.approval = approval;
        self
    }

    /// Set the batch concurrency
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }
}
