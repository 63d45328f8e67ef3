//! Rule-based plan validation and security scanning

use crate::codegen::config_file_name;
use crate::error::Result;
use crate::models::{RemediationPlan, RemediationType, Severity, ValidationResult};
use crate::state::{get_path, StateMap, StateValue};
use async_trait::async_trait;
use driftmgr_workflows::{CommandRunner, CommandSpec, TokioCommandRunner};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Most critical-sensitivity changes a plan may carry
pub const MAX_CRITICAL_CHANGES: usize = 5;

type RuleCheck = dyn Fn(&RemediationPlan) -> std::result::Result<(), String> + Send + Sync;

/// A named validation rule
#[derive(Clone)]
pub struct ValidationRule {
    /// Rule name; adding a rule with an existing name replaces it
    pub name: String,
    /// What the rule checks
    pub description: String,
    /// Routing of a failure
    pub severity: Severity,
    check: Arc<RuleCheck>,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

impl ValidationRule {
    /// Create a rule; the check returns the failure message on error
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        check: F,
    ) -> Self
    where
        F: Fn(&RemediationPlan) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            severity,
            check: Arc::new(check),
        }
    }

    /// Run the rule
    pub fn check(&self, plan: &RemediationPlan) -> std::result::Result<(), String> {
        (self.check)(plan)
    }
}

/// Attributes a resource type must declare
pub fn required_attributes(resource_type: &str) -> &'static [&'static str] {
    match resource_type {
        "aws_instance" => &["ami", "instance_type"],
        "aws_s3_bucket" => &["bucket"],
        "azurerm_virtual_machine" => &["name", "location", "resource_group_name"],
        "google_compute_instance" => &["name", "machine_type", "zone"],
        _ => &[],
    }
}

/// Syntax-level check of generated configuration
#[async_trait]
pub trait SyntaxValidator: Send + Sync {
    /// Validate the configuration files in `dir`
    async fn validate(&self, dir: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// Runs `terraform init -backend=false` then `terraform validate`
pub struct TerraformSyntaxValidator {
    runner: Arc<dyn CommandRunner>,
}

impl Default for TerraformSyntaxValidator {
    fn default() -> Self {
        Self::new(Arc::new(TokioCommandRunner::new()))
    }
}

impl TerraformSyntaxValidator {
    /// Create a validator running commands through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl SyntaxValidator for TerraformSyntaxValidator {
    async fn validate(&self, dir: &Path, cancel: &CancellationToken) -> Result<()> {
        for args in [&["init", "-backend=false"][..], &["validate"][..]] {
            let spec = CommandSpec::new("terraform", args.iter().copied(), dir);
            self.runner.run(&spec, cancel).await?.into_result(&spec)?;
        }
        Ok(())
    }
}

/// Validates plans against rules and a security scan
pub struct PlanValidator {
    rules: Vec<ValidationRule>,
    syntax_validator: Option<Arc<dyn SyntaxValidator>>,
}

impl Default for PlanValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanValidator {
    /// Create a validator with the default rules and no syntax validator
    pub fn new() -> Self {
        Self {
            rules: Self::default_rules(),
            syntax_validator: None,
        }
    }

    /// Attach a syntax validator for comprehensive validation
    pub fn with_syntax_validator(mut self, validator: Arc<dyn SyntaxValidator>) -> Self {
        self.syntax_validator = Some(validator);
        self
    }

    fn default_rules() -> Vec<ValidationRule> {
        vec![
            ValidationRule::new(
                "critical_changes",
                "Limit the number of critical changes in one plan",
                Severity::High,
                |plan| {
                    let count = plan.critical_change_count();
                    if count > MAX_CRITICAL_CHANGES {
                        Err(format!(
                            "plan contains {count} critical changes (max allowed: {MAX_CRITICAL_CHANGES})"
                        ))
                    } else {
                        Ok(())
                    }
                },
            ),
            ValidationRule::new(
                "production_deletion",
                "Production resources are never deleted without explicit approval",
                Severity::Critical,
                |plan| {
                    if plan.remediation_type == RemediationType::Delete
                        && plan.environment() == Some("production")
                    {
                        Err("cannot delete production resource without explicit approval".to_string())
                    } else {
                        Ok(())
                    }
                },
            ),
            ValidationRule::new(
                "required_attributes",
                "Created and updated resources declare their required attributes",
                Severity::Medium,
                |plan| {
                    if !matches!(
                        plan.remediation_type,
                        RemediationType::Create | RemediationType::Update
                    ) {
                        return Ok(());
                    }
                    match required_attributes(&plan.resource_type)
                        .iter()
                        .find(|attr| !plan.desired_state.contains_key(**attr))
                    {
                        Some(missing) => Err(format!("missing required attribute: {missing}")),
                        None => Ok(()),
                    }
                },
            ),
        ]
    }

    /// Add a rule, replacing any rule with the same name
    pub fn add_rule(&mut self, rule: ValidationRule) {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    /// Registered rules in evaluation order
    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    /// Validate a plan without external calls
    pub fn validate(&self, plan: &RemediationPlan) -> ValidationResult {
        let mut result = ValidationResult {
            valid: true,
            estimated_changes: plan.changes.len(),
            ..ValidationResult::default()
        };

        for rule in &self.rules {
            if let Err(message) = rule.check(plan) {
                debug!(plan_id = %plan.id, rule = %rule.name, severity = %rule.severity, "Validation rule failed");
                match rule.severity {
                    Severity::Critical | Severity::High => {
                        result.valid = false;
                        result.errors.push(message);
                    }
                    Severity::Medium => result.warnings.push(message),
                    Severity::Low => result.best_practices.push(message),
                }
            }
        }

        result.security_issues = Self::check_security(plan);
        if !result.security_issues.is_empty() {
            result.valid = false;
        }
        result
    }

    /// Validate a plan and run the syntax validator on its generated code
    ///
    /// The syntax check can only add errors.
    pub async fn validate_comprehensive(
        &self,
        plan: &RemediationPlan,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult> {
        let mut result = self.validate(plan);
        let Some(syntax) = &self.syntax_validator else {
            return Ok(result);
        };
        if plan.terraform_code.trim().is_empty() {
            return Ok(result);
        }

        let workspace = tempfile::Builder::new()
            .prefix("driftmgr-validate-")
            .tempdir()?;
        let file = config_file_name(&plan.terraform_code);
        tokio::fs::write(workspace.path().join(file), &plan.terraform_code).await?;

        if let Err(e) = syntax.validate(workspace.path(), cancel).await {
            if e.is_cancellation() {
                return Err(e);
            }
            warn!(plan_id = %plan.id, error = %e, "Syntax validation failed");
            result.valid = false;
            result.errors.push(format!("Terraform validation failed: {e}"));
        }
        Ok(result)
    }

    fn check_security(plan: &RemediationPlan) -> Vec<String> {
        let mut issues = Vec::new();

        Self::scan_credentials(&plan.desired_state, "", &mut issues);

        let resource_type = plan.resource_type.as_str();
        if resource_type == "aws_security_group" || resource_type == "azurerm_network_security_group" {
            let open = get_path(&plan.desired_state, "ingress")
                .and_then(StateValue::as_list)
                .unwrap_or_default()
                .iter()
                .any(Self::ingress_is_open);
            if open {
                issues.push("Security group allows traffic from 0.0.0.0/0".to_string());
            }
        }

        let lower = resource_type.to_lowercase();
        if (lower.contains("bucket") || lower.contains("storage"))
            && !plan
                .desired_state
                .contains_key("server_side_encryption_configuration")
        {
            issues.push("Storage resource is not configured with encryption".to_string());
        }

        issues
    }

    fn scan_credentials(state: &StateMap, prefix: &str, issues: &mut Vec<String>) {
        for (key, value) in state {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            Self::scan_value(key, value, &path, issues);
        }
    }

    fn scan_value(key: &str, value: &StateValue, path: &str, issues: &mut Vec<String>) {
        match value {
            StateValue::String(s) => {
                let lower = key.to_lowercase();
                let sensitive = ["password", "secret", "token"]
                    .iter()
                    .any(|k| lower.contains(k));
                if sensitive && !s.is_empty() && !s.starts_with("${") {
                    issues.push(format!("Potential hardcoded credential in field: {path}"));
                }
            }
            StateValue::Object(nested) => Self::scan_credentials(nested, path, issues),
            // list items inherit the attribute name they sit under
            StateValue::List(items) => {
                for (index, item) in items.iter().enumerate() {
                    Self::scan_value(key, item, &format!("{path}.{index}"), issues);
                }
            }
            _ => {}
        }
    }

    fn ingress_is_open(rule: &StateValue) -> bool {
        let Some(rule) = rule.as_object() else {
            return false;
        };
        let cidr_blocks = rule
            .get("cidr_blocks")
            .or_else(|| rule.get("source_address_prefix"));
        match cidr_blocks {
            Some(StateValue::List(blocks)) => blocks.iter().any(|b| b.as_str() == Some("0.0.0.0/0")),
            Some(StateValue::String(block)) => block == "0.0.0.0/0" || block == "*",
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Change, ChangeAction, Sensitivity};
    use crate::state::{from_json, set_path};
    use crate::test_support::plan;
    use driftmgr_workflows::{CommandOutput, WorkflowError};
    use crate::codegen::{CodeGenerator, HclCodeGenerator};
    use crate::config::OutputFormat;
    use serde_json::json;

    #[test]
    fn test_production_deletion_is_invalid() {
        let result = PlanValidator::new().validate(&plan(
            RemediationType::Delete,
            "aws_instance",
            Some("production"),
        ));
        assert!(!result.valid);
        assert!(result
            .errors
            .contains(&"cannot delete production resource without explicit approval".to_string()));
    }

    #[test]
    fn test_too_many_critical_changes() {
        let mut p = plan(RemediationType::Update, "aws_vpc", None);
        for i in 0..6 {
            p.changes.push(Change {
                path: format!("policy_{i}"),
                action: ChangeAction::Update,
                old_value: None,
                new_value: Some("x".into()),
                sensitivity: Sensitivity::Critical,
            });
        }
        let result = PlanValidator::new().validate(&p);
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["plan contains 6 critical changes (max allowed: 5)"]);
        assert_eq!(result.estimated_changes, 6);
    }

    #[test]
    fn test_missing_required_attribute_is_a_warning() {
        let mut p = plan(RemediationType::Create, "aws_instance", None);
        p.desired_state = from_json(json!({"ami": "ami-123"}));
        let result = PlanValidator::new().validate(&p);
        assert!(result.valid);
        assert_eq!(result.warnings, vec!["missing required attribute: instance_type"]);
    }

    #[test]
    fn test_security_scan() {
        let mut p = plan(RemediationType::Update, "aws_security_group", None);
        p.desired_state = from_json(json!({
            "db_password": "hunter2",
            "api_token": "${var.token}",
            "nested": {"client_secret": "abc"},
            "ingress": [{"from_port": 22, "cidr_blocks": ["10.0.0.0/8", "0.0.0.0/0"]}]
        }));
        let result = PlanValidator::new().validate(&p);
        assert!(!result.valid);
        assert_eq!(
            result.security_issues,
            vec![
                "Potential hardcoded credential in field: db_password",
                "Potential hardcoded credential in field: nested.client_secret",
                "Security group allows traffic from 0.0.0.0/0",
            ]
        );
    }

    #[test]
    fn test_security_scan_sees_indexed_drift() {
        let mut p = plan(RemediationType::Update, "aws_security_group", None);
        p.desired_state = from_json(json!({
            "ingress": [
                {"from_port": 22, "cidr_blocks": ["10.0.0.0/8"]},
                {"from_port": 443, "cidr_blocks": ["10.0.0.0/8"]}
            ],
            "users": [{"name": "ops", "password": "hunter2"}]
        }));
        assert_eq!(
            PlanValidator::new().validate(&p).security_issues,
            vec!["Potential hardcoded credential in field: users.0.password"]
        );

        set_path(
            &mut p.desired_state,
            "ingress.1.cidr_blocks",
            StateValue::from(json!(["0.0.0.0/0"])),
        );
        let result = PlanValidator::new().validate(&p);
        assert!(!result.valid);
        assert!(result
            .security_issues
            .contains(&"Security group allows traffic from 0.0.0.0/0".to_string()));
    }

    #[test]
    fn test_unencrypted_storage() {
        let mut p = plan(RemediationType::Create, "aws_s3_bucket", None);
        p.desired_state = from_json(json!({"bucket": "logs"}));
        let result = PlanValidator::new().validate(&p);
        assert_eq!(
            result.security_issues,
            vec!["Storage resource is not configured with encryption"]
        );

        p.desired_state = from_json(json!({
            "bucket": "logs",
            "server_side_encryption_configuration": {"rule": {"sse_algorithm": "aws:kms"}}
        }));
        assert!(PlanValidator::new().validate(&p).valid);
    }

    #[test]
    fn test_low_severity_rule_is_informational() {
        let mut validator = PlanValidator::new();
        validator.add_rule(ValidationRule::new("naming", "Names are lowercase", Severity::Low, |plan| {
            if plan.resource_name.chars().any(char::is_uppercase) {
                Err("resource name should be lowercase".to_string())
            } else {
                Ok(())
            }
        }));
        let mut p = plan(RemediationType::Import, "aws_instance", None);
        p.resource_name = "Web".to_string();
        let result = validator.validate(&p);
        assert!(result.valid);
        assert_eq!(result.best_practices, vec!["resource name should be lowercase"]);
    }

    #[test]
    fn test_add_rule_replaces_by_name() {
        let mut validator = PlanValidator::new();
        let before = validator.rules().len();
        validator.add_rule(ValidationRule::new("production_deletion", "disabled", Severity::Low, |_| Ok(())));
        assert_eq!(validator.rules().len(), before);
        let result = validator.validate(&plan(RemediationType::Delete, "aws_instance", Some("production")));
        assert!(result.valid);
    }

    struct FailingSyntax;

    #[async_trait]
    impl SyntaxValidator for FailingSyntax {
        async fn validate(&self, dir: &Path, _cancel: &CancellationToken) -> Result<()> {
            assert!(dir.join("main.tf").exists());
            Err(WorkflowError::CommandFailed {
                command: "terraform validate".to_string(),
                output: "Unsupported block type".to_string(),
            }
            .into())
        }
    }

    /// Accepts the workspace only when it holds the expected file
    struct ExpectsFile(&'static str);

    #[async_trait]
    impl SyntaxValidator for ExpectsFile {
        async fn validate(&self, dir: &Path, _cancel: &CancellationToken) -> Result<()> {
            let others: Vec<_> = ["main.tf", "main.tf.json"]
                .into_iter()
                .filter(|f| *f != self.0 && dir.join(f).exists())
                .collect();
            if dir.join(self.0).exists() && others.is_empty() {
                Ok(())
            } else {
                Err(WorkflowError::CommandFailed {
                    command: "terraform validate".to_string(),
                    output: format!("expected only {}", self.0),
                }
                .into())
            }
        }
    }

    #[tokio::test]
    async fn test_comprehensive_writes_json_configuration_as_tf_json() {
        let validator = PlanValidator::new().with_syntax_validator(Arc::new(ExpectsFile("main.tf.json")));
        let mut p = plan(RemediationType::Import, "aws_instance", None);
        p.terraform_code = HclCodeGenerator::new(OutputFormat::Json).generate_code(&p).unwrap();

        let result = validator
            .validate_comprehensive(&p, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.valid, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn test_comprehensive_adds_syntax_errors() {
        let validator = PlanValidator::new().with_syntax_validator(Arc::new(FailingSyntax));
        let mut p = plan(RemediationType::Import, "aws_instance", None);
        p.terraform_code = "resource \"aws_instance\" \"web\" {}\n".to_string();

        let result = validator
            .validate_comprehensive(&p, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.valid);
        assert!(result.errors[0].starts_with("Terraform validation failed:"));
    }

    struct OkRunner(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl CommandRunner for OkRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            _cancel: &CancellationToken,
        ) -> driftmgr_workflows::Result<CommandOutput> {
            self.0.lock().unwrap().push(spec.display());
            Ok(CommandOutput {
                exit_code: Some(0),
                output: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_terraform_syntax_validator_commands() {
        let runner = Arc::new(OkRunner(Default::default()));
        let validator = PlanValidator::new()
            .with_syntax_validator(Arc::new(TerraformSyntaxValidator::new(runner.clone())));
        let mut p = plan(RemediationType::Import, "aws_instance", None);
        p.terraform_code = "resource \"aws_instance\" \"web\" {}\n".to_string();

        let result = validator
            .validate_comprehensive(&p, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.valid);
        assert_eq!(
            *runner.0.lock().unwrap(),
            vec!["terraform init -backend=false", "terraform validate"]
        );
    }
}
