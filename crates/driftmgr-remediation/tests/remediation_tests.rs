//! Integration tests for the remediation engine
//!
//! Every test drives a [`RemediationEngine`] against a fake `terraform`
//! runner rooted in a temporary work directory.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use driftmgr_remediation::state::{from_json, get_path, set_path, to_json};
use driftmgr_remediation::*;
use driftmgr_workflows::{CommandOutput, CommandRunner, CommandSpec};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fixtures
// ============================================================================

/// Records every command; fails the exact command lines it is told to
#[derive(Default)]
struct FakeTerraform {
    fail: HashSet<String>,
    calls: Mutex<Vec<(String, PathBuf)>>,
    restored: Mutex<Option<String>>,
}

impl FakeTerraform {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing(lines: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail: lines.iter().map(|l| l.to_string()).collect(),
            ..Self::default()
        })
    }

    fn lines(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
    }

    /// Configuration a rollback apply ran against
    fn restored(&self) -> Option<String> {
        self.restored.lock().unwrap().clone()
    }

    fn record_rollback_apply(&self, dir: &std::path::Path) {
        if let Ok(code) = std::fs::read_to_string(dir.join("main.tf")) {
            *self.restored.lock().unwrap() = Some(code);
        }
    }
}

#[async_trait]
impl CommandRunner for FakeTerraform {
    async fn run(
        &self,
        spec: &CommandSpec,
        _cancel: &CancellationToken,
    ) -> driftmgr_workflows::Result<CommandOutput> {
        let line = spec.display();
        self.calls
            .lock()
            .unwrap()
            .push((line.clone(), spec.working_dir.clone()));

        if self.fail.contains(&line) {
            return Ok(CommandOutput {
                exit_code: Some(1),
                output: format!("Error: {line} failed"),
            });
        }
        if line == "terraform apply -auto-approve"
            && spec.working_dir.components().any(|c| c.as_os_str() == "rollbacks")
        {
            self.record_rollback_apply(&spec.working_dir);
        }
        let output = if line == "terraform show -json" {
            r#"{"format_version":"1.0","values":{}}"#.to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code: Some(0),
            output,
        })
    }
}

fn engine(runner: Arc<FakeTerraform>) -> (TempDir, Arc<RemediationEngine>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let config = RemediationConfig::new(dir.path());
    let engine = RemediationEngine::with_runner(config, runner).unwrap();
    (dir, Arc::new(engine))
}

fn state(pairs: &[(&str, &str)]) -> StateMap {
    let mut state = StateMap::new();
    for (path, value) in pairs {
        set_path(&mut state, path, (*value).into());
    }
    state
}

/// Tag drift on `aws_instance.web`: observed owner `unknown`, declared `platform`
fn instance_drift(environment: &str) -> DriftItem {
    DriftItem::new("i-0abc123", "aws_instance", DriftType::Modified)
        .with_name("web")
        .with_provider("aws")
        .with_observed_state(state(&[
            ("ami", "ami-123"),
            ("instance_type", "t3.micro"),
            ("tags.environment", environment),
            ("tags.owner", "unknown"),
        ]))
        .with_declared_state(state(&[
            ("ami", "ami-123"),
            ("instance_type", "t3.micro"),
            ("tags.environment", environment),
            ("tags.owner", "platform"),
        ]))
        .with_change(DriftChange::new(
            "tags.owner",
            Some("platform".into()),
            Some("unknown".into()),
        ))
}

// ============================================================================
// Plan generation
// ============================================================================

#[tokio::test]
async fn test_low_risk_create_plan() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let drift = DriftItem::new("i-0missing", "aws_instance", DriftType::Deleted)
        .with_name("api")
        .with_declared_state(state(&[("ami", "ami-123"), ("instance_type", "t3.small")]));

    let plan = engine.generate_plan(&drift).await.unwrap();

    assert_eq!(plan.remediation_type, RemediationType::Create);
    assert_eq!(plan.provider, "aws");
    assert_eq!(plan.risk_score(), Some(2.0));
    assert!(!plan.requires_approval);
    assert_eq!(plan.status, PlanStatus::Draft);
    assert!(plan.validation_errors.is_empty());
    assert!(plan.terraform_code.contains("resource \"aws_instance\" \"api\""));
    assert!(plan.id.starts_with("plan-"));
    assert!(plan.rollback_plan.as_ref().unwrap().auto_rollback);
}

#[tokio::test]
async fn test_production_rds_delete_is_critical() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let drift = DriftItem::new("db-prod-1", "aws_rds_instance", DriftType::Created)
        .with_observed_state(state(&[("engine", "postgres"), ("tags.environment", "production")]));

    let plan = engine.generate_plan(&drift).await.unwrap();
    let impact = plan.estimated_impact.as_ref().unwrap();

    assert_eq!(plan.remediation_type, RemediationType::Delete);
    assert_eq!(plan.resource_name, "db_prod_1");
    assert_eq!(impact.risk_score, 10.0);
    assert_eq!(impact.severity, Severity::Critical);
    assert!(plan.requires_approval);
    assert_eq!(plan.status, PlanStatus::PendingApproval);
    assert!(plan
        .validation_errors
        .iter()
        .any(|e| e.contains("production")));

    let err = engine
        .apply_plan(&plan.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::ValidationFailed { .. }));
}

#[tokio::test]
async fn test_tag_drift_is_low_risk_update() {
    let (_dir, engine) = engine(FakeTerraform::new());

    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();

    assert_eq!(plan.remediation_type, RemediationType::Update);
    assert_eq!(plan.risk_score(), Some(3.0));
    assert!(!plan.requires_approval);
    let change = &plan.changes[0];
    assert_eq!(change.action, ChangeAction::Update);
    assert_eq!(change.old_value, Some("unknown".into()));
    assert_eq!(change.new_value, Some("platform".into()));
    assert_eq!(change.sensitivity, Sensitivity::Low);
}

#[tokio::test]
async fn test_force_new_drift_is_replace() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let drift = DriftItem::new("i-0abc123", "aws_instance", DriftType::Modified)
        .with_name("web")
        .with_observed_state(state(&[("ami", "ami-123"), ("instance_type", "t3.micro")]))
        .with_declared_state(state(&[("ami", "ami-123"), ("instance_type", "t3.large")]))
        .with_change(DriftChange::new(
            "instance_type",
            Some("t3.large".into()),
            Some("t3.micro".into()),
        ));

    let plan = engine.generate_plan(&drift).await.unwrap();

    assert_eq!(plan.remediation_type, RemediationType::Replace);
    assert_eq!(plan.changes[0].sensitivity, Sensitivity::Medium);
    assert!(plan.terraform_code.contains("create_before_destroy"));
    assert_eq!(
        get_path(&plan.current_state, "instance_type"),
        Some(&StateValue::from("t3.micro"))
    );
    assert_eq!(
        get_path(&plan.desired_state, "instance_type"),
        Some(&StateValue::from("t3.large"))
    );
}

#[tokio::test]
async fn test_unmanaged_drift_gets_import_commands() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let drift = DriftItem::new("legacy-bucket", "aws_s3_bucket", DriftType::Unmanaged)
        .with_name("legacy")
        .with_observed_state(state(&[("bucket", "legacy-bucket")]));

    let plan = engine.generate_plan(&drift).await.unwrap();

    assert_eq!(plan.remediation_type, RemediationType::Import);
    assert_eq!(
        plan.import_commands,
        vec!["terraform import aws_s3_bucket.legacy legacy-bucket".to_string()]
    );
}

#[tokio::test]
async fn test_indexed_drift_keeps_rule_list() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let rules = |cidr: &str| {
        from_json(serde_json::json!({
            "name": "web",
            "ingress": [{"from_port": 22, "to_port": 22, "cidr_blocks": [cidr]}]
        }))
    };
    let drift = DriftItem::new("sg-0abc", "aws_security_group", DriftType::Modified)
        .with_name("web")
        .with_observed_state(rules("10.0.0.0/8"))
        .with_declared_state(rules("0.0.0.0/0"))
        .with_change(DriftChange::new(
            "ingress.0.cidr_blocks",
            Some(StateValue::from(serde_json::json!(["0.0.0.0/0"]))),
            Some(StateValue::from(serde_json::json!(["10.0.0.0/8"]))),
        ));

    let plan = engine.generate_plan(&drift).await.unwrap();

    assert_eq!(plan.desired_state["ingress"].as_list().map(<[_]>::len), Some(1));
    assert_eq!(
        get_path(&plan.desired_state, "ingress.0.from_port").and_then(StateValue::as_i64),
        Some(22)
    );
    assert!(plan
        .validation_errors
        .contains(&"Security group allows traffic from 0.0.0.0/0".to_string()));
    assert!(plan.terraform_code.contains("ingress = [{"));

    let err = engine
        .apply_plan(&plan.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::ValidationFailed { .. }));
}

#[tokio::test]
async fn test_drift_without_resource_id_is_rejected() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let err = engine
        .generate_plan(&DriftItem::new("", "aws_instance", DriftType::Deleted))
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::InvalidPlan(_)));
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_plans_survive_engine_restart() {
    let runner = FakeTerraform::new();
    let (dir, engine) = engine(runner.clone());
    let first = engine.generate_plan(&instance_drift("dev")).await.unwrap();
    let second = engine
        .generate_plan(
            &DriftItem::new("i-2", "aws_instance", DriftType::Deleted)
                .with_declared_state(state(&[("ami", "ami-1"), ("instance_type", "t3.nano")])),
        )
        .await
        .unwrap();

    let reopened =
        RemediationEngine::with_runner(RemediationConfig::new(dir.path()), runner).unwrap();
    let loaded = reopened.get_plan(&first.id).await.unwrap();
    assert_eq!(loaded, first);

    let ids: Vec<String> = reopened
        .list_plans()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.id) && ids.contains(&second.id));

    let err = reopened.get_plan("plan-0-missing").await.unwrap_err();
    assert!(matches!(err, RemediationError::NotFound(_)));
}

// ============================================================================
// Approval
// ============================================================================

#[tokio::test]
async fn test_apply_waits_for_approval() {
    let runner = FakeTerraform::new();
    let (_dir, engine) = engine(runner.clone());
    // update (3) + production (3) lands in the high band
    let plan = engine.generate_plan(&instance_drift("production")).await.unwrap();
    assert!(plan.requires_approval);

    let cancel = CancellationToken::new();
    let err = engine.apply_plan(&plan.id, &cancel).await.unwrap_err();
    assert!(err.is_approval_pending());
    // asking again keeps the single pending request
    let err = engine.apply_plan(&plan.id, &cancel).await.unwrap_err();
    assert!(err.is_approval_pending());
    assert_eq!(engine.approvals().pending().await.len(), 1);
    assert!(!runner.lines().iter().any(|l| l.starts_with("terraform apply")));

    let status = engine.approve(&plan.id, "alice", true, None).await.unwrap();
    assert_eq!(status, ApprovalStatus::Approved);
    assert_eq!(engine.get_plan(&plan.id).await.unwrap().status, PlanStatus::Approved);

    let result = engine.apply_plan(&plan.id, &cancel).await.unwrap();
    assert!(result.success);
    assert_eq!(engine.get_plan(&plan.id).await.unwrap().status, PlanStatus::Applied);
}

#[tokio::test]
async fn test_rejected_plan_never_applies() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let plan = engine.generate_plan(&instance_drift("production")).await.unwrap();

    let status = engine
        .approve(&plan.id, "bob", false, Some("maintenance freeze".to_string()))
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Rejected);
    assert_eq!(engine.get_plan(&plan.id).await.unwrap().status, PlanStatus::Rejected);

    let err = engine
        .apply_plan(&plan.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::ApprovalRejected(_)));
}

// ============================================================================
// Apply
// ============================================================================

#[tokio::test]
async fn test_successful_apply_backs_up_archives_and_audits() {
    let runner = FakeTerraform::new();
    let (_dir, engine) = engine(runner.clone());
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();

    let result = engine
        .apply_plan(&plan.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.dry_run);
    assert_eq!(result.applied_changes, plan.changes);
    assert!(result.final_state.is_some());

    let lines = runner.lines();
    for expected in [
        "terraform init -backend=false",
        "terraform validate",
        "terraform init -input=false",
        "terraform plan -input=false -out=tfplan",
        "terraform apply -auto-approve tfplan",
    ] {
        assert!(lines.iter().any(|l| l == expected), "missing {expected}");
    }

    engine.rollback_manager().verify_backup(&plan.id).await.unwrap();

    let archived = engine.get_archived(&plan.id).await.unwrap();
    assert_eq!(archived.plan.status, PlanStatus::Applied);
    assert_eq!(archived.result.as_ref().map(|r| r.success), Some(true));

    let messages: Vec<String> = engine
        .audit_logger()
        .read_entries()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert!(messages.contains(&"Remediation plan generated".to_string()));
    assert!(messages.contains(&"Backup created".to_string()));
    assert!(messages.contains(&"Remediation plan applied".to_string()));
}

#[tokio::test]
async fn test_apply_failure_rolls_back() {
    let runner = FakeTerraform::failing(&["terraform apply -auto-approve tfplan"]);
    let (_dir, engine) = engine(runner.clone());
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();

    let err = engine
        .apply_plan(&plan.id, &CancellationToken::new())
        .await
        .unwrap_err();

    let RemediationError::ExecutionFailed { result, .. } = err else {
        panic!("expected execution failure, got {err}");
    };
    assert!(!result.success);
    assert_eq!(result.failed_changes, plan.changes);
    assert_eq!(engine.get_plan(&plan.id).await.unwrap().status, PlanStatus::RolledBack);

    // the rollback re-applied the observed attributes
    let restored = runner.restored().expect("rollback apply ran");
    assert!(restored.contains("resource \"aws_instance\" \"web\" {\n"));
    assert!(restored.contains("  ami = \"ami-123\"\n"));
    assert!(restored.contains("  instance_type = \"t3.micro\"\n"));
    assert!(restored.contains("    owner = \"unknown\"\n"));
    assert!(!restored.contains("\"platform\""));

    let archived = engine.get_archived(&plan.id).await.unwrap();
    assert_eq!(archived.plan.status, PlanStatus::RolledBack);
    assert_eq!(archived.result.map(|r| r.success), Some(false));
}

#[tokio::test]
async fn test_failed_rollback_is_reported() {
    let runner = FakeTerraform::failing(&[
        "terraform apply -auto-approve tfplan",
        "terraform apply -auto-approve",
    ]);
    let (_dir, engine) = engine(runner.clone());
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();

    let err = engine
        .apply_plan(&plan.id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RemediationError::RollbackFailed { .. }));
    assert_eq!(engine.get_plan(&plan.id).await.unwrap().status, PlanStatus::Failed);
    // retried once after the first failure
    let rollback_applies = runner
        .lines()
        .iter()
        .filter(|l| *l == "terraform apply -auto-approve")
        .count();
    assert_eq!(rollback_applies, 2);
}

#[tokio::test]
async fn test_apply_outside_schedule_is_refused() {
    let runner = FakeTerraform::new();
    let (_dir, engine) = engine(runner.clone());
    let mut plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();
    let now = Utc::now();
    plan.schedule = Some(Schedule {
        start: now - ChronoDuration::hours(2),
        end: now - ChronoDuration::hours(1),
    });
    engine.save_plan(&plan).await.unwrap();

    let err = engine
        .apply_plan(&plan.id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RemediationError::OutsideSchedule(_)));
    assert!(runner.lines().is_empty());
}

#[tokio::test]
async fn test_dry_run_apply_touches_nothing() {
    let runner = FakeTerraform::new();
    let (_dir, engine) = engine(runner.clone());
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();

    let result = engine
        .apply_plan_with(&plan.id, true, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.dry_run);
    assert_eq!(result.applied_changes, plan.changes);
    assert!(runner.lines().is_empty());
    assert!(engine.rollback_manager().verify_backup(&plan.id).await.is_err());
}

#[tokio::test]
async fn test_finished_plan_is_never_reapplied() {
    let runner = FakeTerraform::new();
    let (_dir, engine) = engine(runner.clone());
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();
    let cancel = CancellationToken::new();

    engine.apply_plan(&plan.id, &cancel).await.unwrap();
    let applies = runner.lines().len();

    for dry_run in [true, false] {
        let err = engine
            .apply_plan_with(&plan.id, dry_run, &cancel)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, RemediationError::InvalidState { status: PlanStatus::Applied, .. }),
            "{err}"
        );
    }
    assert!(matches!(
        engine.build_workflow(&plan.id).await,
        Err(RemediationError::InvalidState { .. })
    ));
    assert_eq!(runner.lines().len(), applies);
    assert_eq!(engine.get_plan(&plan.id).await.unwrap().status, PlanStatus::Applied);
}

#[tokio::test]
async fn test_rolled_back_plan_is_not_reapplied() {
    let runner = FakeTerraform::failing(&["terraform apply -auto-approve tfplan"]);
    let (_dir, engine) = engine(runner);
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();
    let cancel = CancellationToken::new();

    assert!(engine.apply_plan(&plan.id, &cancel).await.is_err());
    let err = engine.apply_plan(&plan.id, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        RemediationError::InvalidState { status: PlanStatus::RolledBack, .. }
    ));
}

#[tokio::test]
async fn test_concurrent_applies_run_once() {
    let (_dir, engine) = engine(FakeTerraform::new());
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let plan_id = plan.id.clone();
            tokio::spawn(async move {
                engine
                    .apply_plan_with(&plan_id, true, &CancellationToken::new())
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(result) => {
                assert!(result.dry_run);
                applied += 1;
            }
            Err(err) => assert!(matches!(err, RemediationError::InvalidState { .. }), "{err}"),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(engine.get_plan(&plan.id).await.unwrap().status, PlanStatus::Applied);
}

// ============================================================================
// Batch remediation
// ============================================================================

#[tokio::test]
async fn test_parallel_dry_run_batch() {
    let runner = FakeTerraform::new();
    let (_dir, engine) = engine(runner.clone());
    let drifts: Vec<DriftItem> = (0..3)
        .map(|i| {
            DriftItem::new(format!("i-{i}"), "aws_instance", DriftType::Modified)
                .with_observed_state(state(&[("ami", "ami-1"), ("instance_type", "t3.micro")]))
                .with_declared_state(state(&[("ami", "ami-1"), ("instance_type", "t3.micro")]))
                .with_change(DriftChange::new(
                    "tags.owner",
                    Some("platform".into()),
                    Some("unknown".into()),
                ))
        })
        .collect();
    let options = BatchOptions {
        parallel: true,
        max_workers: 2,
        dry_run: true,
        ..BatchOptions::default()
    };

    let results = engine
        .batch_remediate(drifts, options, &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 3);
    for (i, item) in results.iter().enumerate() {
        assert_eq!(item.resource_id, format!("i-{i}"));
        assert!(item.is_success(), "{:?}", item.error);
        assert!(item.result.as_ref().unwrap().dry_run);
    }
    assert!(runner.lines().is_empty());
}

#[tokio::test]
async fn test_manual_batch_only_plans() {
    let runner = FakeTerraform::new();
    let (_dir, engine) = engine(runner.clone());
    let drifts = vec![
        instance_drift("dev"),
        DriftItem::new("", "aws_instance", DriftType::Deleted),
    ];
    let options = BatchOptions {
        strategy: BatchStrategy::Manual,
        ..BatchOptions::default()
    };

    let results = engine
        .batch_remediate(drifts, options, &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 2);
    assert!(results[0].is_success());
    assert!(results[0].plan_id.is_some());
    assert!(results[0].result.is_none());
    assert!(results[1].error.is_some());
    assert!(runner.lines().is_empty());
    assert_eq!(engine.list_plans().await.unwrap().len(), 1);
}

// ============================================================================
// Workflow bridge
// ============================================================================

#[tokio::test]
async fn test_build_workflow_shape() {
    let (dir, engine) = engine(FakeTerraform::new());
    let plan = engine.generate_plan(&instance_drift("dev")).await.unwrap();

    let (workflow, context) = engine.build_workflow(&plan.id).await.unwrap();

    assert_eq!(workflow.id, format!("remediate-{}", plan.id));
    let ids: Vec<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["backup", "validate", "plan", "apply", "health_check"]);
    let rollback = workflow.rollback.as_ref().unwrap();
    assert!(rollback.auto);
    assert_eq!(rollback.steps.len(), 2);

    assert_eq!(context.parameters["plan_id"], Value::String(plan.id.clone()));
    assert_eq!(context.state["aws_instance.web"], to_json(&plan.current_state));
    assert!(dir
        .path()
        .join("workflows")
        .join(&plan.id)
        .join("workspace/main.tf")
        .exists());
}
