//! Property-based tests for risk scoring and the approval gate
//!
//! **Property 1: Risk scores stay within `[0, 10]` and are deterministic**
//! **Property 2: Auto-approval never admits a plan at or above the threshold**

#[cfg(test)]
mod tests {
    use crate::approval::ApprovalManager;
    use crate::impact::ImpactAnalyzer;
    use crate::models::RemediationType;
    use crate::risk::{RiskAssessor, MAX_RISK_SCORE};
    use crate::test_support::plan;
    use proptest::prelude::*;

    fn remediation_type_strategy() -> impl Strategy<Value = RemediationType> {
        prop_oneof![
            Just(RemediationType::Create),
            Just(RemediationType::Update),
            Just(RemediationType::Replace),
            Just(RemediationType::Delete),
            Just(RemediationType::Import),
        ]
    }

    fn resource_type_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("aws_instance".to_string()),
            Just("aws_rds_instance".to_string()),
            Just("aws_s3_bucket".to_string()),
            Just("azurerm_network_interface".to_string()),
            Just("google_sql_database".to_string()),
            "[a-z]{2,8}_[a-z]{2,10}",
        ]
    }

    fn environment_strategy() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            Just(Some("production".to_string())),
            Just(Some("staging".to_string())),
            "[a-z]{1,10}".prop_map(Some),
        ]
    }

    proptest! {
        #[test]
        fn prop_risk_score_bounded_and_deterministic(
            remediation_type in remediation_type_strategy(),
            resource_type in resource_type_strategy(),
            environment in environment_strategy(),
        ) {
            let plan = plan(remediation_type, &resource_type, environment.as_deref());
            let assessor = RiskAssessor::new();

            let first = assessor.assess_risk(&plan);
            let second = assessor.assess_risk(&plan);

            prop_assert!((0.0..=MAX_RISK_SCORE).contains(&first));
            prop_assert_eq!(first, second);
            prop_assert!(first >= RiskAssessor::base_score(remediation_type));
        }

        #[test]
        fn prop_auto_approval_respects_threshold(
            remediation_type in remediation_type_strategy(),
            resource_type in resource_type_strategy(),
            environment in environment_strategy(),
            threshold in 0.0f64..=10.0,
        ) {
            let mut plan = plan(remediation_type, &resource_type, environment.as_deref());
            let impact = ImpactAnalyzer::new().analyze(&plan);
            let risk = impact.risk_score;
            plan.estimated_impact = Some(impact);

            let manager = ApprovalManager::new(threshold);
            let approved = tokio_test::block_on(manager.request_approval(&plan));

            if risk >= threshold {
                prop_assert!(approved.is_err());
            }
            if let Ok(auto) = approved {
                prop_assert!(auto);
                prop_assert!(risk < threshold);
            }
        }
    }
}
