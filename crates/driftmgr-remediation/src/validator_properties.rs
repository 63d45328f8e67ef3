//! Property-based tests for plan validation
//!
//! **Property 1: A production delete is never valid**
//! **Property 2: Only more than `MAX_CRITICAL_CHANGES` critical changes invalidate a plan**

#[cfg(test)]
mod tests {
    use crate::models::{Change, ChangeAction, RemediationType, Sensitivity};
    use crate::test_support::plan;
    use crate::validator::{PlanValidator, MAX_CRITICAL_CHANGES};
    use proptest::prelude::*;

    fn resource_type_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("aws_instance".to_string()),
            Just("aws_rds_instance".to_string()),
            Just("aws_s3_bucket".to_string()),
            "[a-z]{2,8}_[a-z]{2,10}",
        ]
    }

    fn change(index: usize, sensitivity: Sensitivity) -> Change {
        Change {
            path: format!("attribute_{index}"),
            action: ChangeAction::Update,
            old_value: Some("observed".into()),
            new_value: Some("declared".into()),
            sensitivity,
        }
    }

    proptest! {
        #[test]
        fn prop_production_delete_is_invalid(
            resource_type in resource_type_strategy(),
            changes in 0usize..10,
        ) {
            let mut plan = plan(RemediationType::Delete, &resource_type, Some("production"));
            plan.changes = (0..changes).map(|i| change(i, Sensitivity::Low)).collect();

            let result = PlanValidator::new().validate(&plan);

            prop_assert!(!result.valid);
            prop_assert!(!result.errors.is_empty());
            prop_assert_eq!(result.estimated_changes, changes);
        }

        #[test]
        fn prop_critical_change_limit(critical in 0usize..12) {
            let mut plan = plan(RemediationType::Update, "custom_widget", None);
            plan.changes = (0..critical).map(|i| change(i, Sensitivity::Critical)).collect();

            let result = PlanValidator::new().validate(&plan);

            prop_assert_eq!(result.valid, critical <= MAX_CRITICAL_CHANGES);
        }
    }
}
