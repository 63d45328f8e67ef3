//! Risk scoring for remediation plans

use crate::models::{RemediationPlan, RemediationType};

/// Resource type keywords marking critical infrastructure
const CRITICAL_KEYWORDS: &[&str] = &["database", "rds", "sql", "storage", "network", "security"];

/// Highest possible risk score
pub const MAX_RISK_SCORE: f64 = 10.0;

/// Scores the blast radius of a plan on a `[0, 10]` scale
///
/// The score is a pure function of the plan:
/// - base score by remediation type
/// - +2 when the resource type names critical infrastructure
/// - +3 for production, +1 for staging (from `tags.environment`)
#[derive(Debug, Clone, Default)]
pub struct RiskAssessor;

impl RiskAssessor {
    /// Create a risk assessor
    pub fn new() -> Self {
        Self
    }

    /// Base score of a remediation type
    pub fn base_score(remediation_type: RemediationType) -> f64 {
        match remediation_type {
            RemediationType::Delete => 7.0,
            RemediationType::Replace => 6.0,
            RemediationType::Update => 3.0,
            RemediationType::Create => 2.0,
            RemediationType::Import => 1.0,
        }
    }

    /// Whether a resource type names critical infrastructure
    pub fn is_critical_type(resource_type: &str) -> bool {
        let lower = resource_type.to_lowercase();
        CRITICAL_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    /// Score a plan
    pub fn assess_risk(&self, plan: &RemediationPlan) -> f64 {
        let mut score = Self::base_score(plan.remediation_type);

        if Self::is_critical_type(&plan.resource_type) {
            score += 2.0;
        }

        score += match plan.environment() {
            Some("production") => 3.0,
            Some("staging") => 1.0,
            _ => 0.0,
        };

        score.clamp(0.0, MAX_RISK_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::plan;

    #[test]
    fn test_base_scores() {
        let assessor = RiskAssessor::new();
        for (kind, expected) in [
            (RemediationType::Delete, 7.0),
            (RemediationType::Replace, 6.0),
            (RemediationType::Update, 3.0),
            (RemediationType::Create, 2.0),
            (RemediationType::Import, 1.0),
        ] {
            assert_eq!(assessor.assess_risk(&plan(kind, "aws_instance", None)), expected);
        }
    }

    #[test]
    fn test_critical_keyword_counts_once() {
        let assessor = RiskAssessor::new();
        // matches both "security" and "network"
        let p = plan(RemediationType::Update, "aws_network_security_group", None);
        assert_eq!(assessor.assess_risk(&p), 5.0);
        assert!(RiskAssessor::is_critical_type("AWS_RDS_INSTANCE"));
    }

    #[test]
    fn test_environment_adjustment() {
        let assessor = RiskAssessor::new();
        assert_eq!(
            assessor.assess_risk(&plan(RemediationType::Create, "aws_instance", Some("staging"))),
            3.0
        );
        assert_eq!(
            assessor.assess_risk(&plan(RemediationType::Create, "aws_instance", Some("production"))),
            5.0
        );
        assert_eq!(
            assessor.assess_risk(&plan(RemediationType::Create, "aws_instance", Some("dev"))),
            2.0
        );
    }

    #[test]
    fn test_clamped_at_ten() {
        let p = plan(RemediationType::Delete, "aws_rds_instance", Some("production"));
        assert_eq!(RiskAssessor::new().assess_risk(&p), 10.0);
    }
}
