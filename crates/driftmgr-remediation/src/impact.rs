//! Impact analysis of remediation plans

use crate::cost::CostCalculator;
use crate::models::{
    ImpactAssessment, PerformanceImpact, RemediationPlan, RemediationType, SecurityImpact,
    Severity,
};
use crate::risk::RiskAssessor;
use crate::state::StateValue;
use std::time::Duration;
use tracing::debug;

/// Combines risk, cost, security and performance heuristics
///
/// The assessment is deterministic: the same plan always yields the same
/// assessment.
#[derive(Debug, Clone, Default)]
pub struct ImpactAnalyzer {
    risk_assessor: RiskAssessor,
    cost_calculator: CostCalculator,
}

impl ImpactAnalyzer {
    /// Create an analyzer with the built-in tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom cost calculator
    pub fn with_cost_calculator(mut self, cost_calculator: CostCalculator) -> Self {
        self.cost_calculator = cost_calculator;
        self
    }

    /// Risk assessor used by this analyzer
    pub fn risk_assessor(&self) -> &RiskAssessor {
        &self.risk_assessor
    }

    /// Assess a plan
    pub fn analyze(&self, plan: &RemediationPlan) -> ImpactAssessment {
        let risk_score = self.risk_assessor.assess_risk(plan);
        let severity = Severity::from_risk_score(risk_score);
        let approval_reason = match severity {
            Severity::Critical => Some("Critical risk level detected".to_string()),
            Severity::High => Some("High risk level detected".to_string()),
            _ => None,
        };

        debug!(
            plan_id = %plan.id,
            risk_score,
            severity = %severity,
            "Plan impact assessed"
        );

        ImpactAssessment {
            severity,
            risk_score,
            estimated_downtime: Self::estimate_downtime(plan),
            affected_resources: Self::affected_resources(plan),
            cost_impact: self.cost_calculator.calculate_cost_impact(plan),
            security_impact: Self::assess_security(plan),
            performance_impact: Self::assess_performance(plan),
            requires_approval: approval_reason.is_some(),
            approval_reason,
        }
    }

    fn estimate_downtime(plan: &RemediationPlan) -> Duration {
        match plan.remediation_type {
            RemediationType::Replace => Duration::from_secs(5 * 60),
            RemediationType::Delete => Duration::from_secs(60),
            RemediationType::Create => Duration::from_secs(3 * 60),
            RemediationType::Update if plan.critical_change_count() > 0 => {
                Duration::from_secs(2 * 60)
            }
            RemediationType::Update | RemediationType::Import => Duration::ZERO,
        }
    }

    // Dependency closure is owned by the drift source; only the plan's own
    // address is known here.
    fn affected_resources(plan: &RemediationPlan) -> Vec<String> {
        vec![plan.address()]
    }

    fn assess_security(plan: &RemediationPlan) -> SecurityImpact {
        let mut impact = SecurityImpact {
            current_score: 5.0,
            new_score: 5.0,
            improvements: Vec::new(),
            new_risks: Vec::new(),
            compliance_impact: Vec::new(),
        };

        let resource_type = plan.resource_type.to_lowercase();
        if resource_type.contains("security_group") {
            impact
                .compliance_impact
                .push("Network Security Compliance".to_string());
        }
        if resource_type.contains("iam") || resource_type.contains("role") {
            impact
                .compliance_impact
                .push("Access Control Compliance".to_string());
        }

        for change in &plan.changes {
            let new_bool = change.new_value.as_ref().and_then(StateValue::as_bool);
            if change.path.contains("encryption") {
                match new_bool {
                    Some(true) => {
                        impact.improvements.push("Enabled encryption".to_string());
                        impact.new_score += 1.0;
                    }
                    Some(false) => {
                        impact.new_risks.push("Disabled encryption".to_string());
                        impact.new_score -= 1.0;
                        if !impact
                            .compliance_impact
                            .iter()
                            .any(|c| c == "Data Encryption Compliance")
                        {
                            impact
                                .compliance_impact
                                .push("Data Encryption Compliance".to_string());
                        }
                    }
                    None => {}
                }
            }
            if change.path.contains("public_access") && new_bool == Some(false) {
                impact.improvements.push("Disabled public access".to_string());
                impact.new_score += 1.0;
            }
        }

        impact.new_score = impact.new_score.clamp(0.0, 10.0);
        impact
    }

    fn assess_performance(plan: &RemediationPlan) -> PerformanceImpact {
        let mut metrics = Vec::new();
        for change in &plan.changes {
            if change.path.contains("instance_type") || change.path.contains("size") {
                metrics.push("compute_capacity".to_string());
            }
            if change.path.contains("storage") || change.path.contains("disk") {
                metrics.push("storage_capacity".to_string());
            }
        }

        PerformanceImpact {
            latency_change: "0%".to_string(),
            throughput_change: "0%".to_string(),
            availability_change: "0%".to_string(),
            metrics,
        }
    }
}
