//! Monthly cost estimation

use crate::models::{CostImpact, RemediationPlan, RemediationType};
use std::collections::HashMap;

/// Estimates the monthly cost delta of a plan from a static price table
#[derive(Debug, Clone)]
pub struct CostCalculator {
    monthly_prices: HashMap<String, f64>,
    currency: String,
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl CostCalculator {
    /// Create a calculator with the built-in price table (USD per month)
    pub fn new() -> Self {
        let monthly_prices = [
            ("aws_instance", 100.0),
            ("aws_rds_instance", 200.0),
            ("aws_eks_cluster", 500.0),
            ("azure_vm", 100.0),
            ("azure_sql_database", 150.0),
            ("gcp_compute_instance", 100.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            monthly_prices,
            currency: "USD".to_string(),
        }
    }

    /// Override or add a monthly price
    pub fn with_price(mut self, resource_type: impl Into<String>, monthly: f64) -> Self {
        self.monthly_prices.insert(resource_type.into(), monthly);
        self
    }

    /// Monthly price of a resource type; unknown types cost nothing
    pub fn monthly_price(&self, resource_type: &str) -> f64 {
        self.monthly_prices.get(resource_type).copied().unwrap_or(0.0)
    }

    /// Estimate the cost impact of a plan
    pub fn calculate_cost_impact(&self, plan: &RemediationPlan) -> CostImpact {
        let base = self.monthly_price(&plan.resource_type);
        let resizes = plan.changes.iter().any(|c| c.path.contains("instance_type"));

        let (current, new, one_time) = match plan.remediation_type {
            RemediationType::Create => (0.0, base, 0.0),
            RemediationType::Delete => (base, 0.0, 0.0),
            RemediationType::Replace => (base, base, base * 0.1),
            RemediationType::Update if resizes => (base, base * 1.5, 0.0),
            RemediationType::Update | RemediationType::Import => (base, base, 0.0),
        };

        CostImpact {
            current_monthly_cost: current,
            new_monthly_cost: new,
            monthly_savings: current - new,
            one_time_cost: one_time,
            currency: self.currency.clone(),
        }
    }
}
