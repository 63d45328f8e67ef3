//! Condition evaluation for workflow preconditions and step gates

use crate::models::{ConditionOperator, StepCondition, WorkflowContext};
use serde_json::Value;

/// Evaluates conditions against an execution context
///
/// Fields are dotted paths rooted at one of:
/// - `parameters.<key>...`
/// - `state.<resource>...`
/// - `metadata.<key>...`
/// - `user`, `workflow_id`, `execution_id`
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate every condition; an empty list holds
    pub fn evaluate_all(conditions: &[StepCondition], context: &WorkflowContext) -> bool {
        conditions.iter().all(|c| Self::evaluate(c, context))
    }

    /// Evaluate a single condition
    ///
    /// A missing field fails every operator except `not_exists`.
    pub fn evaluate(condition: &StepCondition, context: &WorkflowContext) -> bool {
        let resolved = Self::resolve_field(&condition.field, context);

        match (condition.operator, resolved) {
            (ConditionOperator::NotExists, resolved) => resolved.is_none(),
            (_, None) => false,
            (ConditionOperator::Exists, Some(_)) => true,
            (ConditionOperator::Equals, Some(left)) => Self::values_equal(&left, &condition.value),
            (ConditionOperator::NotEquals, Some(left)) => {
                !Self::values_equal(&left, &condition.value)
            }
            (ConditionOperator::GreaterThan, Some(left)) => {
                matches!(Self::compare_numbers(&left, &condition.value), Some(o) if o.is_gt())
            }
            (ConditionOperator::LessThan, Some(left)) => {
                matches!(Self::compare_numbers(&left, &condition.value), Some(o) if o.is_lt())
            }
            (ConditionOperator::Contains, Some(left)) => Self::contains(&left, &condition.value),
        }
    }

    /// Resolve a dotted field path in the context
    pub fn resolve_field(field: &str, context: &WorkflowContext) -> Option<Value> {
        let mut parts = field.split('.');
        let root = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        let start = match root {
            "user" => return rest.is_empty().then(|| Value::String(context.user.clone())),
            "workflow_id" => {
                return rest
                    .is_empty()
                    .then(|| Value::String(context.workflow_id.clone()))
            }
            "execution_id" => {
                return rest
                    .is_empty()
                    .then(|| Value::String(context.execution_id.clone()))
            }
            "parameters" => &context.parameters,
            "state" => &context.state,
            "metadata" => &context.metadata,
            _ => return None,
        };

        let (first, tail) = rest.split_first()?;
        let mut current = start.get(*first)?;
        for key in tail {
            current = match current {
                Value::Object(map) => map.get(*key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    fn values_equal(left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Number(_), Value::Number(_)) => {
                Self::compare_numbers(left, right).map_or(false, |o| o.is_eq())
            }
            // Conditions written in YAML often quote scalars
            (Value::String(l), Value::Number(r)) => l == &r.to_string(),
            (Value::Number(l), Value::String(r)) => &l.to_string() == r,
            (Value::String(l), Value::Bool(r)) => l == &r.to_string(),
            (Value::Bool(l), Value::String(r)) => &l.to_string() == r,
            _ => left == right,
        }
    }

    fn compare_numbers(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
        let l = Self::as_number(left)?;
        let r = Self::as_number(right)?;
        l.partial_cmp(&r)
    }

    fn as_number(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn contains(haystack: &Value, needle: &Value) -> bool {
        match (haystack, needle) {
            (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| Self::values_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        }
    }
}
