//! Property-based tests for workflow execution
//!
//! **Property 1: Attempted steps never outnumber declared steps**
//! **Property 2: A successful auto-rollback always yields `rolled_back`**

#[cfg(test)]
mod tests {
    use crate::actions::{ActionHandler, ActionOutput};
    use crate::engine::{EngineConfig, WorkflowEngine};
    use crate::error::{Result, WorkflowError};
    use crate::models::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FailSet(HashSet<String>);

    #[async_trait]
    impl ActionHandler for FailSet {
        async fn execute(
            &self,
            step: &WorkflowStep,
            _context: &WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<ActionOutput> {
            if self.0.contains(&step.id) {
                Err(WorkflowError::StepFailed(step.id.clone()))
            } else {
                Ok(ActionOutput::new())
            }
        }
    }

    /// (required, parallel, fails) per step
    fn steps_strategy() -> impl Strategy<Value = Vec<(bool, bool, bool)>> {
        prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 0..8)
    }

    fn run(workflow: Workflow, failing: HashSet<String>) -> WorkflowResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let engine = WorkflowEngine::with_handler(
                Arc::new(FailSet(failing)),
                EngineConfig::default().with_retry_backoff(Duration::from_millis(0)),
            );
            let id = workflow.id.clone();
            engine.register_workflow(workflow).await.unwrap();
            engine
                .execute_workflow(&id, WorkflowContext::new("prop"), CancellationToken::new())
                .await
                .unwrap()
                .wait()
                .await
        })
    }

    fn build(shape: &[(bool, bool, bool)]) -> (Workflow, HashSet<String>) {
        let mut workflow = Workflow::new("prop", "Prop");
        let mut failing = HashSet::new();
        for (i, (required, parallel, fails)) in shape.iter().enumerate() {
            let id = format!("step_{i}");
            let mut step = WorkflowStep::new(&id, &id, StepAction::Notify)
                .with_retries(1)
                .required(*required);
            if *parallel {
                step = step.parallel();
            }
            if *fails {
                failing.insert(id);
            }
            workflow = workflow.with_step(step);
        }
        (workflow, failing)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_step_results_bounded_by_declared_steps(shape in steps_strategy()) {
            let (workflow, failing) = build(&shape);
            let declared = workflow.steps.len();
            let any_fails = !failing.is_empty();
            let result = run(workflow, failing);

            prop_assert!(result.steps.len() <= declared);
            prop_assert!(result.status.is_terminal());
            for step in &result.steps {
                prop_assert!(step.attempts <= 2);
            }
            if !any_fails {
                prop_assert_eq!(result.status, WorkflowStatus::Completed);
                prop_assert_eq!(result.steps.len(), declared);
            }
        }

        #[test]
        fn prop_successful_rollback_yields_rolled_back(shape in steps_strategy()) {
            let (workflow, mut failing) = build(&shape);
            let workflow = workflow
                .with_rollback(vec![WorkflowStep::new("undo", "Undo", StepAction::Notify)], true);
            failing.remove("undo");
            let failed_forward = !failing.is_empty();
            let result = run(workflow, failing);

            if failed_forward {
                prop_assert_eq!(result.status, WorkflowStatus::RolledBack);
                prop_assert!(result.rollback.is_some());
            } else {
                prop_assert_eq!(result.status, WorkflowStatus::Completed);
                prop_assert!(result.rollback.is_none());
            }
        }
    }
}
