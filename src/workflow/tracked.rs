//! [`TrackedWorkflowRunner`]: the [`crate::handler::Handler`] a workflow
//! name is registered under, wrapping [`super::runner::WorkflowRunner`]
//! to persist every step as a child run (spec.md §4.8
//! "TrackedWorkflowRunner").
//!
//! Grounded on `engine/executor.rs::WorkflowExecutor::process_workflow`'s
//! append-event-per-action pattern, redirected from a shared workflow
//! event log onto per-step [`crate::model::RunRecord`]s so the Ledger
//! ends up with a queryable tree: workflow run -> step runs -> (for
//! pipeline steps) the nested pipeline run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::context::WorkflowContext;
use super::definition::{OnError, WorkflowDefinition};
use super::runner::{StepExecution, WorkflowRunner};
use crate::error::TaskforgeError;
use crate::handler::{Handler, HandlerContext};
use crate::ledger::ExecutionLedger;
use crate::model::{EventType, RunEvent, RunRecord, TriggerSource, WorkKind, WorkSpec};

/// A [`Handler`] that runs one fixed [`WorkflowDefinition`] every time
/// it's invoked, registered under the definition's name in the
/// `pipeline` namespace (spec.md §1, "a Workflow is itself executed as
/// a pipeline whose handler is the workflow runner").
pub struct TrackedWorkflowRunner {
    definition: WorkflowDefinition,
    runner: WorkflowRunner,
    ledger: Arc<dyn ExecutionLedger>,
}

impl TrackedWorkflowRunner {
    pub fn new(definition: WorkflowDefinition, runner: WorkflowRunner, ledger: Arc<dyn ExecutionLedger>) -> Result<Self, TaskforgeError> {
        definition.validate()?;
        Ok(Self { definition, runner, ledger })
    }

    async fn create_step_run(&self, workflow_run_id: &str, step_name: &str) -> Result<RunRecord, TaskforgeError> {
        let spec = WorkSpec::new(WorkKind::Step, step_name, TriggerSource::ParentWorkflow).with_parent_run_id(workflow_run_id);
        let now = Utc::now();
        let mut run = RunRecord::new_pending(spec, "workflow", now);
        self.ledger.create_run(run.clone()).await?;
        let started = RunEvent::new(run.run_id.clone(), EventType::Started, json!({}), "workflow", now);
        run.sequence = self.ledger.append_event(started, run.sequence).await?;
        Ok(run)
    }

    async fn complete_step_run(&self, run: &RunRecord, output: &Value) -> Result<(), TaskforgeError> {
        let event = RunEvent::new(run.run_id.clone(), EventType::Completed, output.clone(), "workflow", Utc::now());
        self.ledger.append_event(event, run.sequence).await?;
        Ok(())
    }

    async fn fail_step_run(&self, run: &RunRecord, err: &TaskforgeError) -> Result<(), TaskforgeError> {
        let data = json!({"message": err.to_string(), "category": err.category().to_string()});
        let event = RunEvent::new(run.run_id.clone(), EventType::Failed, data, "workflow", Utc::now());
        self.ledger.append_event(event, run.sequence).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler for TrackedWorkflowRunner {
    async fn handle(&self, ctx: &HandlerContext, params: Value) -> Result<Value, TaskforgeError> {
        let mut context = WorkflowContext::new(ctx.run_id.clone(), params);
        let mut step = self
            .definition
            .entry()
            .cloned()
            .ok_or_else(|| TaskforgeError::Validation(format!("workflow '{}' has no entry step", self.definition.name)))?;
        let mut last_output = Value::Null;

        loop {
            context.current_step = Some(step.name.clone());
            let step_run = self.create_step_run(&ctx.run_id, &step.name).await?;
            let execution = self.runner.execute_step(&step, &context).await;

            let next_name = match execution {
                Ok(StepExecution::Output(output)) => {
                    self.complete_step_run(&step_run, &output).await?;
                    context.set_step_output(step.name.clone(), output.clone());
                    last_output = output;
                    step.next_step.clone().or_else(|| self.definition.next_in_order(&step.name).map(|s| s.name.clone()))
                }
                Ok(StepExecution::Branch(target)) => {
                    self.complete_step_run(&step_run, &json!({"branch": target})).await?;
                    Some(target)
                }
                Err(err) => {
                    self.fail_step_run(&step_run, &err).await?;
                    match &step.on_error {
                        OnError::Continue => {
                            context.set_step_output(step.name.clone(), Value::Null);
                            last_output = Value::Null;
                            step.next_step.clone().or_else(|| self.definition.next_in_order(&step.name).map(|s| s.name.clone()))
                        }
                        OnError::Fail | OnError::Retry { .. } => return Err(err),
                    }
                }
            };

            step = match next_name {
                Some(name) => self.definition.step(&name).cloned().ok_or_else(|| TaskforgeError::Internal(format!("step '{name}' not found")))?,
                None => break,
            };
        }

        Ok(last_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::executor::MemoryExecutor;
    use crate::ledger::{InMemoryLedger, RunFilter};
    use crate::model::WorkKind;
    use crate::registry::HandlerRegistry;
    use crate::workflow::definition::Step;
    use crate::workflow::runner::WorkflowCallbacks;
    use serde_json::json;

    struct EchoPipeline;

    #[async_trait]
    impl Handler for EchoPipeline {
        async fn handle(&self, _ctx: &HandlerContext, params: Value) -> Result<Value, TaskforgeError> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn tracked_runner_persists_one_child_run_per_step() {
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Pipeline, "echo_pipeline", Arc::new(EchoPipeline)).unwrap();
        let registry = Arc::new(registry);
        let ledger: Arc<dyn ExecutionLedger> = Arc::new(InMemoryLedger::new());
        let executor = Arc::new(MemoryExecutor::new("memory", registry.clone(), ledger.clone()));
        let dispatcher = Arc::new(Dispatcher::new(ledger.clone(), registry.clone(), DispatcherConfig::new("memory")).with_executor(executor));

        let callbacks = Arc::new(WorkflowCallbacks::new());
        let runner = WorkflowRunner::new(dispatcher, callbacks);

        let definition = WorkflowDefinition::new(
            "order_workflow",
            1,
            vec![Step::pipeline("validate", "echo_pipeline", json!({"ok": true})).with_next_step("ship"), Step::pipeline("ship", "echo_pipeline", json!({"shipped": true}))],
        );
        let tracked = TrackedWorkflowRunner::new(definition, runner, ledger.clone()).unwrap();

        let ctx = HandlerContext::new("workflow-run-1", 1, 1);
        let result = tracked.handle(&ctx, json!({})).await.unwrap();
        assert_eq!(result, json!({"shipped": true}));

        let steps = ledger
            .list_runs(RunFilter { parent_run_id: Some("workflow-run-1".to_string()), ..Default::default() }, Default::default())
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|r| r.spec.kind == WorkKind::Step));
    }
}
