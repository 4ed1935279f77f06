//! [`WorkflowRunner`]: walks a [`WorkflowDefinition`]'s step graph,
//! advancing one step at a time (spec.md §4.8 "Execution algorithm").
//!
//! Grounded on `engine/executor.rs::WorkflowExecutor::process_workflow`'s
//! action-processing loop, de-event-sourced: the teacher replays a
//! workflow's full event history through `on_activity_completed` et al.
//! on every call; this runner instead advances a live
//! [`super::context::WorkflowContext`] directly, since spec.md §4.8
//! describes plain sequential-with-branching execution rather than
//! replay-based recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::context::WorkflowContext;
use super::definition::{OnError, Step, StepKind, WorkflowDefinition};
use crate::dispatcher::Dispatcher;
use crate::error::{ErrorCategory, TaskforgeError};
use crate::model::{RunStatus, TriggerSource, WorkKind, WorkSpec};

/// In-process callable a `lambda` step invokes with the live context.
pub type LambdaFn = Arc<dyn Fn(&WorkflowContext) -> Result<Value, TaskforgeError> + Send + Sync>;
/// Predicate a `choice` step invokes to pick one of its branch keys.
pub type ChoiceFn = Arc<dyn Fn(&WorkflowContext) -> Result<String, TaskforgeError> + Send + Sync>;

/// Name-addressed lambda/choice callbacks a [`WorkflowRunner`] resolves
/// steps against, the same `(namespace, name) -> callable` shape
/// [`crate::registry::HandlerRegistry`] uses for tasks and pipelines.
#[derive(Default, Clone)]
pub struct WorkflowCallbacks {
    lambdas: HashMap<String, LambdaFn>,
    choices: HashMap<String, ChoiceFn>,
}

impl WorkflowCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_lambda(&mut self, name: impl Into<String>, f: LambdaFn) {
        self.lambdas.insert(name.into(), f);
    }

    pub fn register_choice(&mut self, name: impl Into<String>, f: ChoiceFn) {
        self.choices.insert(name.into(), f);
    }

    fn lambda(&self, name: &str) -> Result<LambdaFn, TaskforgeError> {
        self.lambdas.get(name).cloned().ok_or_else(|| TaskforgeError::HandlerNotFound { kind: "lambda".to_string(), name: name.to_string() })
    }

    fn choice(&self, name: &str) -> Result<ChoiceFn, TaskforgeError> {
        self.choices.get(name).cloned().ok_or_else(|| TaskforgeError::HandlerNotFound { kind: "choice".to_string(), name: name.to_string() })
    }
}

/// What a single step run produced: either a value recorded in
/// `step_outputs`, or (for `choice`) the chosen branch's target step
/// name.
pub(crate) enum StepExecution {
    Output(Value),
    Branch(String),
}

/// Drives one [`WorkflowDefinition`] to completion against a caller-owned
/// [`WorkflowContext`]. Stateless and cheap to clone (everything behind
/// `Arc`); a single instance is shared by every workflow run.
pub struct WorkflowRunner {
    dispatcher: Arc<Dispatcher>,
    callbacks: Arc<WorkflowCallbacks>,
    pipeline_wait_timeout: Duration,
}

impl WorkflowRunner {
    pub fn new(dispatcher: Arc<Dispatcher>, callbacks: Arc<WorkflowCallbacks>) -> Self {
        Self { dispatcher, callbacks, pipeline_wait_timeout: Duration::from_secs(3600) }
    }

    pub fn with_pipeline_wait_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline_wait_timeout = timeout;
        self
    }

    /// Execute `definition` start to finish, returning the last
    /// recorded step output as the workflow's own result.
    pub async fn run(&self, definition: &WorkflowDefinition, context: &mut WorkflowContext) -> Result<Value, TaskforgeError> {
        definition.validate()?;
        let mut step = definition.entry().cloned().ok_or_else(|| TaskforgeError::Validation(format!("workflow '{}' has no entry step", definition.name)))?;
        let mut last_output = Value::Null;

        loop {
            context.current_step = Some(step.name.clone());
            let next_name = match self.execute_step(&step, context).await {
                Ok(StepExecution::Output(output)) => {
                    context.set_step_output(step.name.clone(), output.clone());
                    last_output = output;
                    step.next_step.clone().or_else(|| definition.next_in_order(&step.name).map(|s| s.name.clone()))
                }
                Ok(StepExecution::Branch(target)) => Some(target),
                Err(err) => match &step.on_error {
                    OnError::Continue => {
                        context.set_step_output(step.name.clone(), Value::Null);
                        last_output = Value::Null;
                        step.next_step.clone().or_else(|| definition.next_in_order(&step.name).map(|s| s.name.clone()))
                    }
                    OnError::Fail | OnError::Retry { .. } => return Err(err),
                },
            };

            step = match next_name {
                Some(name) => definition.step(&name).cloned().ok_or_else(|| TaskforgeError::Internal(format!("step '{name}' not found")))?,
                None => break,
            };
        }

        Ok(last_output)
    }

    /// Run `step` once, applying its `on_error` retry policy if it has
    /// one. Does not advance the context's `step_outputs`; callers
    /// (here and [`super::tracked::TrackedWorkflowRunner`]) record the
    /// result themselves once they've decided how to account for it.
    pub(crate) async fn execute_step(&self, step: &Step, context: &WorkflowContext) -> Result<StepExecution, TaskforgeError> {
        match &step.on_error {
            OnError::Retry { policy } => {
                let mut attempt = 1;
                loop {
                    match self.run_step_body(step, context).await {
                        Ok(outcome) => return Ok(outcome),
                        Err(_) if policy.should_retry(None) && policy.has_attempts_remaining(attempt) => {
                            let delay = policy.delay_for_attempt(attempt);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            attempt += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            OnError::Fail | OnError::Continue => self.run_step_body(step, context).await,
        }
    }

    async fn run_step_body(&self, step: &Step, context: &WorkflowContext) -> Result<StepExecution, TaskforgeError> {
        match &step.kind {
            StepKind::Lambda { callback } => {
                let f = self.callbacks.lambda(callback)?;
                Ok(StepExecution::Output(f(context)?))
            }
            StepKind::Pipeline { pipeline_name, params_template } => {
                let params = context.render(params_template)?;
                let spec = WorkSpec::new(WorkKind::Pipeline, pipeline_name.clone(), TriggerSource::ParentWorkflow)
                    .with_params(params)
                    .with_parent_run_id(context.workflow_run_id.clone());
                let run_id = self.dispatcher.submit(spec).await?;
                let run = self.dispatcher.wait(&run_id, self.pipeline_wait_timeout).await?;
                if run.status == RunStatus::Completed {
                    Ok(StepExecution::Output(run.result.unwrap_or(Value::Null)))
                } else {
                    let category = run.error_category.unwrap_or(ErrorCategory::Permanent);
                    Err(TaskforgeError::Handler {
                        message: run.error.unwrap_or_else(|| format!("pipeline step '{}' ended in status {}", step.name, run.status)),
                        category,
                        retryable: category.is_retryable_by_default(),
                    })
                }
            }
            StepKind::Choice { predicate, branches } => {
                let f = self.callbacks.choice(predicate)?;
                let key = f(context)?;
                branches
                    .get(&key)
                    .cloned()
                    .map(StepExecution::Branch)
                    .ok_or_else(|| TaskforgeError::Validation(format!("choice step '{}' predicate returned unknown branch '{key}'", step.name)))
            }
        }
    }
}
