//! [`PipelineGroup`] (legacy v1, spec.md §4.9): a static ordered list of
//! pipelines with optional dependency edges, executed in topological
//! order with no data passed between steps. Superseded by
//! [`crate::workflow`] for new work; kept for migration.
//!
//! Grounded on `workflow/definition.rs`'s step-list shape, stripped down
//! to what spec.md §4.9 actually describes: submission order and
//! pass/fail, nothing else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::TaskforgeError;
use crate::model::{RunStatus, TriggerSource, WorkKind, WorkSpec};

/// One step of a [`PipelineGroupDefinition`]: a named slot bound to a
/// pipeline handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupStep {
    pub step_name: String,
    pub pipeline_name: String,
}

impl GroupStep {
    pub fn new(step_name: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        Self { step_name: step_name.into(), pipeline_name: pipeline_name.into() }
    }
}

/// Static definition: an ordered step list plus optional `(before,
/// after)` dependency edges. No parameter templating, no context —
/// each pipeline runs with empty params.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineGroupDefinition {
    pub name: String,
    pub steps: Vec<GroupStep>,
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

impl PipelineGroupDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<GroupStep>) -> Self {
        Self { name: name.into(), steps, edges: Vec::new() }
    }

    pub fn with_edges(mut self, edges: Vec<(String, String)>) -> Self {
        self.edges = edges;
        self
    }

    /// Kahn's algorithm over `steps`/`edges`, breaking ties by the
    /// steps' own declaration order so two independent steps still run
    /// in a deterministic sequence.
    fn topological_order(&self) -> Result<Vec<&GroupStep>, TaskforgeError> {
        let names: HashSet<&str> = self.steps.iter().map(|s| s.step_name.as_str()).collect();
        for (before, after) in &self.edges {
            if !names.contains(before.as_str()) || !names.contains(after.as_str()) {
                return Err(TaskforgeError::Validation(format!(
                    "pipeline group '{}' edge ({before}, {after}) references an unknown step",
                    self.name
                )));
            }
        }

        let mut in_degree: HashMap<&str, usize> = self.steps.iter().map(|s| (s.step_name.as_str(), 0)).collect();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for (before, after) in &self.edges {
            *in_degree.get_mut(after.as_str()).unwrap() += 1;
            successors.entry(before.as_str()).or_default().push(after.as_str());
        }

        let mut ready: Vec<&GroupStep> = self.steps.iter().filter(|s| in_degree[s.step_name.as_str()] == 0).collect();
        let mut ordered = Vec::with_capacity(self.steps.len());
        let mut remaining = in_degree;

        while !ready.is_empty() {
            ready.sort_by_key(|s| self.steps.iter().position(|x| x.step_name == s.step_name).unwrap());
            let step = ready.remove(0);
            ordered.push(step);
            if let Some(succs) = successors.get(step.step_name.as_str()) {
                for succ in succs {
                    let entry = remaining.get_mut(succ).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        ready.push(self.steps.iter().find(|s| s.step_name == *succ).unwrap());
                    }
                }
            }
        }

        if ordered.len() != self.steps.len() {
            return Err(TaskforgeError::Validation(format!("pipeline group '{}' has a dependency cycle", self.name)));
        }
        Ok(ordered)
    }
}

/// One step's outcome, as recorded on the group's own run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStepResult {
    pub step_name: String,
    pub run_id: String,
    pub status: RunStatus,
}

/// Submits a [`PipelineGroupDefinition`]'s steps through a [`Dispatcher`]
/// in topological order, waiting for each to finish before starting the
/// next and halting at the first non-`Completed` status.
pub struct PipelineGroupRunner {
    dispatcher: Arc<Dispatcher>,
    step_wait_timeout: Duration,
}

impl PipelineGroupRunner {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher, step_wait_timeout: Duration::from_secs(3600) }
    }

    pub fn with_step_wait_timeout(mut self, timeout: Duration) -> Self {
        self.step_wait_timeout = timeout;
        self
    }

    /// Run every step in topological order, stopping (without running
    /// later steps) at the first step that doesn't complete
    /// successfully.
    pub async fn run(&self, group: &PipelineGroupDefinition) -> Result<Vec<GroupStepResult>, TaskforgeError> {
        let order = group.topological_order()?;
        let mut results = Vec::with_capacity(order.len());

        for step in order {
            let spec = WorkSpec::new(WorkKind::Pipeline, step.pipeline_name.clone(), TriggerSource::Internal)
                .with_params(Value::Object(Default::default()));
            let run_id = self.dispatcher.submit(spec).await?;
            let run = self.dispatcher.wait(&run_id, self.step_wait_timeout).await?;
            let status = run.status;
            results.push(GroupStepResult { step_name: step.step_name.clone(), run_id, status });

            if status != RunStatus::Completed {
                break;
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::error::ErrorCategory;
    use crate::executor::MemoryExecutor;
    use crate::handler::{Handler, HandlerContext};
    use crate::ledger::{ExecutionLedger, InMemoryLedger};
    use crate::registry::HandlerRegistry;
    use async_trait::async_trait;

    struct OkPipeline;

    #[async_trait]
    impl Handler for OkPipeline {
        async fn handle(&self, _ctx: &HandlerContext, _params: Value) -> Result<Value, TaskforgeError> {
            Ok(Value::Null)
        }
    }

    struct FailPipeline;

    #[async_trait]
    impl Handler for FailPipeline {
        async fn handle(&self, _ctx: &HandlerContext, _params: Value) -> Result<Value, TaskforgeError> {
            Err(TaskforgeError::Handler { message: "nope".to_string(), category: ErrorCategory::Permanent, retryable: false })
        }
    }

    fn make_runner(fail_step_c: bool) -> PipelineGroupRunner {
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Pipeline, "a", Arc::new(OkPipeline)).unwrap();
        registry.register(WorkKind::Pipeline, "b", Arc::new(OkPipeline)).unwrap();
        let c: Arc<dyn Handler> = if fail_step_c { Arc::new(FailPipeline) } else { Arc::new(OkPipeline) };
        registry.register(WorkKind::Pipeline, "c", c).unwrap();
        let registry = Arc::new(registry);
        let ledger: Arc<dyn ExecutionLedger> = Arc::new(InMemoryLedger::new());
        let executor = Arc::new(MemoryExecutor::new("memory", registry.clone(), ledger.clone()));
        let dispatcher = Arc::new(Dispatcher::new(ledger, registry, DispatcherConfig::new("memory")).with_executor(executor));
        PipelineGroupRunner::new(dispatcher)
    }

    #[tokio::test]
    async fn runs_steps_in_dependency_order() {
        let runner = make_runner(false);
        let group = PipelineGroupDefinition::new(
            "g1",
            vec![GroupStep::new("step_a", "a"), GroupStep::new("step_b", "b"), GroupStep::new("step_c", "c")],
        )
        .with_edges(vec![("step_c".to_string(), "step_a".to_string()), ("step_c".to_string(), "step_b".to_string())]);

        let results = runner.run(&group).await.unwrap();
        let names: Vec<&str> = results.iter().map(|r| r.step_name.as_str()).collect();
        assert_eq!(names[0], "step_c");
        assert!(results.iter().all(|r| r.status == RunStatus::Completed));
    }

    #[tokio::test]
    async fn halts_on_first_failure() {
        let runner = make_runner(true);
        let group = PipelineGroupDefinition::new("g2", vec![GroupStep::new("step_c", "c"), GroupStep::new("step_a", "a")]);
        let results = runner.run(&group).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RunStatus::Failed);
    }

    #[test]
    fn detects_dependency_cycle() {
        let group = PipelineGroupDefinition::new("cyclic", vec![GroupStep::new("x", "a"), GroupStep::new("y", "b")])
            .with_edges(vec![("x".to_string(), "y".to_string()), ("y".to_string(), "x".to_string())]);
        assert!(group.topological_order().is_err());
    }
}
