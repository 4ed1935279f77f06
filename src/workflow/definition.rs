//! [`WorkflowDefinition`]: the immutable step-graph blueprint a
//! [`super::runner::WorkflowRunner`] executes (spec.md §4.8).
//!
//! Grounded on the teacher's `definition.rs::Workflow` trait and
//! `action.rs::WorkflowAction`, generalized from a replay-driven state
//! machine (one Rust type per workflow, advanced by feeding it events)
//! to a declarative step list any runner can walk — lambdas and choice
//! predicates are looked up by name in a [`super::runner::WorkflowCallbacks`]
//! registry rather than compiled into the `Workflow` impl itself, the
//! same shift `registry.rs::HandlerRegistry` already made for tasks.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskforgeError;
use crate::resilience::RetryPolicy;

/// What happens to a workflow run when a step fails (spec.md §4.8
/// "Failure policies per step").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnError {
    /// Step error terminates the workflow (default).
    Fail,
    /// Error is logged, the step's output is recorded as `null`, and
    /// execution advances.
    Continue,
    /// Re-attempt the step per `policy`; falls back to `Fail` once
    /// exhausted.
    Retry { policy: RetryPolicy },
}

impl Default for OnError {
    fn default() -> Self {
        Self::Fail
    }
}

/// What a step does when it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// An in-process callable, looked up by name in the runner's
    /// [`super::runner::WorkflowCallbacks`] and invoked with the live
    /// context.
    Lambda { callback: String },
    /// A pipeline submitted through the dispatcher. `params_template`
    /// is rendered against the context before submission (spec.md §4.8
    /// step 2, "rendered from the context").
    Pipeline {
        pipeline_name: String,
        #[serde(default)]
        params_template: Value,
    },
    /// A predicate, looked up by name, that picks the next step by
    /// returning one of `branches`' keys.
    Choice {
        predicate: String,
        branches: HashMap<String, String>,
    },
}

/// One node in a [`WorkflowDefinition`]'s step graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub on_error: OnError,
    /// Explicit successor for `lambda`/`pipeline` steps. `None` falls
    /// back to the next step in `steps`' insertion order (spec.md §4.8
    /// step 2, "Determine next step").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

impl Step {
    pub fn lambda(name: impl Into<String>, callback: impl Into<String>) -> Self {
        Self { name: name.into(), kind: StepKind::Lambda { callback: callback.into() }, on_error: OnError::Fail, next_step: None }
    }

    pub fn pipeline(name: impl Into<String>, pipeline_name: impl Into<String>, params_template: Value) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Pipeline { pipeline_name: pipeline_name.into(), params_template },
            on_error: OnError::Fail,
            next_step: None,
        }
    }

    pub fn choice(name: impl Into<String>, predicate: impl Into<String>, branches: HashMap<String, String>) -> Self {
        Self { name: name.into(), kind: StepKind::Choice { predicate: predicate.into(), branches }, on_error: OnError::Fail, next_step: None }
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_next_step(mut self, next: impl Into<String>) -> Self {
        self.next_step = Some(next.into());
        self
    }
}

/// Immutable workflow blueprint (spec.md §3 "WorkflowDefinition").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: u32,
    pub steps: Vec<Step>,
    /// Step to start from. Defaults to `steps[0]` per spec.md §4.8 step 1
    /// ("first step (index 0 by insertion order) unless the definition
    /// names an explicit entry").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_step: Option<String>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: u32, steps: Vec<Step>) -> Self {
        Self { name: name.into(), version, steps, entry_step: None }
    }

    pub fn with_entry_step(mut self, name: impl Into<String>) -> Self {
        self.entry_step = Some(name.into());
        self
    }

    pub fn entry(&self) -> Option<&Step> {
        let name = self.entry_step.as_deref().unwrap_or(&self.steps.first()?.name);
        self.step(name)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The step that follows `name` in insertion order, if any.
    pub fn next_in_order(&self, name: &str) -> Option<&Step> {
        let index = self.steps.iter().position(|s| s.name == name)?;
        self.steps.get(index + 1)
    }

    /// Check every `next_step` and `choice` branch resolves to a step
    /// name that actually exists in this workflow (spec.md §3
    /// invariant, "validated at definition time").
    pub fn validate(&self) -> Result<(), TaskforgeError> {
        if self.steps.is_empty() {
            return Err(TaskforgeError::Validation(format!("workflow '{}' has no steps", self.name)));
        }

        let names: HashSet<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        if names.len() != self.steps.len() {
            return Err(TaskforgeError::Validation(format!("workflow '{}' has duplicate step names", self.name)));
        }

        if let Some(entry) = &self.entry_step {
            if !names.contains(entry.as_str()) {
                return Err(TaskforgeError::Validation(format!("workflow '{}' entry_step '{entry}' does not exist", self.name)));
            }
        }

        for step in &self.steps {
            if let Some(next) = &step.next_step {
                if !names.contains(next.as_str()) {
                    return Err(TaskforgeError::Validation(format!(
                        "workflow '{}' step '{}' next_step '{next}' does not exist",
                        self.name, step.name
                    )));
                }
            }
            if let StepKind::Choice { branches, .. } = &step.kind {
                for target in branches.values() {
                    if !names.contains(target.as_str()) {
                        return Err(TaskforgeError::Validation(format!(
                            "workflow '{}' choice step '{}' branch target '{target}' does not exist",
                            self.name, step.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_workflow() {
        let def = WorkflowDefinition::new("empty", 1, vec![]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_step_names() {
        let def = WorkflowDefinition::new("dup", 1, vec![Step::lambda("a", "noop"), Step::lambda("a", "noop")]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_next_step() {
        let def = WorkflowDefinition::new("dangling", 1, vec![Step::lambda("a", "noop").with_next_step("missing")]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_choice_branch() {
        let mut branches = HashMap::new();
        branches.insert("yes".to_string(), "missing".to_string());
        let def = WorkflowDefinition::new("dangling-choice", 1, vec![Step::choice("c", "always_yes", branches)]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_graph() {
        let mut branches = HashMap::new();
        branches.insert("heavy".to_string(), "big".to_string());
        branches.insert("light".to_string(), "small".to_string());
        let def = WorkflowDefinition::new(
            "s6",
            1,
            vec![
                Step::lambda("classify", "classify_fn").with_next_step("choice"),
                Step::choice("choice", "pick_branch", branches),
                Step::pipeline("big", "big_pipeline", Value::Null),
                Step::pipeline("small", "small_pipeline", Value::Null),
            ],
        );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn entry_defaults_to_first_step() {
        let def = WorkflowDefinition::new("e", 1, vec![Step::lambda("first", "noop"), Step::lambda("second", "noop")]);
        assert_eq!(def.entry().unwrap().name, "first");
    }

    #[test]
    fn next_in_order_falls_back_past_explicit_next_step() {
        let def = WorkflowDefinition::new("order", 1, vec![Step::lambda("a", "noop"), Step::lambda("b", "noop")]);
        assert_eq!(def.next_in_order("a").unwrap().name, "b");
        assert!(def.next_in_order("b").is_none());
    }
}
