//! [`WorkflowContext`]: the live, per-run state a [`super::runner::WorkflowRunner`]
//! threads through step execution (spec.md §3 "WorkflowContext").
//!
//! Grounded on `activity/context.rs::ActivityContext`'s attempt/
//! cancellation bookkeeping, widened from one activity invocation's
//! scratch state to the whole workflow run's — `step_outputs` plays the
//! role the teacher's per-activity result played, just accumulated
//! across every step instead of discarded after one.

use std::collections::HashMap;

use minijinja::Environment;
use serde_json::Value;

use crate::error::TaskforgeError;

/// Live state threaded through one workflow run's step execution.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_run_id: String,
    pub inputs: Value,
    pub current_step: Option<String>,
    step_outputs: HashMap<String, Value>,
    variables: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new(workflow_run_id: impl Into<String>, inputs: Value) -> Self {
        Self { workflow_run_id: workflow_run_id.into(), inputs, current_step: None, step_outputs: HashMap::new(), variables: HashMap::new() }
    }

    /// `None` if `name` hasn't executed yet, distinct from a step whose
    /// recorded output is JSON `null` (spec.md §3 invariant: "reading a
    /// step not yet executed returns 'not present' (not null)").
    pub fn step_output(&self, name: &str) -> Option<&Value> {
        self.step_outputs.get(name)
    }

    /// Record `name`'s output. Per spec.md §8 "Workflow context
    /// monotonicity", a step output is assigned at most once; a second
    /// write for the same name is a bug the runner must not trigger.
    pub fn set_step_output(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        debug_assert!(!self.step_outputs.contains_key(&name), "step '{name}' output written twice");
        self.step_outputs.insert(name, value);
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Render every string leaf of `template` as a minijinja expression
    /// against `{inputs, step_outputs, variables}`, recursing into
    /// arrays and objects but leaving non-string leaves untouched
    /// (spec.md §4.8 step 2, "parameter template rendered from the
    /// context").
    pub fn render(&self, template: &Value) -> Result<Value, TaskforgeError> {
        let mut env = Environment::new();
        let context = minijinja::context! {
            inputs => self.inputs.clone(),
            step_outputs => serde_json::to_value(&self.step_outputs).unwrap_or(Value::Null),
            variables => serde_json::to_value(&self.variables).unwrap_or(Value::Null),
        };

        render_value(&mut env, template, &context)
    }
}

fn render_value(env: &mut Environment<'_>, value: &Value, context: &minijinja::Value) -> Result<Value, TaskforgeError> {
    match value {
        Value::String(s) if s.contains("{{") || s.contains("{%") => {
            let rendered = env
                .render_str(s, context)
                .map_err(|e| TaskforgeError::Validation(format!("template render failed: {e}")))?;
            Ok(Value::String(rendered))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(env, item, context)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(env, v, context)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_output_absent_vs_null() {
        let mut ctx = WorkflowContext::new("run-1", json!({}));
        assert_eq!(ctx.step_output("a"), None);
        ctx.set_step_output("a", Value::Null);
        assert_eq!(ctx.step_output("a"), Some(&Value::Null));
    }

    #[test]
    fn render_substitutes_step_outputs_and_inputs() {
        let mut ctx = WorkflowContext::new("run-1", json!({"name": "world"}));
        ctx.set_step_output("classify", json!("heavy"));

        let template = json!({"greeting": "hello {{ inputs.name }}", "tier": "{{ step_outputs.classify }}", "n": 3});
        let rendered = ctx.render(&template).unwrap();
        assert_eq!(rendered["greeting"], json!("hello world"));
        assert_eq!(rendered["tier"], json!("heavy"));
        assert_eq!(rendered["n"], json!(3));
    }

    #[test]
    fn render_passes_through_plain_strings_untouched() {
        let ctx = WorkflowContext::new("run-1", json!({}));
        let rendered = ctx.render(&json!({"literal": "no templating here"})).unwrap();
        assert_eq!(rendered["literal"], json!("no templating here"));
    }
}
