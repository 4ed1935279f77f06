//! [`HandlerRegistry`]: dual-namespace lookup from `(kind, name)` to a
//! registered [`Handler`] (spec.md §4.2).
//!
//! Grounded on the teacher's `WorkflowRegistry`, which maps a single
//! namespace of workflow-type names to factories. Here handlers are
//! already type-erased (see [`crate::handler::Handler`]), so the
//! registry stores the handler itself rather than a factory, and keeps
//! two independent maps — `task` and `pipeline` — since spec.md §4.2
//! requires a task and a pipeline to be allowed the same name without
//! colliding.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::TaskforgeError;
use crate::handler::Handler;
use crate::model::WorkKind;

/// Registers and resolves handlers for `task` and `pipeline` work. Each
/// namespace rejects a second registration under the same name
/// (`handler_conflict`, spec.md §4.2) rather than silently overwriting
/// it, unlike the teacher's `register::<W>()` which does overwrite on
/// re-registration.
#[derive(Default)]
pub struct HandlerRegistry {
    tasks: HashMap<String, Arc<dyn Handler>>,
    pipelines: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, kind: WorkKind) -> Option<&HashMap<String, Arc<dyn Handler>>> {
        match kind {
            WorkKind::Task => Some(&self.tasks),
            WorkKind::Pipeline => Some(&self.pipelines),
            WorkKind::Workflow | WorkKind::Step => None,
        }
    }

    fn namespace_mut(&mut self, kind: WorkKind) -> Option<&mut HashMap<String, Arc<dyn Handler>>> {
        match kind {
            WorkKind::Task => Some(&mut self.tasks),
            WorkKind::Pipeline => Some(&mut self.pipelines),
            WorkKind::Workflow | WorkKind::Step => None,
        }
    }

    /// Register `handler` under `name` in `kind`'s namespace.
    ///
    /// Re-registering the exact same callable (same `Arc` allocation)
    /// under a name it already owns is idempotent and returns `Ok(())`;
    /// only a *different* callable under an already-taken name
    /// conflicts.
    ///
    /// # Errors
    /// Returns `HandlerConflict` if `name` is already registered to a
    /// different handler in that namespace, and `Validation` if `kind`
    /// has no handler namespace (workflows are driven by definitions,
    /// not handlers).
    pub fn register(
        &mut self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), TaskforgeError> {
        let name = name.into();
        let map = self.namespace_mut(kind).ok_or_else(|| {
            TaskforgeError::Validation(format!("kind {kind} has no handler namespace"))
        })?;
        if let Some(existing) = map.get(&name) {
            if Arc::ptr_eq(existing, &handler) {
                return Ok(());
            }
            return Err(TaskforgeError::HandlerConflict {
                kind: kind.to_string(),
                name,
            });
        }
        map.insert(name, handler);
        Ok(())
    }

    /// Resolve a handler by `(kind, name)`.
    ///
    /// # Errors
    /// Returns `HandlerNotFound` if nothing is registered.
    pub fn resolve(&self, kind: WorkKind, name: &str) -> Result<Arc<dyn Handler>, TaskforgeError> {
        self.namespace(kind)
            .and_then(|map| map.get(name))
            .cloned()
            .ok_or_else(|| TaskforgeError::HandlerNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    pub fn contains(&self, kind: WorkKind, name: &str) -> bool {
        self.namespace(kind)
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }

    pub fn names(&self, kind: WorkKind) -> Vec<&str> {
        self.namespace(kind)
            .map(|map| map.keys().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, kind: WorkKind) -> usize {
        self.namespace(kind).map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.pipelines.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerContext;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, _ctx: &HandlerContext, params: Value) -> Result<Value, TaskforgeError> {
            Ok(params)
        }
    }

    #[test]
    fn register_and_resolve_task() {
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Task, "echo", Arc::new(Echo)).unwrap();
        assert!(registry.contains(WorkKind::Task, "echo"));
        assert!(registry.resolve(WorkKind::Task, "echo").is_ok());
    }

    #[test]
    fn task_and_pipeline_namespaces_are_independent() {
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Task, "build", Arc::new(Echo)).unwrap();
        registry.register(WorkKind::Pipeline, "build", Arc::new(Echo)).unwrap();
        assert!(registry.contains(WorkKind::Task, "build"));
        assert!(registry.contains(WorkKind::Pipeline, "build"));
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Task, "echo", Arc::new(Echo)).unwrap();
        let err = registry.register(WorkKind::Task, "echo", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, TaskforgeError::HandlerConflict { .. }));
    }

    #[test]
    fn reregistering_same_handler_is_idempotent() {
        let mut registry = HandlerRegistry::new();
        let handler: Arc<dyn Handler> = Arc::new(Echo);
        registry.register(WorkKind::Task, "echo", handler.clone()).unwrap();
        assert!(registry.register(WorkKind::Task, "echo", handler).is_ok());
    }

    #[test]
    fn unknown_handler_not_found() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve(WorkKind::Task, "missing").unwrap_err();
        assert!(matches!(err, TaskforgeError::HandlerNotFound { .. }));
    }

    #[test]
    fn workflow_kind_has_no_namespace() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register(WorkKind::Workflow, "anything", Arc::new(Echo))
            .unwrap_err();
        assert!(matches!(err, TaskforgeError::Validation(_)));
    }
}
