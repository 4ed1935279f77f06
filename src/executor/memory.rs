//! Synchronous in-process executor: runs a handler on the caller's own
//! task before `submit` returns, the same way
//! `WorkflowExecutor::start_workflow` drives a workflow inline rather
//! than handing it to a background pool. Useful for tests, embedded
//! use, and pipeline steps that are cheap enough not to need a worker
//! pool.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;

use super::{run_to_outcome, Executor, ExecutorHealth};
use crate::error::TaskforgeError;
use crate::ledger::ExecutionLedger;
use crate::model::RunRecord;
use crate::registry::HandlerRegistry;

pub struct MemoryExecutor {
    name: String,
    registry: Arc<HandlerRegistry>,
    ledger: Arc<dyn ExecutionLedger>,
}

impl MemoryExecutor {
    pub fn new(name: impl Into<String>, registry: Arc<HandlerRegistry>, ledger: Arc<dyn ExecutionLedger>) -> Self {
        Self { name: name.into(), registry, ledger }
    }
}

#[async_trait]
impl Executor for MemoryExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, mut run: RunRecord) -> Result<(), TaskforgeError> {
        let handler = self.registry.resolve(run.spec.kind, &run.spec.name)?;
        run_to_outcome(&self.ledger, handler, &mut run, None, Arc::new(AtomicBool::new(false)), None).await
    }

    /// Cancellation can't interrupt a call already in progress on the
    /// caller's own task; by the time this would run, `submit` has
    /// already returned.
    async fn cancel(&self, run_id: &str) -> Result<(), TaskforgeError> {
        Err(TaskforgeError::ExecutorUnavailable {
            name: self.name.clone(),
            reason: format!("run {run_id} cannot be cancelled on a synchronous executor"),
        })
    }

    async fn health(&self) -> ExecutorHealth {
        ExecutorHealth { accepting: true, current_load: 0, max_concurrent: usize::MAX }
    }
}
