//! The `Executor` trait: where a dispatched run actually runs
//! (spec.md §4.2, §4.3).
//!
//! Grounded on `engine/executor.rs::WorkflowExecutor`'s
//! submit/process/cancel shape, generalized from "one executor runs
//! workflows" to "pluggable executors run any `RunRecord`" — the
//! dispatcher picks an executor by name per spec.md §4.3 and hands it
//! off; the executor owns everything from there (claiming the handler,
//! running it, reporting the outcome back to the ledger).

pub mod local;
pub mod memory;

pub use local::LocalExecutor;
pub use memory::MemoryExecutor;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::error;

use crate::error::TaskforgeError;
use crate::handler::{Handler, HandlerContext, ProgressUpdate};
use crate::ledger::ExecutionLedger;
use crate::model::{EventType, RunEvent, RunRecord, RunStatus};
use crate::resilience::{ConcurrencyGuard, RetryPolicy};

/// Point-in-time load snapshot an executor reports to the dispatcher's
/// health check (spec.md §4.3).
#[derive(Debug, Clone, Copy)]
pub struct ExecutorHealth {
    pub accepting: bool,
    pub current_load: usize,
    pub max_concurrent: usize,
}

#[async_trait]
pub trait Executor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Take ownership of `run` and drive it to completion, appending
    /// lifecycle events to the ledger as it progresses. Must not block
    /// the caller past the initial hand-off.
    async fn submit(&self, run: RunRecord) -> Result<(), TaskforgeError>;

    /// Best-effort cooperative cancellation; the run may still complete
    /// if it's already past its last cancellation check (spec.md §4.1
    /// "Cancelled").
    async fn cancel(&self, run_id: &str) -> Result<(), TaskforgeError>;

    async fn health(&self) -> ExecutorHealth;
}

/// Run one attempt of `run` to completion and append its `started` /
/// `completed` / `failed` events to `ledger`, mirroring
/// `WorkflowExecutor::process_workflow`'s append-then-apply loop but for
/// a single non-replayed attempt. Shared by [`memory::MemoryExecutor`]
/// and [`local::LocalExecutor`] so both executors report outcomes the
/// same way.
pub(crate) async fn run_once(
    ledger: &Arc<dyn ExecutionLedger>,
    handler: Arc<dyn Handler>,
    run: &mut RunRecord,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    cancelled: Arc<AtomicBool>,
) -> Result<(), TaskforgeError> {
    let started = RunEvent::new(run.run_id.clone(), EventType::Started, json!({}), run.executor_name.clone(), Utc::now());
    run.sequence = ledger.append_event(started, run.sequence).await?;
    run.status = crate::model::RunStatus::Running;
    run.started_at = Some(Utc::now());

    let max_attempts = run.spec.max_retries.map(|n| n + 1).unwrap_or(1);
    let mut ctx = HandlerContext::new(run.run_id.clone(), run.attempt, max_attempts).with_cancellation(cancelled);
    if let Some(tx) = progress_tx {
        ctx = ctx.with_progress_channel(tx);
    }

    let outcome = handler.handle(&ctx, run.spec.params.clone()).await;
    let now = Utc::now();

    let event = match &outcome {
        Ok(result) => RunEvent::new(run.run_id.clone(), EventType::Completed, result.clone(), run.executor_name.clone(), now),
        Err(err) => {
            let data = json!({
                "message": err.to_string(),
                "error_type": "handler_error",
                "category": err.category().to_string(),
            });
            RunEvent::new(run.run_id.clone(), EventType::Failed, data, run.executor_name.clone(), now)
        }
    };

    run.sequence = ledger.append_event(event, run.sequence).await?;
    run.completed_at = Some(now);

    // The ledger applies this same transition to its own stored copy
    // (see `ledger::memory::apply_event`); mirrored here so
    // `run_to_outcome`'s retry/DLQ decision below can read it off the
    // caller's `run` without a round trip back to the ledger.
    match outcome {
        Ok(result) => {
            run.status = RunStatus::Completed;
            run.result = Some(result);
        }
        Err(err) => {
            run.status = RunStatus::Failed;
            run.error = Some(err.to_string());
            run.error_type = Some("handler_error".to_string());
            run.error_category = Some(err.category());
        }
    }

    Ok(())
}

fn retry_policy_for(run: &RunRecord) -> RetryPolicy {
    run.spec
        .max_retries
        .map(|n| RetryPolicy::exponential().with_max_attempts(n + 1))
        .unwrap_or_else(RetryPolicy::no_retry)
}

/// Decide what happens to a `run` that just reached `Failed`: either a
/// fresh `Pending` [`RunRecord`] for the next attempt, or `None` once
/// it's been moved to the dead-letter queue. A terminal `RunRecord`
/// never transitions back to `Pending` in place (spec.md §8 terminal
/// stability) — retrying means creating and persisting a new run,
/// linked back to `run` via `retry_of_run_id`, and letting that new run
/// carry the attempt count forward.
///
/// Shared by [`run_to_outcome`]'s in-process retry loop and
/// [`local::LocalExecutor`]'s heartbeat-timeout reclaim path, so a
/// handler failure and a reclaimed stale run are judged by the same
/// policy.
pub(crate) async fn handle_failed_run(
    ledger: &Arc<dyn ExecutionLedger>,
    run: &RunRecord,
    error_history: &mut Vec<String>,
) -> Result<Option<RunRecord>, TaskforgeError> {
    let retry_policy = retry_policy_for(run);

    if let Some(message) = &run.error {
        error_history.push(message.clone());
    }

    let retryable = run.error_category.map(|c| c.is_retryable_by_default()).unwrap_or(false)
        && retry_policy.should_retry(run.error_type.as_deref());

    if !retryable || !retry_policy.has_attempts_remaining(run.attempt) {
        if let Err(e) = ledger.move_to_dlq(&run.run_id, error_history.clone()).await {
            error!(run_id = %run.run_id, "failed to move exhausted run to dlq: {e}");
        }
        return Ok(None);
    }

    let next_attempt = run.attempt + 1;
    let delay = retry_policy.delay_for_attempt(next_attempt);

    let mut next = RunRecord::new_pending(run.spec.clone(), run.executor_name.clone(), Utc::now());
    next.attempt = next_attempt;
    next.retry_of_run_id = Some(run.run_id.clone());
    ledger.create_run(next.clone()).await?;

    let event = RunEvent::new(
        next.run_id.clone(),
        EventType::Retrying,
        json!({"delay_ms": delay.as_millis(), "previous_error": run.error, "retry_of_run_id": run.run_id}),
        run.executor_name.clone(),
        Utc::now(),
    );
    next.sequence = ledger.append_event(event, next.sequence).await?;

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    Ok(Some(next))
}

/// Drive a run through [`run_once`] attempts until it reaches a
/// terminal, non-retryable outcome. A `failed` attempt never mutates
/// back to `pending` in place — [`handle_failed_run`] hands back a new
/// `RunRecord` for the next attempt, which `run` is swapped to before
/// looping, or moves the chain to the dead-letter queue. `run` ends the
/// call pointing at whichever attempt actually reached a terminal
/// state; the concurrency-guard slot, if any, is released against the
/// run_id that originally acquired it, not the last attempt's.
pub(crate) async fn run_to_outcome(
    ledger: &Arc<dyn ExecutionLedger>,
    handler: Arc<dyn Handler>,
    run: &mut RunRecord,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    cancelled: Arc<AtomicBool>,
    run_id_tx: Option<&watch::Sender<String>>,
) -> Result<(), TaskforgeError> {
    let guard_entity = run.spec.entity_key();
    let guard_run_id = run.run_id.clone();
    let mut error_history = Vec::new();

    loop {
        run_once(ledger, handler.clone(), run, progress_tx.clone(), cancelled.clone()).await?;

        if run.status != RunStatus::Failed {
            break;
        }

        match handle_failed_run(ledger, run, &mut error_history).await? {
            Some(next) => {
                *run = next;
                if let Some(tx) = run_id_tx {
                    let _ = tx.send(run.run_id.clone());
                }
            }
            None => break,
        }
    }

    if let Some((entity_type, entity_id)) = guard_entity {
        if let Err(e) = ledger.release(&entity_type, &entity_id, &guard_run_id).await {
            error!(run_id = %guard_run_id, "failed to release concurrency guard: {e}");
        }
    }

    Ok(())
}
