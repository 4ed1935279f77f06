//! The [`Handler`] trait and the context handed to running handlers
//! (spec.md §4.2, §9 "progress events").
//!
//! Generalizes the teacher's `Activity`/`ActivityContext` pair: instead
//! of a typed `Input`/`Output` associated-type interface backed by a
//! per-activity wrapper, handlers here are already type-erased —
//! `params`/result are `serde_json::Value`, matching the JSON-in/JSON-out
//! boundary `WorkSpec.params` and `RunRecord.result` use everywhere
//! else in this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TaskforgeError;

/// A progress update a running handler chose to report. Delivered to
/// whoever is watching the run (e.g. `Dispatcher::wait`'s caller, or a
/// `RunEvent::Progress` written to the ledger).
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub details: Value,
}

/// Handle used to request cancellation of a running handler invocation,
/// mirroring `CancellationHandle` in the teacher's activity context.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Wrap an externally-owned flag, so a caller holding the same
    /// `Arc` an executor passed into `HandlerContext::with_cancellation`
    /// can cancel it from outside.
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl From<Arc<AtomicBool>> for CancellationHandle {
    fn from(cancelled: Arc<AtomicBool>) -> Self {
        Self::new(cancelled)
    }
}

/// Context passed to every handler invocation. Carries attempt
/// bookkeeping, a progress-event channel, and a cooperative cancellation
/// flag — the same three concerns `ActivityContext` provides, widened
/// from workflow activities to any task/pipeline/step handler.
#[derive(Debug)]
pub struct HandlerContext {
    pub run_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    cancelled: Arc<AtomicBool>,
}

impl HandlerContext {
    pub fn new(run_id: impl Into<String>, attempt: u32, max_attempts: u32) -> Self {
        Self {
            run_id: run_id.into(),
            attempt,
            max_attempts,
            progress_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress_channel(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Share an externally-owned cancellation flag instead of the
    /// private one `new` allocates, so the executor that spawned this
    /// invocation can flip it from outside (e.g. `LocalExecutor::cancel`).
    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Emit a progress event. Silently drops the update if nothing is
    /// listening, mirroring how a heartbeat with no channel is a no-op
    /// in the teacher's `ActivityContext::heartbeat`.
    pub async fn progress(&self, details: Value) {
        if self.is_cancelled() {
            return;
        }
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(ProgressUpdate { details }).await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves once cancellation is requested. Intended for
    /// `tokio::select!` inside long-running handlers.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A unit of work the dispatcher can invoke by name. One `Handler`
/// instance is registered per `(namespace, name)` pair and reused
/// across invocations — unlike the teacher's per-execution
/// `WorkflowFactory`, handlers here hold no per-run state themselves;
/// all per-run state lives in the `HandlerContext` and the params/result
/// values passed through it.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &HandlerContext, params: Value) -> Result<Value, TaskforgeError>;
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Handler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, _ctx: &HandlerContext, params: Value) -> Result<Value, TaskforgeError> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn handler_roundtrips_params() {
        let ctx = HandlerContext::new("run-1", 1, 3);
        let handler = EchoHandler;
        let out = handler.handle(&ctx, serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out, serde_json::json!({"x": 1}));
    }

    #[test]
    fn is_last_attempt_matches_max() {
        let ctx = HandlerContext::new("run-1", 3, 3);
        assert!(ctx.is_last_attempt());
        let ctx = HandlerContext::new("run-1", 2, 3);
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn cancellation_handle_flips_flag() {
        let ctx = HandlerContext::new("run-1", 1, 1);
        let handle = ctx.cancellation_handle();
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn progress_delivers_on_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = HandlerContext::new("run-1", 1, 1).with_progress_channel(tx);
        ctx.progress(serde_json::json!({"pct": 50})).await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.details, serde_json::json!({"pct": 50}));
    }

    #[tokio::test]
    async fn progress_is_noop_when_cancelled() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = HandlerContext::new("run-1", 1, 1).with_progress_channel(tx);
        ctx.cancellation_handle().cancel();
        ctx.progress(serde_json::json!({"pct": 50})).await;
        assert!(rx.try_recv().is_err());
    }
}
