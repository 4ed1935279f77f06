//! Bounded worker-pool executor: runs submitted work on a fixed-size
//! pool of background tasks, dequeuing by priority within a lane and
//! round-robin across lanes (spec.md §C "priority ordering"), with
//! backpressure, heartbeat-driven liveness, stale-run reclamation, and
//! graceful shutdown (SPEC_FULL.md §B.1-B.3).
//!
//! Grounded on `worker/pool.rs::WorkerPool`: the shutdown-via-`watch`,
//! `Semaphore`-gated concurrency, and background-loop structure carry
//! over directly. Unlike the teacher, this executor isn't backed by a
//! shared poller claiming rows out of a database — submissions arrive
//! in-process through [`LocalExecutor::submit`] and are queued in
//! memory, so there is no `TaskPoller` equivalent.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{handle_failed_run, run_to_outcome, Executor, ExecutorHealth};
use crate::error::{ErrorCategory, TaskforgeError};
use crate::handler::CancellationHandle;
use crate::ledger::ExecutionLedger;
use crate::model::{EventType, Priority, RunEvent, RunRecord, RunStatus};
use crate::registry::HandlerRegistry;
use crate::resilience::{BackpressureConfig, BackpressureGate};

#[derive(Debug, Clone)]
pub struct LocalExecutorConfig {
    pub max_concurrent: usize,
    pub backpressure: BackpressureConfig,
    pub heartbeat_interval: Duration,
    pub stale_reclaim_interval: Duration,
    pub stale_threshold: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            backpressure: BackpressureConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl LocalExecutorConfig {
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

struct QueuedRun {
    run: RunRecord,
    priority: Priority,
    enqueued_at: std::time::Instant,
}

impl PartialEq for QueuedRun {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.enqueued_at == other.enqueued_at
    }
}
impl Eq for QueuedRun {}

impl PartialOrd for QueuedRun {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Strict priority within a lane: higher [`Priority`] first, earlier
/// `enqueued_at` first within the same priority (FIFO tie-break).
impl Ord for QueuedRun {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

#[derive(Default)]
struct LaneQueue {
    heap: Mutex<BinaryHeap<QueuedRun>>,
}

impl LaneQueue {
    fn push(&self, run: QueuedRun) {
        self.heap.lock().push(run);
    }

    fn pop(&self) -> Option<QueuedRun> {
        self.heap.lock().pop()
    }

    fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

/// Worker-pool executor with per-lane priority queues. `start` must be
/// called once before `submit`; `shutdown` drains in-flight runs before
/// returning (spec.md §B.2 "graceful shutdown").
pub struct LocalExecutor {
    name: String,
    registry: Arc<HandlerRegistry>,
    ledger: Arc<dyn ExecutionLedger>,
    config: LocalExecutorConfig,
    lanes: DashMap<String, Arc<LaneQueue>>,
    lane_order: Mutex<Vec<String>>,
    lane_cursor: AtomicUsize,
    notify: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    backpressure: Arc<BackpressureGate>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: Arc<DashMap<String, CancellationHandle>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalExecutor {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        ledger: Arc<dyn ExecutionLedger>,
        config: LocalExecutorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureGate::new(config.backpressure.clone(), config.max_concurrent));

        Arc::new(Self {
            name: name.into(),
            registry,
            ledger,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            lanes: DashMap::new(),
            lane_order: Mutex::new(Vec::new()),
            lane_cursor: AtomicUsize::new(0),
            notify: Arc::new(Notify::new()),
            backpressure,
            shutdown_tx,
            shutdown_rx,
            running: Arc::new(DashMap::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the dispatch, heartbeat-stale-reclaim background loops.
    /// Idempotent past the first call.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.background.lock();
        if !handles.is_empty() {
            return;
        }
        handles.push(self.spawn_dispatch_loop());
        handles.push(self.spawn_reclaim_loop());
    }

    pub async fn shutdown(&self) -> Result<(), TaskforgeError> {
        let _ = self.shutdown_tx.send(true);
        self.notify.notify_waiters();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.semaphore.available_permits() == self.config.max_concurrent {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(executor = %self.name, "graceful shutdown timed out with runs still in flight");
                return Err(TaskforgeError::ExecutorUnavailable {
                    name: self.name.clone(),
                    reason: "shutdown timeout".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!(executor = %self.name, "local executor stopped");
        Ok(())
    }

    fn enqueue(&self, run: RunRecord) {
        let lane = run.spec.lane.clone();
        let queue = self
            .lanes
            .entry(lane.clone())
            .or_insert_with(|| Arc::new(LaneQueue::default()))
            .clone();
        if self.lane_order.lock().iter().all(|l| l != &lane) {
            self.lane_order.lock().push(lane);
        }
        queue.push(QueuedRun { priority: run.spec.priority, enqueued_at: std::time::Instant::now(), run });
        self.notify.notify_one();
    }

    /// Round-robin across lanes starting just past the last lane served,
    /// returning the first run found.
    fn next_run(&self) -> Option<RunRecord> {
        let order = self.lane_order.lock().clone();
        if order.is_empty() {
            return None;
        }
        let start = self.lane_cursor.load(Ordering::Relaxed) % order.len();
        for offset in 0..order.len() {
            let idx = (start + offset) % order.len();
            if let Some(queue) = self.lanes.get(&order[idx]) {
                if let Some(queued) = queue.pop() {
                    self.lane_cursor.store((idx + 1) % order.len(), Ordering::Relaxed);
                    return Some(queued.run);
                }
            }
        }
        None
    }

    fn spawn_dispatch_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if *this.shutdown_rx.borrow() {
                    debug!(executor = %this.name, "dispatch loop: shutdown requested");
                    break;
                }

                if !this.backpressure.should_accept() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }

                let Some(run) = this.next_run() else {
                    tokio::select! {
                        _ = this.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                    continue;
                };

                let permit = match Arc::clone(&this.semaphore).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        this.enqueue(run);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        continue;
                    }
                };

                this.backpressure.run_started();
                let executor = Arc::clone(&this);
                tokio::spawn(async move {
                    executor.run_to_completion(run).await;
                    executor.backpressure.run_completed();
                    drop(permit);
                });
            }
            debug!("dispatch loop exited");
        })
    }

    /// Mark a heartbeat-stale run `Failed` and route it through the same
    /// retry/DLQ decision a handler-thrown failure gets, re-enqueuing a
    /// retry's `RunRecord` onto this executor's own lane queues since
    /// nothing is currently driving it. Runs on its own task per stale
    /// run so one slow retry delay doesn't stall the rest of the batch.
    fn reclaim_stale_run(self: &Arc<Self>, run: RunRecord) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let event = RunEvent::new(
                run.run_id.clone(),
                EventType::Failed,
                json!({"message": "heartbeat timeout", "error_type": "timeout", "category": "timeout"}),
                this.name.clone(),
                Utc::now(),
            );
            let sequence = match this.ledger.append_event(event, run.sequence).await {
                Ok(sequence) => sequence,
                Err(e) => {
                    error!(run_id = %run.run_id, "failed to mark stale run as timed out: {e}");
                    return;
                }
            };

            let mut failed_run = run;
            failed_run.sequence = sequence;
            failed_run.status = RunStatus::Failed;
            failed_run.error = Some("heartbeat timeout".to_string());
            failed_run.error_type = Some("timeout".to_string());
            failed_run.error_category = Some(ErrorCategory::Timeout);

            let mut error_history = Vec::new();
            match handle_failed_run(&this.ledger, &failed_run, &mut error_history).await {
                Ok(Some(next)) => this.enqueue(next),
                Ok(None) => {}
                Err(e) => error!(run_id = %failed_run.run_id, "failed to route reclaimed run through retry/dlq decision: {e}"),
            }
        });
    }

    fn spawn_reclaim_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.stale_reclaim_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match this.ledger.find_stale_running(this.config.stale_threshold).await {
                            Ok(stale) => {
                                for run in stale {
                                    this.reclaim_stale_run(run);
                                }
                            }
                            Err(e) => error!("stale run scan failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    async fn run_to_completion(&self, mut run: RunRecord) {
        let run_id = run.run_id.clone();
        let handler = match self.registry.resolve(run.spec.kind, &run.spec.name) {
            Ok(h) => h,
            Err(e) => {
                error!(run_id = %run_id, "no handler for run: {e}");
                return;
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        self.running.insert(run_id.clone(), CancellationHandle::from(cancelled.clone()));

        // Tracks which attempt is currently live across automatic
        // retries, so the heartbeat loop (started once per dispatch)
        // keeps heartbeating the run `run_to_outcome` is actually
        // driving rather than the first attempt's now-terminal id.
        let (run_id_tx, mut run_id_rx) = watch::channel(run_id.clone());
        let heartbeat_ledger = Arc::clone(&self.ledger);
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                let live_run_id = run_id_rx.borrow_and_update().clone();
                if heartbeat_ledger.record_heartbeat(&live_run_id).await.is_err() {
                    break;
                }
            }
        });

        if let Err(e) = run_to_outcome(&self.ledger, handler, &mut run, None, cancelled, Some(&run_id_tx)).await {
            error!(run_id = %run_id, "run failed to record outcome: {e}");
        }

        heartbeat_handle.abort();
        self.running.remove(&run_id);
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, run: RunRecord) -> Result<(), TaskforgeError> {
        self.enqueue(run);
        Ok(())
    }

    async fn cancel(&self, run_id: &str) -> Result<(), TaskforgeError> {
        match self.running.get(run_id) {
            Some(handle) => {
                handle.cancel();
                Ok(())
            }
            None => Err(TaskforgeError::RunNotFound { run_id: run_id.to_string() }),
        }
    }

    async fn health(&self) -> ExecutorHealth {
        ExecutorHealth {
            accepting: self.backpressure.is_accepting(),
            current_load: self.backpressure.current_load(),
            max_concurrent: self.config.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerContext};
    use crate::ledger::memory::InMemoryLedger;
    use crate::model::{TriggerSource, WorkKind, WorkSpec};
    use async_trait::async_trait as at;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct EchoHandler;

    #[at]
    impl Handler for EchoHandler {
        async fn handle(&self, _ctx: &HandlerContext, params: Value) -> Result<Value, TaskforgeError> {
            Ok(params)
        }
    }

    struct SlowHandler {
        started: Arc<StdAtomicUsize>,
    }

    #[at]
    impl Handler for SlowHandler {
        async fn handle(&self, _ctx: &HandlerContext, params: Value) -> Result<Value, TaskforgeError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(params)
        }
    }

    fn make(handler: Arc<dyn Handler>, max_concurrent: usize) -> (Arc<LocalExecutor>, Arc<InMemoryLedger>) {
        let mut registry = HandlerRegistry::new();
        registry.register(WorkKind::Task, "echo", handler).unwrap();
        let ledger = Arc::new(InMemoryLedger::new());
        let config = LocalExecutorConfig::default().with_max_concurrent(max_concurrent);
        let executor = LocalExecutor::new("local", Arc::new(registry), ledger.clone(), config);
        executor.start();
        (executor, ledger)
    }

    #[tokio::test]
    async fn submitted_run_completes() {
        let (executor, ledger) = make(Arc::new(EchoHandler), 4);
        let spec = WorkSpec::new(WorkKind::Task, "echo", TriggerSource::Api).with_params(serde_json::json!({"n": 1}));
        let run = RunRecord::new_pending(spec, "local", Utc::now());
        let run_id = run.run_id.clone();
        ledger.create_run(run.clone()).await.unwrap();
        executor.submit(run).await.unwrap();

        for _ in 0..50 {
            let stored = ledger.get_run(&run_id).await.unwrap();
            if stored.status.is_terminal() {
                assert_eq!(stored.status, RunStatus::Completed);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never completed");
    }

    #[tokio::test]
    async fn respects_max_concurrency() {
        let started = Arc::new(StdAtomicUsize::new(0));
        let handler = Arc::new(SlowHandler { started: started.clone() });
        let (executor, ledger) = make(handler, 2);

        for _ in 0..4 {
            let spec = WorkSpec::new(WorkKind::Task, "echo", TriggerSource::Api);
            let run = RunRecord::new_pending(spec, "local", Utc::now());
            ledger.create_run(run.clone()).await.unwrap();
            executor.submit(run).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(started.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn health_reports_load() {
        let (executor, _ledger) = make(Arc::new(EchoHandler), 4);
        let health = executor.health().await;
        assert_eq!(health.max_concurrent, 4);
        assert!(health.accepting);
    }

    #[tokio::test]
    async fn reclaimed_stale_run_retries_through_the_same_dlq_decision() {
        let (executor, ledger) = make(Arc::new(EchoHandler), 4);
        let spec = WorkSpec::new(WorkKind::Task, "echo", TriggerSource::Api).with_max_retries(1);
        let mut run = RunRecord::new_pending(spec, "local", Utc::now());
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        let stale_id = run.run_id.clone();
        ledger.create_run(run.clone()).await.unwrap();

        executor.reclaim_stale_run(run);

        let mut original = ledger.get_run(&stale_id).await.unwrap();
        for _ in 0..50 {
            if original.status == RunStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            original = ledger.get_run(&stale_id).await.unwrap();
        }
        assert_eq!(original.status, RunStatus::Failed);
        assert_eq!(original.error_category, Some(ErrorCategory::Timeout));

        for _ in 0..100 {
            let runs = ledger.list_runs(Default::default(), Default::default()).await.unwrap();
            if let Some(retried) = runs.iter().find(|r| r.retry_of_run_id.as_deref() == Some(stale_id.as_str())) {
                if retried.status.is_terminal() {
                    assert_eq!(retried.status, RunStatus::Completed);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("reclaimed run never retried to completion");
    }

    #[tokio::test]
    async fn cancel_unknown_run_errors() {
        let (executor, _ledger) = make(Arc::new(EchoHandler), 4);
        let err = executor.cancel("missing").await.unwrap_err();
        assert!(matches!(err, TaskforgeError::RunNotFound { .. }));
    }
}
