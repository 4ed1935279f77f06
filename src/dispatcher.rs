//! The [`Dispatcher`]: the single public submission entry point
//! (spec.md §4.5), tying the registry, ledger, resilience primitives,
//! and executors together.
//!
//! Grounded on `engine/executor.rs::WorkflowExecutor`'s
//! `start_workflow`/`process_workflow` orchestration sequence,
//! generalized from "persist a workflow, then drive it" to spec.md
//! §4.5's seven-step submit pipeline over any `WorkSpec`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{instrument, warn};

use crate::error::{ErrorCategory, TaskforgeError};
use crate::executor::{Executor, ExecutorHealth};
use crate::ledger::{DlqFilter, ExecutionLedger, Pagination, RunFilter};
use crate::model::{EventType, RunEvent, RunRecord, RunStatus, WorkSpec};
use crate::registry::HandlerRegistry;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStore, CircuitState, ConcurrencyGuard, KeyedRateLimiter, RateLimiterConfig,
};

/// Forwards [`CircuitBreakerStore`] calls through an `Arc<dyn
/// ExecutionLedger>` so [`CircuitBreaker`] can be constructed without
/// requiring trait-object upcasting from `dyn ExecutionLedger` to `dyn
/// CircuitBreakerStore`.
struct LedgerCircuitStore(Arc<dyn ExecutionLedger>);

#[async_trait]
impl CircuitBreakerStore for LedgerCircuitStore {
    async fn get_circuit_breaker(&self, key: &str) -> Result<Option<CircuitBreakerState>, TaskforgeError> {
        self.0.get_circuit_breaker(key).await
    }

    async fn create_circuit_breaker(&self, key: &str, config: &CircuitBreakerConfig) -> Result<(), TaskforgeError> {
        self.0.create_circuit_breaker(key, config).await
    }

    async fn update_circuit_breaker(
        &self,
        key: &str,
        state: CircuitState,
        failure_count: u32,
        success_count: u32,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskforgeError> {
        self.0.update_circuit_breaker(key, state, failure_count, success_count, opened_at).await
    }
}

/// Routing and resilience-admission settings that don't vary per
/// submission.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Executor used when a run's lane has no entry in `lane_executors`.
    pub default_executor: String,
    /// Lane name -> executor name, for adapter-routing policy (spec.md
    /// §4.5 step 6).
    pub lane_executors: HashMap<String, String>,
    pub circuit_breaker: CircuitBreakerConfig,
    /// `None` disables rate limiting entirely.
    pub rate_limiter: Option<RateLimiterConfig>,
    /// How long a watcher task will wait for a run to reach a terminal
    /// status before giving up on reporting its outcome to the circuit
    /// breaker.
    pub circuit_feedback_timeout: Duration,
}

impl DispatcherConfig {
    pub fn new(default_executor: impl Into<String>) -> Self {
        Self {
            default_executor: default_executor.into(),
            lane_executors: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: None,
            circuit_feedback_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_lane_executor(mut self, lane: impl Into<String>, executor: impl Into<String>) -> Self {
        self.lane_executors.insert(lane.into(), executor.into());
        self
    }

    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

/// Submission entry point (spec.md §4.5). Cheap to clone (everything
/// behind `Arc`) so callers can hand it to handlers that themselves
/// submit work, e.g. a workflow's pipeline step.
pub struct Dispatcher {
    ledger: Arc<dyn ExecutionLedger>,
    registry: Arc<HandlerRegistry>,
    executors: HashMap<String, Arc<dyn Executor>>,
    config: DispatcherConfig,
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    rate_limiters: Option<KeyedRateLimiter>,
}

impl Dispatcher {
    pub fn new(ledger: Arc<dyn ExecutionLedger>, registry: Arc<HandlerRegistry>, config: DispatcherConfig) -> Self {
        let rate_limiters = config.rate_limiter.clone().map(KeyedRateLimiter::new);
        Self {
            ledger,
            registry,
            executors: HashMap::new(),
            config,
            circuit_breakers: DashMap::new(),
            rate_limiters,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(executor.name().to_string(), executor);
        self
    }

    fn select_executor(&self, spec: &WorkSpec) -> Result<Arc<dyn Executor>, TaskforgeError> {
        let name = self
            .config
            .lane_executors
            .get(&spec.lane)
            .cloned()
            .unwrap_or_else(|| self.config.default_executor.clone());
        self.executors.get(&name).cloned().ok_or_else(|| TaskforgeError::ExecutorUnavailable {
            name: name.clone(),
            reason: "no executor registered under that name".to_string(),
        })
    }

    fn circuit_breaker_for(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuit_breakers.get(key) {
            return existing.clone();
        }
        let store: Arc<dyn CircuitBreakerStore> = Arc::new(LedgerCircuitStore(self.ledger.clone()));
        let breaker = Arc::new(CircuitBreaker::new(key.to_string(), self.config.circuit_breaker.clone(), store));
        self.circuit_breakers.insert(key.to_string(), breaker.clone());
        breaker
    }

    /// Watch `run_id` until it reaches a terminal status (or
    /// `circuit_feedback_timeout` elapses) and report the outcome to
    /// `breaker`. Runs detached from `submit` since the dispatcher must
    /// return as soon as the executor accepts the run.
    fn spawn_circuit_feedback(&self, run_id: String, breaker: Arc<CircuitBreaker>) {
        let ledger = self.ledger.clone();
        let timeout = self.config.circuit_feedback_timeout;
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                match ledger.get_run(&run_id).await {
                    Ok(run) if run.status.is_terminal() => {
                        let report = if run.status == RunStatus::Completed {
                            breaker.report_success().await
                        } else {
                            breaker.report_failure().await
                        };
                        if let Err(e) = report {
                            warn!(run_id = %run_id, "circuit breaker outcome report failed: {e}");
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
                if tokio::time::Instant::now() >= deadline {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });
    }

    async fn fail_run(&self, run: &mut RunRecord, message: String, error_type: &str, category: ErrorCategory) {
        let data = json!({"message": message, "error_type": error_type, "category": category.to_string()});
        let event = RunEvent::new(run.run_id.clone(), EventType::Failed, data, "dispatcher", Utc::now());
        match self.ledger.append_event(event, run.sequence).await {
            Ok(seq) => run.sequence = seq,
            Err(e) => warn!(run_id = %run.run_id, "failed to record acceptance failure: {e}"),
        }
    }

    /// Submit `spec`, running it through spec.md §4.5's validate →
    /// idempotency → resolve → create → guard → route → hand-off
    /// sequence. Returns immediately once the executor has accepted the
    /// run; call [`Dispatcher::wait`] for synchronous completion.
    #[instrument(skip(self, spec), fields(kind = %spec.kind, name = %spec.name))]
    pub async fn submit(&self, spec: WorkSpec) -> Result<String, TaskforgeError> {
        spec.validate()?;

        let mut retry_of_run_id = None;
        if let Some(key) = spec.idempotency_key.clone() {
            if let Some(existing) = self.ledger.find_by_idempotency_key(&key).await? {
                if !existing.status.is_terminal() || existing.status == RunStatus::Completed {
                    return Ok(existing.run_id);
                }
                retry_of_run_id = Some(existing.run_id);
            }
        }

        self.registry.resolve(spec.kind, &spec.name)?;

        let breaker_key = format!("{}:{}", spec.kind, spec.name);
        let breaker = self.circuit_breaker_for(&breaker_key);

        let executor = self.select_executor(&spec)?;
        let now = Utc::now();
        let mut run = RunRecord::new_pending(spec, executor.name().to_string(), now);
        run.retry_of_run_id = retry_of_run_id;

        self.ledger.create_run(run.clone()).await?;
        let submitted = RunEvent::new(run.run_id.clone(), EventType::Submitted, json!({}), "dispatcher", now);
        run.sequence = self.ledger.append_event(submitted, run.sequence).await?;

        if let Some((entity_type, entity_id)) = run.spec.entity_key() {
            let acquired = self.ledger.try_acquire(&entity_type, &entity_id, &run.run_id).await?;
            if !acquired {
                self.fail_run(&mut run, "concurrency guard already held".to_string(), "concurrency_conflict", ErrorCategory::ConcurrencyConflict)
                    .await;
                return Err(TaskforgeError::ConcurrencyGuardHeld { entity_type, entity_id });
            }
        }

        // Concurrency admission happens before these two since S5
        // (concurrency_conflict) is the one rejection spec.md documents
        // as "no run created" — circuit_open/rate_limited must still
        // persist the run they reject (spec.md §4.1 wrapping order is
        // ConcurrencyGuard -> CircuitBreaker -> RateLimiter -> Retry).
        if let Err(err) = breaker.allow().await {
            self.fail_run(&mut run, err.to_string(), "circuit_open", ErrorCategory::CircuitOpen).await;
            return Err(err);
        }

        if let Some(limiter) = &self.rate_limiters {
            if !limiter.try_acquire(&breaker_key) {
                self.fail_run(&mut run, "rate limit exceeded".to_string(), "rate_limited", ErrorCategory::RateLimited).await;
                return Err(TaskforgeError::RateLimited { key: breaker_key });
            }
        }

        if let Err(err) = executor.submit(run.clone()).await {
            self.fail_run(&mut run, err.to_string(), "executor_unavailable", ErrorCategory::ExecutorUnavailable).await;
            return Err(err);
        }

        self.spawn_circuit_feedback(run.run_id.clone(), breaker);
        Ok(run.run_id)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, TaskforgeError> {
        self.ledger.get_run(run_id).await
    }

    pub async fn list_runs(&self, filter: RunFilter, pagination: Pagination) -> Result<Vec<RunRecord>, TaskforgeError> {
        self.ledger.list_runs(filter, pagination).await
    }

    pub async fn list_dlq(&self, filter: DlqFilter, pagination: Pagination) -> Result<Vec<crate::ledger::DlqEntry>, TaskforgeError> {
        self.ledger.list_dlq(filter, pagination).await
    }

    /// Re-submit a DLQ entry as a fresh run via the normal submit
    /// pipeline, linked via `retry_of_run_id`, and tag the original run
    /// with a `dlq_reprocessed` event (spec.md §4.7).
    pub async fn reprocess_dlq_entry(&self, dlq_id: &str) -> Result<String, TaskforgeError> {
        let entry = self.ledger.get_dlq_entry(dlq_id).await?;
        let requeued = self.ledger.requeue_from_dlq(dlq_id).await?;

        let event = RunEvent::new(entry.original_run_id.clone(), EventType::DlqReprocessed, json!({"new_run_id": requeued.run_id}), "dispatcher", Utc::now());
        if let Ok(original) = self.ledger.get_run(&entry.original_run_id).await {
            let _ = self.ledger.append_event(event, original.sequence).await;
        }

        let executor = self.select_executor(&requeued.spec)?;
        executor.submit(requeued.clone()).await?;
        Ok(requeued.run_id)
    }

    pub async fn cancel(&self, run_id: &str) -> Result<(), TaskforgeError> {
        let run = self.ledger.get_run(run_id).await?;
        let executor = self.executors.get(&run.executor_name).ok_or_else(|| TaskforgeError::ExecutorUnavailable {
            name: run.executor_name.clone(),
            reason: "executor no longer registered".to_string(),
        })?;
        executor.cancel(run_id).await
    }

    /// Block until `run_id` reaches a terminal status or `timeout`
    /// elapses.
    pub async fn wait(&self, run_id: &str, timeout: Duration) -> Result<RunRecord, TaskforgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.ledger.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TaskforgeError::Timeout { run_id: run_id.to_string(), timeout_seconds: timeout.as_secs() });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn health(&self) -> HashMap<String, ExecutorHealth> {
        let mut out = HashMap::new();
        for (name, executor) in &self.executors {
            out.insert(name.clone(), executor.health().await);
        }
        out
    }
}
