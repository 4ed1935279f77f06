//! The execution ledger: single writer of truth for run status
//! transitions, the append-only run event log, and the dead-letter
//! queue (spec.md §4.6, §4.7).
//!
//! Grounded on `persistence/store.rs::WorkflowEventStore`, generalized
//! from a workflow-event-sourcing model to the direct `RunRecord`
//! model: a ledger still appends events for the history (`load_events`)
//! and still uses optimistic concurrency (`RunRecord.sequence`), but
//! `RunRecord` itself is the live, queryable state rather than
//! something rebuilt by replaying events on every read.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TaskforgeError;
use crate::model::{RunEvent, RunRecord, RunStatus, WorkKind};
use crate::resilience::{CircuitBreakerStore, ConcurrencyGuard};

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;

/// Filter for [`ExecutionLedger::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub kind: Option<WorkKind>,
    pub lane: Option<String>,
    pub parent_run_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { offset: 0, limit: 100 }
    }
}

/// A run that exhausted its retries (or hit a non-retryable error) and
/// was moved out of the normal run lifecycle for manual/automated
/// reprocessing (spec.md §4.7).
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub id: String,
    pub original_run_id: String,
    pub spec_kind: WorkKind,
    pub spec_name: String,
    pub attempts: u32,
    pub last_error: String,
    /// Every attempt's failure message, oldest first, not just the
    /// last one — carried over from the teacher's `DlqEntry.error_history`.
    pub error_history: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub spec_name: Option<String>,
}

/// The ledger trait every executor and resilience primitive shares.
/// Implementors also provide circuit-breaker state storage and the
/// entity concurrency guard, since both need the same durability
/// guarantees as run state.
#[async_trait]
pub trait ExecutionLedger: CircuitBreakerStore + ConcurrencyGuard + Send + Sync + 'static {
    /// Persist a brand-new run. Fails if `run_id` already exists.
    async fn create_run(&self, run: RunRecord) -> Result<(), TaskforgeError>;

    async fn get_run(&self, run_id: &str) -> Result<RunRecord, TaskforgeError>;

    async fn list_runs(&self, filter: RunFilter, pagination: Pagination) -> Result<Vec<RunRecord>, TaskforgeError>;

    /// Look up an existing run by its submission-time idempotency key,
    /// for the dispatcher's dedup check (spec.md §4.5 step 2).
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>, TaskforgeError>;

    /// Append `event` to `run_id`'s history and apply its effect to the
    /// run record, failing with `ConcurrencyConflict` if
    /// `expected_sequence` doesn't match the run's current sequence.
    /// Returns the run's new sequence number.
    async fn append_event(&self, event: RunEvent, expected_sequence: i64) -> Result<i64, TaskforgeError>;

    async fn load_events(&self, run_id: &str) -> Result<Vec<RunEvent>, TaskforgeError>;

    /// Record a liveness heartbeat for a running run, resetting its
    /// heartbeat-timeout clock (spec.md §9 / SPEC_FULL §B.1).
    async fn record_heartbeat(&self, run_id: &str) -> Result<(), TaskforgeError>;

    /// Runs that are `running` but haven't heartbeated within
    /// `threshold`, i.e. candidates for forced `timeout` failure.
    async fn find_stale_running(&self, threshold: std::time::Duration) -> Result<Vec<RunRecord>, TaskforgeError>;

    /// Move a run to the dead-letter queue after it exhausts retries.
    async fn move_to_dlq(&self, run_id: &str, error_history: Vec<String>) -> Result<DlqEntry, TaskforgeError>;

    /// Re-submit a DLQ entry as a fresh pending run and remove it from
    /// the queue.
    async fn requeue_from_dlq(&self, dlq_id: &str) -> Result<RunRecord, TaskforgeError>;

    async fn get_dlq_entry(&self, dlq_id: &str) -> Result<DlqEntry, TaskforgeError>;

    /// FIFO by `enqueued_at` unless `filter` narrows the set (spec.md
    /// §C "DLQ ordering").
    async fn list_dlq(&self, filter: DlqFilter, pagination: Pagination) -> Result<Vec<DlqEntry>, TaskforgeError>;

    /// Permanently discard a DLQ entry without reprocessing.
    async fn purge_dlq_entry(&self, dlq_id: &str) -> Result<(), TaskforgeError>;
}
