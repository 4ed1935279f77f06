//! In-memory [`ExecutionLedger`], grounded on
//! `persistence/memory.rs::InMemoryWorkflowEventStore`. Used by
//! `MemoryExecutor`/`LocalExecutor` tests and anywhere a process-local
//! ledger is sufficient.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{DlqEntry, DlqFilter, ExecutionLedger, Pagination, RunFilter};
use crate::error::{ErrorCategory, TaskforgeError};
use crate::model::{EventType, RunEvent, RunRecord, RunStatus};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStore, CircuitState, ConcurrencyGuard, InMemoryConcurrencyGuard};

struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

struct CircuitRow {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<chrono::DateTime<Utc>>,
    updated_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    runs: RwLock<HashMap<String, RunState>>,
    idempotency: RwLock<HashMap<String, String>>,
    dlq: RwLock<HashMap<String, DlqEntry>>,
    circuit_breakers: RwLock<HashMap<String, CircuitRow>>,
    guard: InMemoryConcurrencyGuard,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    pub fn dlq_count(&self) -> usize {
        self.dlq.read().len()
    }
}

pub(crate) fn apply_event(record: &mut RunRecord, event: &RunEvent) -> Result<(), TaskforgeError> {
    match event.event_type {
        EventType::Submitted => {}
        EventType::Queued => record.status = RunStatus::Queued,
        EventType::Started => {
            record.status = RunStatus::Running;
            record.started_at = Some(event.timestamp);
            record.last_heartbeat_at = Some(event.timestamp);
        }
        EventType::Progress => {
            record.last_heartbeat_at = Some(event.timestamp);
        }
        EventType::Heartbeat => {
            record.last_heartbeat_at = Some(event.timestamp);
        }
        EventType::Completed => {
            record.status = RunStatus::Completed;
            record.result = Some(event.data.clone());
            record.completed_at = Some(event.timestamp);
        }
        EventType::Failed => {
            record.status = RunStatus::Failed;
            record.error = event.data.get("message").and_then(|v| v.as_str()).map(String::from);
            record.error_type = event.data.get("error_type").and_then(|v| v.as_str()).map(String::from);
            record.error_category = event
                .data
                .get("category")
                .and_then(|v| v.as_str())
                .and_then(|s| serde_json::from_value(serde_json::Value::String(s.to_string())).ok());
            record.completed_at = Some(event.timestamp);
        }
        // Appended to the new `RunRecord` a retry creates (see
        // `executor::handle_failed_run`), not to the terminal run it
        // retries from — that run's own status never changes. Purely an
        // annotation event; the new record's attempt/status already
        // reflect the retry by construction.
        EventType::Retrying => {}
        EventType::Cancelled => {
            record.status = RunStatus::Cancelled;
            record.completed_at = Some(event.timestamp);
        }
        EventType::DlqMoved | EventType::DlqReprocessed => {}
    }
    Ok(())
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn create_run(&self, run: RunRecord) -> Result<(), TaskforgeError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.run_id) {
            return Err(TaskforgeError::Internal(format!("run {} already exists", run.run_id)));
        }
        if let Some(key) = run.spec.idempotency_key.clone() {
            self.idempotency.write().entry(key).or_insert_with(|| run.run_id.clone());
        }
        runs.insert(run.run_id.clone(), RunState { record: run, events: Vec::new() });
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord, TaskforgeError> {
        self.runs
            .read()
            .get(run_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| TaskforgeError::RunNotFound { run_id: run_id.to_string() })
    }

    async fn list_runs(&self, filter: RunFilter, pagination: Pagination) -> Result<Vec<RunRecord>, TaskforgeError> {
        let runs = self.runs.read();
        let mut matching: Vec<RunRecord> = runs
            .values()
            .map(|s| &s.record)
            .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
            .filter(|r| filter.kind.map(|k| k == r.spec.kind).unwrap_or(true))
            .filter(|r| filter.lane.as_ref().map(|l| l == &r.spec.lane).unwrap_or(true))
            .filter(|r| match &filter.parent_run_id {
                Some(p) => r.spec.parent_run_id.as_deref() == Some(p.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        let start = pagination.offset as usize;
        let end = start.saturating_add(pagination.limit as usize);
        Ok(matching.into_iter().skip(start).take(end.saturating_sub(start)).collect())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>, TaskforgeError> {
        let run_id = self.idempotency.read().get(key).cloned();
        match run_id {
            Some(id) => Ok(self.runs.read().get(&id).map(|s| s.record.clone())),
            None => Ok(None),
        }
    }

    async fn append_event(&self, event: RunEvent, expected_sequence: i64) -> Result<i64, TaskforgeError> {
        let mut runs = self.runs.write();
        let state = runs
            .get_mut(&event.run_id)
            .ok_or_else(|| TaskforgeError::RunNotFound { run_id: event.run_id.clone() })?;

        if state.record.sequence != expected_sequence {
            return Err(TaskforgeError::ConcurrencyConflict {
                run_id: event.run_id.clone(),
                expected: expected_sequence,
                actual: state.record.sequence,
            });
        }

        apply_event(&mut state.record, &event)?;
        state.record.sequence += 1;
        let new_sequence = state.record.sequence;
        state.events.push(event);
        Ok(new_sequence)
    }

    async fn load_events(&self, run_id: &str) -> Result<Vec<RunEvent>, TaskforgeError> {
        self.runs
            .read()
            .get(run_id)
            .map(|s| s.events.clone())
            .ok_or_else(|| TaskforgeError::RunNotFound { run_id: run_id.to_string() })
    }

    async fn record_heartbeat(&self, run_id: &str) -> Result<(), TaskforgeError> {
        let mut runs = self.runs.write();
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| TaskforgeError::RunNotFound { run_id: run_id.to_string() })?;
        state.record.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn find_stale_running(&self, threshold: std::time::Duration) -> Result<Vec<RunRecord>, TaskforgeError> {
        let now = Utc::now();
        Ok(self
            .runs
            .read()
            .values()
            .map(|s| &s.record)
            .filter(|r| r.status == RunStatus::Running)
            .filter(|r| {
                let last = r.last_heartbeat_at.or(r.started_at).unwrap_or(r.created_at);
                now.signed_duration_since(last).to_std().unwrap_or_default() > threshold
            })
            .cloned()
            .collect())
    }

    async fn move_to_dlq(&self, run_id: &str, error_history: Vec<String>) -> Result<DlqEntry, TaskforgeError> {
        let record = self.get_run(run_id).await?;
        let entry = DlqEntry {
            id: Uuid::now_v7().to_string(),
            original_run_id: run_id.to_string(),
            spec_kind: record.spec.kind,
            spec_name: record.spec.name.clone(),
            attempts: record.attempt,
            last_error: record.error.clone().unwrap_or_default(),
            error_history,
            enqueued_at: Utc::now(),
        };
        self.dlq.write().insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    async fn requeue_from_dlq(&self, dlq_id: &str) -> Result<RunRecord, TaskforgeError> {
        let entry = self
            .dlq
            .write()
            .remove(dlq_id)
            .ok_or_else(|| TaskforgeError::DlqEntryNotFound { dlq_id: dlq_id.to_string() })?;
        let original = self.get_run(&entry.original_run_id).await?;
        let mut new_run = RunRecord::new_pending(original.spec.clone(), original.executor_name.clone(), Utc::now());
        new_run.retry_of_run_id = Some(entry.original_run_id.clone());
        self.create_run(new_run.clone()).await?;
        Ok(new_run)
    }

    async fn get_dlq_entry(&self, dlq_id: &str) -> Result<DlqEntry, TaskforgeError> {
        self.dlq
            .read()
            .get(dlq_id)
            .cloned()
            .ok_or_else(|| TaskforgeError::DlqEntryNotFound { dlq_id: dlq_id.to_string() })
    }

    async fn list_dlq(&self, filter: DlqFilter, pagination: Pagination) -> Result<Vec<DlqEntry>, TaskforgeError> {
        let mut entries: Vec<DlqEntry> = self
            .dlq
            .read()
            .values()
            .filter(|e| filter.spec_name.as_ref().map(|n| n == &e.spec_name).unwrap_or(true))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.enqueued_at);
        let start = pagination.offset as usize;
        let end = start.saturating_add(pagination.limit as usize);
        Ok(entries.into_iter().skip(start).take(end.saturating_sub(start)).collect())
    }

    async fn purge_dlq_entry(&self, dlq_id: &str) -> Result<(), TaskforgeError> {
        self.dlq
            .write()
            .remove(dlq_id)
            .map(|_| ())
            .ok_or_else(|| TaskforgeError::DlqEntryNotFound { dlq_id: dlq_id.to_string() })
    }
}

#[async_trait]
impl CircuitBreakerStore for InMemoryLedger {
    async fn get_circuit_breaker(&self, key: &str) -> Result<Option<CircuitBreakerState>, TaskforgeError> {
        Ok(self.circuit_breakers.read().get(key).map(|row| CircuitBreakerState {
            key: key.to_string(),
            state: row.state,
            failure_count: row.failure_count,
            success_count: row.success_count,
            opened_at: row.opened_at,
            updated_at: row.updated_at,
        }))
    }

    async fn create_circuit_breaker(&self, key: &str, _config: &CircuitBreakerConfig) -> Result<(), TaskforgeError> {
        self.circuit_breakers.write().entry(key.to_string()).or_insert_with(|| CircuitRow {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            updated_at: Utc::now(),
        });
        Ok(())
    }

    async fn update_circuit_breaker(
        &self,
        key: &str,
        state: CircuitState,
        failure_count: u32,
        success_count: u32,
        opened_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), TaskforgeError> {
        let mut breakers = self.circuit_breakers.write();
        let row = breakers.entry(key.to_string()).or_insert_with(|| CircuitRow {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            updated_at: Utc::now(),
        });
        row.state = state;
        row.failure_count = failure_count;
        row.success_count = success_count;
        if opened_at.is_some() {
            row.opened_at = opened_at;
        } else if state == CircuitState::Closed {
            row.opened_at = None;
        }
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ConcurrencyGuard for InMemoryLedger {
    async fn try_acquire(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<bool, TaskforgeError> {
        self.guard.try_acquire(entity_type, entity_id, run_id).await
    }

    async fn release(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<(), TaskforgeError> {
        self.guard.release(entity_type, entity_id, run_id).await
    }

    async fn holder(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>, TaskforgeError> {
        self.guard.holder(entity_type, entity_id).await
    }
}
