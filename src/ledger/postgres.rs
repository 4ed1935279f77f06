//! PostgreSQL [`ExecutionLedger`], grounded on
//! `persistence/postgres.rs::PostgresWorkflowEventStore`: a connection
//! pool, `#[instrument]`ed queries, and the same
//! bind-parameters-then-map-sqlx-errors style. The run schema stores
//! [`crate::model::WorkSpec`] as a single JSONB column and keeps
//! everything the ledger needs to filter or lock as plain columns
//! alongside it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::{DlqEntry, DlqFilter, ExecutionLedger, Pagination, RunFilter};
use crate::error::TaskforgeError;
use crate::model::{RunEvent, RunRecord, RunStatus, WorkKind, WorkSpec};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStore, CircuitState, ConcurrencyGuard};

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the crate's bundled migrations. Call once at startup before
    /// handing the ledger to the dispatcher.
    pub async fn migrate(&self) -> Result<(), TaskforgeError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TaskforgeError::Storage(e.to_string()))
    }
}

fn parse_status(s: &str) -> Result<RunStatus, TaskforgeError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| TaskforgeError::Internal(format!("unknown run status '{s}'")))
}

fn parse_kind(s: &str) -> Result<WorkKind, TaskforgeError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| TaskforgeError::Internal(format!("unknown work kind '{s}'")))
}

fn parse_circuit_state(s: &str) -> Result<CircuitState, TaskforgeError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| TaskforgeError::Internal(format!("unknown circuit state '{s}'")))
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<RunRecord, TaskforgeError> {
    let spec: serde_json::Value = row.get("spec");
    let spec: WorkSpec = serde_json::from_value(spec)?;
    let status: String = row.get("status");
    let error_category: Option<String> = row.get("error_category");

    Ok(RunRecord {
        run_id: row.get("run_id"),
        spec,
        status: parse_status(&status)?,
        external_ref: row.get("external_ref"),
        executor_name: row.get("executor_name"),
        result: row.get("result"),
        error: row.get("error"),
        error_type: row.get("error_type"),
        error_category: error_category
            .map(|c| serde_json::from_value(serde_json::Value::String(c)))
            .transpose()?,
        attempt: row.get::<i32, _>("attempt") as u32,
        retry_of_run_id: row.get("retry_of_run_id"),
        sequence: row.get("sequence"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
    })
}

fn row_to_dlq_entry(row: &sqlx::postgres::PgRow) -> Result<DlqEntry, TaskforgeError> {
    let spec_kind: String = row.get("spec_kind");
    let error_history: serde_json::Value = row.get("error_history");
    Ok(DlqEntry {
        id: row.get("id"),
        original_run_id: row.get("original_run_id"),
        spec_kind: parse_kind(&spec_kind)?,
        spec_name: row.get("spec_name"),
        attempts: row.get::<i32, _>("attempts") as u32,
        last_error: row.get("last_error"),
        error_history: serde_json::from_value(error_history)?,
        enqueued_at: row.get("enqueued_at"),
    })
}

#[async_trait]
impl ExecutionLedger for PostgresLedger {
    #[instrument(skip(self, run))]
    async fn create_run(&self, run: RunRecord) -> Result<(), TaskforgeError> {
        let spec_json = serde_json::to_value(&run.spec)?;
        let error_category = run.error_category.map(|c| c.to_string());

        sqlx::query(
            r#"
            INSERT INTO taskforge_runs (
                run_id, kind, name, lane, idempotency_key, parent_run_id, spec,
                status, external_ref, executor_name, result, error, error_type,
                error_category, attempt, retry_of_run_id, sequence,
                created_at, started_at, completed_at, last_heartbeat_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17,
                $18, $19, $20, $21
            )
            "#,
        )
        .bind(&run.run_id)
        .bind(run.spec.kind.to_string())
        .bind(&run.spec.name)
        .bind(&run.spec.lane)
        .bind(&run.spec.idempotency_key)
        .bind(&run.spec.parent_run_id)
        .bind(&spec_json)
        .bind(run.status.to_string())
        .bind(&run.external_ref)
        .bind(&run.executor_name)
        .bind(&run.result)
        .bind(&run.error)
        .bind(&run.error_type)
        .bind(&error_category)
        .bind(run.attempt as i32)
        .bind(&run.retry_of_run_id)
        .bind(run.sequence)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.last_heartbeat_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create run: {e}");
            e
        })?;

        debug!(run_id = %run.run_id, "created run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: &str) -> Result<RunRecord, TaskforgeError> {
        let row = sqlx::query("SELECT * FROM taskforge_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TaskforgeError::RunNotFound { run_id: run_id.to_string() })?;
        row_to_run(&row)
    }

    #[instrument(skip(self, filter))]
    async fn list_runs(&self, filter: RunFilter, pagination: Pagination) -> Result<Vec<RunRecord>, TaskforgeError> {
        let status = filter.status.map(|s| s.to_string());
        let kind = filter.kind.map(|k| k.to_string());

        let rows = sqlx::query(
            r#"
            SELECT * FROM taskforge_runs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR lane = $3)
              AND ($4::text IS NULL OR parent_run_id = $4)
            ORDER BY created_at ASC
            OFFSET $5 LIMIT $6
            "#,
        )
        .bind(status)
        .bind(kind)
        .bind(&filter.lane)
        .bind(&filter.parent_run_id)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    #[instrument(skip(self))]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>, TaskforgeError> {
        let row = sqlx::query("SELECT * FROM taskforge_runs WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    #[instrument(skip(self, event))]
    async fn append_event(&self, event: RunEvent, expected_sequence: i64) -> Result<i64, TaskforgeError> {
        let mut tx = self.pool.begin().await?;

        let current: i64 = sqlx::query_scalar("SELECT sequence FROM taskforge_runs WHERE run_id = $1 FOR UPDATE")
            .bind(&event.run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| TaskforgeError::RunNotFound { run_id: event.run_id.clone() })?;

        if current != expected_sequence {
            return Err(TaskforgeError::ConcurrencyConflict {
                run_id: event.run_id.clone(),
                expected: expected_sequence,
                actual: current,
            });
        }

        let mut record = {
            let row = sqlx::query("SELECT * FROM taskforge_runs WHERE run_id = $1")
                .bind(&event.run_id)
                .fetch_one(&mut *tx)
                .await?;
            row_to_run(&row)?
        };
        super::memory::apply_event(&mut record, &event)?;
        record.sequence = current + 1;

        let error_category = record.error_category.map(|c| c.to_string());
        sqlx::query(
            r#"
            UPDATE taskforge_runs SET
                status = $1, result = $2, error = $3, error_type = $4,
                error_category = $5, attempt = $6, sequence = $7,
                started_at = $8, completed_at = $9, last_heartbeat_at = $10
            WHERE run_id = $11
            "#,
        )
        .bind(record.status.to_string())
        .bind(&record.result)
        .bind(&record.error)
        .bind(&record.error_type)
        .bind(&error_category)
        .bind(record.attempt as i32)
        .bind(record.sequence)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.last_heartbeat_at)
        .bind(&event.run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO taskforge_run_events (event_id, run_id, event_type, timestamp, data, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.run_id)
        .bind(event.event_type.to_string())
        .bind(event.timestamp)
        .bind(&event.data)
        .bind(&event.source)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record.sequence)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, run_id: &str) -> Result<Vec<RunEvent>, TaskforgeError> {
        let rows = sqlx::query("SELECT * FROM taskforge_run_events WHERE run_id = $1 ORDER BY timestamp ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let event_type_str: String = row.get("event_type");
                Ok(RunEvent {
                    event_id: row.get("event_id"),
                    run_id: row.get("run_id"),
                    event_type: serde_json::from_value(serde_json::Value::String(event_type_str))?,
                    timestamp: row.get("timestamp"),
                    data: row.get("data"),
                    source: row.get("source"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn record_heartbeat(&self, run_id: &str) -> Result<(), TaskforgeError> {
        let result = sqlx::query("UPDATE taskforge_runs SET last_heartbeat_at = now() WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskforgeError::RunNotFound { run_id: run_id.to_string() });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_stale_running(&self, threshold: std::time::Duration) -> Result<Vec<RunRecord>, TaskforgeError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
        let rows = sqlx::query(
            r#"
            SELECT * FROM taskforge_runs
            WHERE status = 'running'
              AND COALESCE(last_heartbeat_at, started_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    #[instrument(skip(self, error_history))]
    async fn move_to_dlq(&self, run_id: &str, error_history: Vec<String>) -> Result<DlqEntry, TaskforgeError> {
        let record = self.get_run(run_id).await?;
        let entry = DlqEntry {
            id: uuid::Uuid::now_v7().to_string(),
            original_run_id: run_id.to_string(),
            spec_kind: record.spec.kind,
            spec_name: record.spec.name.clone(),
            attempts: record.attempt,
            last_error: record.error.clone().unwrap_or_default(),
            error_history,
            enqueued_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO taskforge_dlq (id, original_run_id, spec_kind, spec_name, attempts, last_error, error_history, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.original_run_id)
        .bind(entry.spec_kind.to_string())
        .bind(&entry.spec_name)
        .bind(entry.attempts as i32)
        .bind(&entry.last_error)
        .bind(serde_json::to_value(&entry.error_history)?)
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn requeue_from_dlq(&self, dlq_id: &str) -> Result<RunRecord, TaskforgeError> {
        let entry = self.get_dlq_entry(dlq_id).await?;
        let original = self.get_run(&entry.original_run_id).await?;
        let mut new_run = RunRecord::new_pending(original.spec.clone(), original.executor_name.clone(), Utc::now());
        new_run.retry_of_run_id = Some(entry.original_run_id.clone());
        self.create_run(new_run.clone()).await?;
        self.purge_dlq_entry(dlq_id).await?;
        Ok(new_run)
    }

    #[instrument(skip(self))]
    async fn get_dlq_entry(&self, dlq_id: &str) -> Result<DlqEntry, TaskforgeError> {
        let row = sqlx::query("SELECT * FROM taskforge_dlq WHERE id = $1")
            .bind(dlq_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TaskforgeError::DlqEntryNotFound { dlq_id: dlq_id.to_string() })?;
        row_to_dlq_entry(&row)
    }

    #[instrument(skip(self, filter))]
    async fn list_dlq(&self, filter: DlqFilter, pagination: Pagination) -> Result<Vec<DlqEntry>, TaskforgeError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM taskforge_dlq
            WHERE ($1::text IS NULL OR spec_name = $1)
            ORDER BY enqueued_at ASC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(&filter.spec_name)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_dlq_entry).collect()
    }

    #[instrument(skip(self))]
    async fn purge_dlq_entry(&self, dlq_id: &str) -> Result<(), TaskforgeError> {
        let result = sqlx::query("DELETE FROM taskforge_dlq WHERE id = $1")
            .bind(dlq_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskforgeError::DlqEntryNotFound { dlq_id: dlq_id.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl CircuitBreakerStore for PostgresLedger {
    #[instrument(skip(self))]
    async fn get_circuit_breaker(&self, key: &str) -> Result<Option<CircuitBreakerState>, TaskforgeError> {
        let row = sqlx::query("SELECT * FROM taskforge_circuit_breakers WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let state: String = row.get("state");
            Ok(CircuitBreakerState {
                key: row.get("key"),
                state: parse_circuit_state(&state)?,
                failure_count: row.get::<i32, _>("failure_count") as u32,
                success_count: row.get::<i32, _>("success_count") as u32,
                opened_at: row.get("opened_at"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, _config))]
    async fn create_circuit_breaker(&self, key: &str, _config: &CircuitBreakerConfig) -> Result<(), TaskforgeError> {
        sqlx::query(
            r#"
            INSERT INTO taskforge_circuit_breakers (key, state, failure_count, success_count, opened_at, updated_at)
            VALUES ($1, 'closed', 0, 0, NULL, now())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_circuit_breaker(
        &self,
        key: &str,
        state: CircuitState,
        failure_count: u32,
        success_count: u32,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskforgeError> {
        sqlx::query(
            r#"
            INSERT INTO taskforge_circuit_breakers (key, state, failure_count, success_count, opened_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (key) DO UPDATE SET
                state = EXCLUDED.state,
                failure_count = EXCLUDED.failure_count,
                success_count = EXCLUDED.success_count,
                opened_at = CASE WHEN EXCLUDED.opened_at IS NOT NULL THEN EXCLUDED.opened_at
                                 WHEN EXCLUDED.state = 'closed' THEN NULL
                                 ELSE taskforge_circuit_breakers.opened_at END,
                updated_at = now()
            "#,
        )
        .bind(key)
        .bind(state.to_string())
        .bind(failure_count as i32)
        .bind(success_count as i32)
        .bind(opened_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConcurrencyGuard for PostgresLedger {
    /// Relies on `taskforge_concurrency_guards`'s primary key as the
    /// mutual-exclusion mechanism: the insert either wins or hits a
    /// unique-violation, which is reported as "not acquired" rather than
    /// an error.
    #[instrument(skip(self))]
    async fn try_acquire(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<bool, TaskforgeError> {
        let result = sqlx::query(
            "INSERT INTO taskforge_concurrency_guards (entity_type, entity_id, run_id) VALUES ($1, $2, $3)",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(run_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn release(&self, entity_type: &str, entity_id: &str, run_id: &str) -> Result<(), TaskforgeError> {
        sqlx::query(
            "DELETE FROM taskforge_concurrency_guards WHERE entity_type = $1 AND entity_id = $2 AND run_id = $3",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn holder(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>, TaskforgeError> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT run_id FROM taskforge_concurrency_guards WHERE entity_type = $1 AND entity_id = $2",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
