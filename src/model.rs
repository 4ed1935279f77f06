//! Canonical value types carried through the dispatcher, ledger, and
//! workflow engine: [`WorkSpec`], [`RunRecord`], [`RunEvent`], and the
//! closed enums that describe their fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCategory;

/// What kind of work a [`WorkSpec`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Task,
    Pipeline,
    Workflow,
    /// A single workflow step, tracked as a child run. Never submitted
    /// directly by a caller.
    Step,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Pipeline => write!(f, "pipeline"),
            Self::Workflow => write!(f, "workflow"),
            Self::Step => write!(f, "step"),
        }
    }
}

/// Advisory scheduling priority. Ordered so that `Realtime > High >
/// Normal > Low > Slow`; executors that support queue routing dequeue
/// higher-priority work first within the same lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Slow,
    Low,
    Normal,
    High,
    Realtime,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Origin of a submission. Recorded only; never drives behavior in the
/// core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Api,
    Cli,
    Schedule,
    Webhook,
    Internal,
    ParentWorkflow,
}

/// Immutable description of work to run. Cheap to clone; never mutated
/// after submission (see spec.md §3 "WorkSpec").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    pub kind: WorkKind,
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_lane")]
    pub lane: String,
    pub trigger_source: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_lane() -> String {
    "normal".to_string()
}

impl WorkSpec {
    /// Start building a task/pipeline/workflow spec with the required
    /// fields; everything else defaults per spec.md §3.
    pub fn new(kind: WorkKind, name: impl Into<String>, trigger_source: TriggerSource) -> Self {
        Self {
            kind,
            name: name.into(),
            params: Value::Object(Default::default()),
            priority: Priority::default(),
            lane: default_lane(),
            trigger_source,
            idempotency_key: None,
            correlation_id: None,
            parent_run_id: None,
            max_retries: None,
            timeout_seconds: None,
            heartbeat_timeout_seconds: None,
            metadata: Value::Object(Default::default()),
            tags: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_parent_run_id(mut self, id: impl Into<String>) -> Self {
        self.parent_run_id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn with_timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Entity `(type, id)` pair this spec's concurrency guard should
    /// key on, if its metadata carries one. Looks for
    /// `metadata.entity_type` / `metadata.entity_id`.
    pub fn entity_key(&self) -> Option<(String, String)> {
        let entity_type = self.metadata.get("entity_type")?.as_str()?.to_string();
        let entity_id = self.metadata.get("entity_id")?.as_str()?.to_string();
        Some((entity_type, entity_id))
    }

    /// Validate this spec per spec.md §4.5 step 1. Does not touch the
    /// registry or the ledger.
    pub fn validate(&self) -> Result<(), crate::error::TaskforgeError> {
        use crate::error::TaskforgeError;

        if matches!(self.kind, WorkKind::Step) {
            return Err(TaskforgeError::Validation(
                "kind=step cannot be submitted directly".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(TaskforgeError::Validation("name must be non-empty".to_string()));
        }
        if !self.params.is_object() && !self.params.is_null() {
            return Err(TaskforgeError::Validation(
                "params must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

/// The state machine described in spec.md §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// `true` for the three terminal statuses; once a run enters one of
    /// these it never transitions again (spec.md §3 invariant).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an allowed transition per the state
    /// diagram in spec.md §4.1.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Running) // heartbeat/progress: status unchanged
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Mutable state of one execution attempt (spec.md §3 "RunRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub spec: WorkSpec,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    pub executor_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of_run_id: Option<String>,
    /// Optimistic-concurrency sequence number, incremented by every
    /// ledger-applied event. A `ExecutionLedger::append_event` call
    /// that doesn't match the run's current sequence fails with
    /// `ConcurrencyConflict`.
    #[serde(default)]
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Construct a new `pending` record for `spec`, generating a
    /// time-ordered run id the way the teacher mints workflow ids with
    /// `Uuid::now_v7()`.
    pub fn new_pending(spec: WorkSpec, executor_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            spec,
            status: RunStatus::Pending,
            external_ref: None,
            executor_name: executor_name.into(),
            result: None,
            error: None,
            error_type: None,
            error_category: None,
            attempt: 1,
            retry_of_run_id: None,
            sequence: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
        }
    }

    /// `completed_at - started_at`, if both are set (spec.md §3
    /// invariant: `completed_at` is set iff status is terminal).
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// The closed set of lifecycle transitions an event can record (spec.md
/// §3 "RunEvent").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Submitted,
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Retrying,
    Cancelled,
    Heartbeat,
    DlqMoved,
    DlqReprocessed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
            Self::Heartbeat => "heartbeat",
            Self::DlqMoved => "dlq_moved",
            Self::DlqReprocessed => "dlq_reprocessed",
        };
        write!(f, "{s}")
    }
}

/// Append-only record of a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: String,
    pub run_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    pub source: String,
}

impl RunEvent {
    pub fn new(
        run_id: impl Into<String>,
        event_type: EventType,
        data: Value,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            run_id: run_id.into(),
            event_type,
            timestamp: now,
            data,
            source: source.into(),
        }
    }
}
