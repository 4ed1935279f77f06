//! # taskforge
//!
//! A unified execution framework for submitting, scheduling, running,
//! and recovering heterogeneous units of work: atomic tasks,
//! multi-stage pipelines, and dependency-graph workflows, all driven
//! through one [`dispatcher::Dispatcher`] with shared resilience,
//! persistence, and observability.
//!
//! ## Features
//!
//! - **Ledger-backed runs**: every unit of work is a [`model::RunRecord`]
//!   with an append-only event history, durable via an in-memory or
//!   Postgres [`ledger::ExecutionLedger`]
//! - **Resilience primitives**: retry with backoff/jitter, circuit
//!   breakers, keyed rate limiters, and an entity concurrency guard
//! - **Workflow engine**: a declarative step graph of lambdas,
//!   sub-pipelines, and branching choices
//! - **Dead-letter queue**: exhausted or non-retryable runs are
//!   quarantined for inspection and reprocessing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                             │
//! │  (validate, idempotency, resilience admission, routing)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌─────────────────┐
//! │ HandlerRegistry  │ │  ExecutionLedger  │ │    Executors    │
//! │ (task/pipeline)  │ │ (runs + events +  │ │ (memory, local) │
//! │                  │ │   DLQ)            │ │                 │
//! └─────────────────┘ └──────────────────┘ └─────────────────┘
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod handler;
pub mod ledger;
pub mod model;
pub mod pipeline_group;
pub mod registry;
pub mod resilience;
pub mod telemetry;
pub mod workflow;

/// Common imports for embedding taskforge in a host application.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig};
    pub use crate::error::{ErrorCategory, TaskforgeError};
    pub use crate::executor::{Executor, ExecutorHealth, LocalExecutor, MemoryExecutor};
    pub use crate::handler::{Handler, HandlerContext};
    pub use crate::ledger::{DlqEntry, ExecutionLedger, InMemoryLedger, PostgresLedger};
    pub use crate::model::{EventType, Priority, RunEvent, RunRecord, RunStatus, TriggerSource, WorkKind, WorkSpec};
    pub use crate::pipeline_group::{GroupStep, PipelineGroupDefinition, PipelineGroupRunner};
    pub use crate::registry::HandlerRegistry;
    pub use crate::telemetry::{init_tracing, TelemetryConfig};
    pub use crate::workflow::{OnError, Step, StepKind, TrackedWorkflowRunner, WorkflowCallbacks, WorkflowContext, WorkflowDefinition, WorkflowRunner};
}

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{ErrorCategory, TaskforgeError};
pub use handler::{Handler, HandlerContext};
pub use model::{EventType, Priority, RunEvent, RunRecord, RunStatus, TriggerSource, WorkKind, WorkSpec};
pub use registry::HandlerRegistry;
