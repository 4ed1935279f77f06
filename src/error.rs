//! Crate-wide error taxonomy (spec.md §7).
//!
//! Every fallible public operation returns `Result<T, TaskforgeError>`.
//! Each variant that can reach a [`crate::model::RunRecord`] carries an
//! [`ErrorCategory`] so the ledger never has to infer one from a message
//! string.

use serde::{Deserialize, Serialize};

/// Closed set of failure categories, each with a default retryability
/// (spec.md §7's table). A handler or resilience primitive may override
/// the default on a per-error basis (e.g. an otherwise-retryable
/// category marked non-retryable via `ActivityError::non_retryable`-style
/// constructors upstream), but the table below is what the dispatcher
/// falls back to when nothing says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    HandlerNotFound,
    HandlerConflict,
    ConcurrencyConflict,
    CircuitOpen,
    RateLimited,
    Timeout,
    Transient,
    Permanent,
    ExecutorUnavailable,
    Cancelled,
    Internal,
}

impl ErrorCategory {
    /// Default retry eligibility for this category, absent any
    /// handler-specific override.
    pub fn is_retryable_by_default(self) -> bool {
        match self {
            ErrorCategory::Transient
            | ErrorCategory::Timeout
            | ErrorCategory::RateLimited
            | ErrorCategory::CircuitOpen
            | ErrorCategory::ExecutorUnavailable => true,
            ErrorCategory::Validation
            | ErrorCategory::HandlerNotFound
            | ErrorCategory::HandlerConflict
            | ErrorCategory::ConcurrencyConflict
            | ErrorCategory::Permanent
            | ErrorCategory::Cancelled
            | ErrorCategory::Internal => false,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::HandlerNotFound => "handler_not_found",
            Self::HandlerConflict => "handler_conflict",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::ExecutorUnavailable => "executor_unavailable",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Top-level crate error. Thin on purpose: most variants just carry a
/// message and a category, matching `everruns_durable::engine::ExecutorError`'s
/// one-variant-per-failure-mode shape.
#[derive(Debug, thiserror::Error)]
pub enum TaskforgeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no handler registered for {kind} '{name}'")]
    HandlerNotFound { kind: String, name: String },

    #[error("handler already registered for {kind} '{name}'")]
    HandlerConflict { kind: String, name: String },

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("concurrency conflict updating run {run_id}: expected sequence {expected}, found {actual}")]
    ConcurrencyConflict {
        run_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("circuit '{key}' is open")]
    CircuitOpen { key: String },

    #[error("rate limit exceeded for '{key}'")]
    RateLimited { key: String },

    #[error("concurrency guard held for entity ({entity_type}, {entity_id})")]
    ConcurrencyGuardHeld { entity_type: String, entity_id: String },

    #[error("run {run_id} timed out after {timeout_seconds}s")]
    Timeout { run_id: String, timeout_seconds: u64 },

    #[error("executor '{name}' unavailable: {reason}")]
    ExecutorUnavailable { name: String, reason: String },

    #[error("run {run_id} was cancelled")]
    Cancelled { run_id: String },

    #[error("handler error: {message}")]
    Handler {
        message: String,
        category: ErrorCategory,
        retryable: bool,
    },

    #[error("dlq entry {dlq_id} not found")]
    DlqEntryNotFound { dlq_id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskforgeError {
    /// The category the dispatcher/ledger should attribute this error
    /// to, per spec.md §7.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::HandlerNotFound { .. } => ErrorCategory::HandlerNotFound,
            Self::HandlerConflict { .. } => ErrorCategory::HandlerConflict,
            Self::RunNotFound { .. } => ErrorCategory::Internal,
            Self::ConcurrencyConflict { .. } => ErrorCategory::ConcurrencyConflict,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::RateLimited { .. } => ErrorCategory::RateLimited,
            Self::ConcurrencyGuardHeld { .. } => ErrorCategory::ConcurrencyConflict,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ExecutorUnavailable { .. } => ErrorCategory::ExecutorUnavailable,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Handler { category, .. } => *category,
            Self::DlqEntryNotFound { .. } => ErrorCategory::Internal,
            Self::Serialization(_) => ErrorCategory::Internal,
            Self::Storage(_) => ErrorCategory::Transient,
            Self::Database(_) => ErrorCategory::Transient,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this specific error instance should be retried. Defers
    /// to the category's default, except `Handler` which carries its
    /// own explicit flag (a handler may know its own error is permanent
    /// even though its category would otherwise be retryable).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handler { retryable, .. } => *retryable,
            other => other.category().is_retryable_by_default(),
        }
    }
}
