//! [`EngineConfig`]: loads spec.md §6's "Environment & config" keys
//! from environment variables (SPEC_FULL.md §A.3).
//!
//! Grounded on `everruns-observability/src/config.rs`'s
//! `ObservabilityConfig::from_env`/`LangfuseConfig::from_env` pattern:
//! plain `std::env::var` reads with `.unwrap_or(default)` fallbacks, no
//! config-file crate. Keys map to env vars by upper-snake-casing and
//! replacing `.` with `_`, prefixed `TASKFORGE_`.

use std::env;
use std::time::Duration;

use crate::resilience::{BackoffStrategy, JitterMode, RateLimiterKind};

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Which executor a [`crate::dispatcher::Dispatcher`] routes to when a
/// spec's lane has no explicit mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultExecutorKind {
    Memory,
    Local,
}

impl DefaultExecutorKind {
    fn parse(s: &str) -> Self {
        match s {
            "local" => Self::Local,
            _ => Self::Memory,
        }
    }
}

/// `executor.*` keys.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default: DefaultExecutorKind,
    pub local_max_concurrent: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { default: DefaultExecutorKind::Memory, local_max_concurrent: 16 }
    }
}

/// `retry.default.*` keys.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub base_seconds: u64,
    pub max_delay_seconds: u64,
    pub jitter: JitterMode,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3, backoff: BackoffStrategy::Exponential, base_seconds: 1, max_delay_seconds: 60, jitter: JitterMode::Full }
    }
}

/// `circuit.default.*` keys.
#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub failure_window_seconds: u64,
    pub recovery_timeout_seconds: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, failure_window_seconds: 60, recovery_timeout_seconds: 30 }
    }
}

/// `rate.default.*` keys.
#[derive(Debug, Clone)]
pub struct RateSettings {
    pub algorithm: RateLimiterKind,
    pub capacity: u32,
    pub refill_per_sec: u32,
    pub window_seconds: u64,
    pub max_requests: u32,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self { algorithm: RateLimiterKind::TokenBucket, capacity: 100, refill_per_sec: 10, window_seconds: 1, max_requests: 100 }
    }
}

/// Which backend [`crate::ledger::ExecutionLedger`] implementation to
/// construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Memory,
    Sqlite,
    Postgres,
}

impl LedgerBackend {
    fn parse(s: &str) -> Self {
        match s {
            "sqlite" => Self::Sqlite,
            "postgres" => Self::Postgres,
            _ => Self::Memory,
        }
    }
}

/// `ledger.backend` plus `dlq.*` keys.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub backend: LedgerBackend,
    pub dlq_enabled: bool,
    pub dlq_retention_days: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self { backend: LedgerBackend::Memory, dlq_enabled: true, dlq_retention_days: 30 }
    }
}

/// All of spec.md §6's recognized configuration keys, typed and
/// defaulted.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub executor: ExecutorSettings,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    pub rate: RateSettings,
    pub ledger: LedgerSettings,
}

impl EngineConfig {
    /// Recognized environment variables (all optional, defaults per
    /// spec.md §6):
    /// `TASKFORGE_EXECUTOR_DEFAULT`, `TASKFORGE_EXECUTOR_LOCAL_MAX_CONCURRENT`,
    /// `TASKFORGE_RETRY_DEFAULT_MAX_RETRIES`, `TASKFORGE_RETRY_DEFAULT_BACKOFF`,
    /// `TASKFORGE_RETRY_DEFAULT_BASE_SECONDS`, `TASKFORGE_RETRY_DEFAULT_MAX_DELAY`,
    /// `TASKFORGE_RETRY_DEFAULT_JITTER`,
    /// `TASKFORGE_CIRCUIT_DEFAULT_FAILURE_THRESHOLD`,
    /// `TASKFORGE_CIRCUIT_DEFAULT_FAILURE_WINDOW`,
    /// `TASKFORGE_CIRCUIT_DEFAULT_RECOVERY_TIMEOUT`,
    /// `TASKFORGE_RATE_DEFAULT_ALGORITHM`, `TASKFORGE_RATE_DEFAULT_CAPACITY`,
    /// `TASKFORGE_RATE_DEFAULT_REFILL_PER_SEC`,
    /// `TASKFORGE_RATE_DEFAULT_WINDOW_SECONDS`,
    /// `TASKFORGE_RATE_DEFAULT_MAX_REQUESTS`,
    /// `TASKFORGE_LEDGER_BACKEND`, `TASKFORGE_DLQ_ENABLED`,
    /// `TASKFORGE_DLQ_RETENTION_DAYS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let executor = ExecutorSettings {
            default: env_var("TASKFORGE_EXECUTOR_DEFAULT").map(|v| DefaultExecutorKind::parse(&v)).unwrap_or(defaults.executor.default),
            local_max_concurrent: env_parse("TASKFORGE_EXECUTOR_LOCAL_MAX_CONCURRENT", defaults.executor.local_max_concurrent),
        };

        let retry = RetrySettings {
            max_retries: env_parse("TASKFORGE_RETRY_DEFAULT_MAX_RETRIES", defaults.retry.max_retries),
            backoff: env_var("TASKFORGE_RETRY_DEFAULT_BACKOFF").map(|v| parse_backoff(&v)).unwrap_or(defaults.retry.backoff),
            base_seconds: env_parse("TASKFORGE_RETRY_DEFAULT_BASE_SECONDS", defaults.retry.base_seconds),
            max_delay_seconds: env_parse("TASKFORGE_RETRY_DEFAULT_MAX_DELAY", defaults.retry.max_delay_seconds),
            jitter: env_var("TASKFORGE_RETRY_DEFAULT_JITTER").map(|v| parse_jitter(&v)).unwrap_or(defaults.retry.jitter),
        };

        let circuit = CircuitSettings {
            failure_threshold: env_parse("TASKFORGE_CIRCUIT_DEFAULT_FAILURE_THRESHOLD", defaults.circuit.failure_threshold),
            failure_window_seconds: env_parse("TASKFORGE_CIRCUIT_DEFAULT_FAILURE_WINDOW", defaults.circuit.failure_window_seconds),
            recovery_timeout_seconds: env_parse("TASKFORGE_CIRCUIT_DEFAULT_RECOVERY_TIMEOUT", defaults.circuit.recovery_timeout_seconds),
        };

        let rate = RateSettings {
            algorithm: env_var("TASKFORGE_RATE_DEFAULT_ALGORITHM").map(|v| parse_rate_kind(&v)).unwrap_or(defaults.rate.algorithm),
            capacity: env_parse("TASKFORGE_RATE_DEFAULT_CAPACITY", defaults.rate.capacity),
            refill_per_sec: env_parse("TASKFORGE_RATE_DEFAULT_REFILL_PER_SEC", defaults.rate.refill_per_sec),
            window_seconds: env_parse("TASKFORGE_RATE_DEFAULT_WINDOW_SECONDS", defaults.rate.window_seconds),
            max_requests: env_parse("TASKFORGE_RATE_DEFAULT_MAX_REQUESTS", defaults.rate.max_requests),
        };

        let ledger = LedgerSettings {
            backend: env_var("TASKFORGE_LEDGER_BACKEND").map(|v| LedgerBackend::parse(&v)).unwrap_or(defaults.ledger.backend),
            dlq_enabled: env_var("TASKFORGE_DLQ_ENABLED").map(|v| v == "true" || v == "1").unwrap_or(defaults.ledger.dlq_enabled),
            dlq_retention_days: env_parse("TASKFORGE_DLQ_RETENTION_DAYS", defaults.ledger.dlq_retention_days),
        };

        Self { executor, retry, circuit, rate, ledger }
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry.max_delay_seconds)
    }

    pub fn circuit_failure_window(&self) -> Duration {
        Duration::from_secs(self.circuit.failure_window_seconds)
    }

    pub fn circuit_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit.recovery_timeout_seconds)
    }
}

fn parse_backoff(s: &str) -> BackoffStrategy {
    match s {
        "constant" => BackoffStrategy::Constant,
        "linear" => BackoffStrategy::Linear,
        "fibonacci" => BackoffStrategy::Fibonacci,
        _ => BackoffStrategy::Exponential,
    }
}

fn parse_jitter(s: &str) -> JitterMode {
    match s {
        "none" => JitterMode::None,
        "equal" => JitterMode::Equal,
        _ => JitterMode::Full,
    }
}

fn parse_rate_kind(s: &str) -> RateLimiterKind {
    match s {
        "sliding_window" => RateLimiterKind::SlidingWindow,
        _ => RateLimiterKind::TokenBucket,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_implied_values() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.default, DefaultExecutorKind::Memory);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.ledger.backend, LedgerBackend::Memory);
        assert!(config.ledger.dlq_enabled);
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        env::remove_var("TASKFORGE_EXECUTOR_DEFAULT");
        env::remove_var("TASKFORGE_RETRY_DEFAULT_MAX_RETRIES");
        let config = EngineConfig::from_env();
        assert_eq!(config.executor.default, DefaultExecutorKind::Memory);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn from_env_reads_overrides() {
        env::set_var("TASKFORGE_LEDGER_BACKEND", "postgres");
        env::set_var("TASKFORGE_CIRCUIT_DEFAULT_FAILURE_THRESHOLD", "9");
        let config = EngineConfig::from_env();
        assert_eq!(config.ledger.backend, LedgerBackend::Postgres);
        assert_eq!(config.circuit.failure_threshold, 9);
        env::remove_var("TASKFORGE_LEDGER_BACKEND");
        env::remove_var("TASKFORGE_CIRCUIT_DEFAULT_FAILURE_THRESHOLD");
    }
}
