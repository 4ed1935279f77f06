//! Circuit breaker: closed/open/half_open state machine backed by the
//! execution ledger (spec.md §4.4).
//!
//! Grounded on the teacher's `CircuitBreakerConfig`/`CircuitState`
//! (config and state types) plus the state-machine logic of
//! `DistributedCircuitBreaker`, generalized from a Postgres-only store
//! to any [`CircuitBreakerStore`] implementation — the execution ledger
//! implements this trait directly so the breaker shares state with
//! whatever backend the ledger is configured with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::TaskforgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

/// Persisted circuit-breaker row. The execution ledger owns storage;
/// the breaker only reads/writes through [`CircuitBreakerStore`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CircuitBreakerStore: Send + Sync {
    async fn get_circuit_breaker(&self, key: &str) -> Result<Option<CircuitBreakerState>, TaskforgeError>;

    async fn create_circuit_breaker(
        &self,
        key: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<(), TaskforgeError>;

    async fn update_circuit_breaker(
        &self,
        key: &str,
        state: CircuitState,
        failure_count: u32,
        success_count: u32,
        opened_at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskforgeError>;
}

#[derive(Debug, Clone)]
struct CachedState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<DateTime<Utc>>,
    /// When the store last recorded a transition for this key, used to
    /// age failures out of `record_failure`'s sliding window.
    updated_at: DateTime<Utc>,
    cached_at: DateTime<Utc>,
}

impl CachedState {
    fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now()
            .signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::MAX);
        age > max_age
    }
}

/// Permit returned by [`CircuitBreaker::allow`]; the caller must report
/// the outcome of the call it guards.
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
}

impl<'a> CircuitBreakerPermit<'a> {
    pub async fn success(self) -> Result<(), TaskforgeError> {
        self.breaker.record_success().await
    }

    pub async fn failure(self) -> Result<(), TaskforgeError> {
        self.breaker.record_failure().await
    }
}

pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    store: Arc<dyn CircuitBreakerStore>,
    local_cache: RwLock<Option<CachedState>>,
    cache_duration: Duration,
    /// Gates `half_open` to exactly one in-flight probe: `true` means a
    /// probe was handed out and hasn't reported its outcome yet.
    half_open_probe: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig, store: Arc<dyn CircuitBreakerStore>) -> Self {
        Self {
            key: key.into(),
            config,
            store,
            local_cache: RwLock::new(None),
            cache_duration: Duration::from_secs(1),
            half_open_probe: AtomicBool::new(false),
        }
    }

    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns a permit, or `CircuitOpen` if the circuit rejects the call.
    pub async fn allow(&self) -> Result<CircuitBreakerPermit<'_>, TaskforgeError> {
        let state = self.get_state().await?;
        match state.state {
            CircuitState::Closed => Ok(CircuitBreakerPermit { breaker: self }),
            CircuitState::Open => {
                if self.should_transition_to_half_open(&state) {
                    self.transition_to_half_open().await?;
                    self.take_half_open_probe()
                } else {
                    Err(TaskforgeError::CircuitOpen { key: self.key.clone() })
                }
            }
            CircuitState::HalfOpen => self.take_half_open_probe(),
        }
    }

    /// Hand out the single in-flight `half_open` probe slot; every
    /// caller after the first is rejected until the probe's outcome is
    /// reported via [`CircuitBreakerPermit::success`]/`::failure`.
    fn take_half_open_probe(&self) -> Result<CircuitBreakerPermit<'_>, TaskforgeError> {
        match self.half_open_probe.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(CircuitBreakerPermit { breaker: self }),
            Err(_) => Err(TaskforgeError::CircuitOpen { key: self.key.clone() }),
        }
    }

    pub async fn state(&self) -> Result<CircuitState, TaskforgeError> {
        Ok(self.get_state().await?.state)
    }

    pub async fn reset(&self) -> Result<(), TaskforgeError> {
        self.transition_to_closed().await
    }

    /// Report an outcome observed out-of-band (e.g. by a caller that
    /// checked `allow()` before handing work to an executor that
    /// reports back asynchronously, rather than holding the permit
    /// across the handoff).
    pub async fn report_success(&self) -> Result<(), TaskforgeError> {
        self.record_success().await
    }

    pub async fn report_failure(&self) -> Result<(), TaskforgeError> {
        self.record_failure().await
    }

    async fn record_success(&self) -> Result<(), TaskforgeError> {
        let state = self.get_state().await?;
        match state.state {
            CircuitState::Closed => {
                // A success while closed resets the failure streak so
                // isolated failures don't accumulate toward the
                // threshold indefinitely.
                if state.failure_count > 0 {
                    self.store.update_circuit_breaker(&self.key, CircuitState::Closed, 0, 0, None).await?;
                    *self.local_cache.write() = None;
                }
                Ok(())
            }
            CircuitState::HalfOpen => {
                self.half_open_probe.store(false, Ordering::Release);
                let successes = state.success_count + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed().await?;
                } else {
                    self.store
                        .update_circuit_breaker(&self.key, CircuitState::HalfOpen, state.failure_count, successes, None)
                        .await?;
                    *self.local_cache.write() = None;
                }
                Ok(())
            }
            CircuitState::Open => Ok(()),
        }
    }

    async fn record_failure(&self) -> Result<(), TaskforgeError> {
        let state = self.get_state().await?;
        match state.state {
            CircuitState::Closed => {
                // Age failures outside the sliding window back to zero
                // before counting this one, so a failure threshold is
                // only reached by failures clustered within
                // `window_size` of each other.
                let within_window = Utc::now().signed_duration_since(state.updated_at).to_std().unwrap_or(Duration::ZERO) <= self.config.window_size;
                let failures = if within_window { state.failure_count + 1 } else { 1 };
                if failures >= self.config.failure_threshold {
                    self.transition_to_open().await?;
                } else {
                    self.store
                        .update_circuit_breaker(&self.key, CircuitState::Closed, failures, 0, None)
                        .await?;
                    *self.local_cache.write() = None;
                }
                Ok(())
            }
            CircuitState::HalfOpen => {
                self.half_open_probe.store(false, Ordering::Release);
                self.transition_to_open().await?;
                Ok(())
            }
            CircuitState::Open => Ok(()),
        }
    }

    async fn get_state(&self) -> Result<CachedState, TaskforgeError> {
        {
            let cache = self.local_cache.read();
            if let Some(cached) = cache.as_ref() {
                if !cached.is_stale(self.cache_duration) {
                    return Ok(cached.clone());
                }
            }
        }

        let db_state = self.store.get_circuit_breaker(&self.key).await?;
        let cached = match db_state {
            Some(s) => CachedState {
                state: s.state,
                failure_count: s.failure_count,
                success_count: s.success_count,
                opened_at: s.opened_at,
                updated_at: s.updated_at,
                cached_at: Utc::now(),
            },
            None => {
                self.store.create_circuit_breaker(&self.key, &self.config).await?;
                let now = Utc::now();
                CachedState {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    success_count: 0,
                    opened_at: None,
                    updated_at: now,
                    cached_at: now,
                }
            }
        };

        *self.local_cache.write() = Some(cached.clone());
        Ok(cached)
    }

    fn should_transition_to_half_open(&self, state: &CachedState) -> bool {
        match state.opened_at {
            Some(opened_at) => {
                let elapsed = Utc::now()
                    .signed_duration_since(opened_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed >= self.config.reset_timeout
            }
            None => false,
        }
    }

    async fn transition_to_open(&self) -> Result<(), TaskforgeError> {
        self.half_open_probe.store(false, Ordering::Release);
        self.store
            .update_circuit_breaker(&self.key, CircuitState::Open, 0, 0, Some(Utc::now()))
            .await?;
        *self.local_cache.write() = None;
        Ok(())
    }

    async fn transition_to_half_open(&self) -> Result<(), TaskforgeError> {
        self.store
            .update_circuit_breaker(&self.key, CircuitState::HalfOpen, 0, 0, None)
            .await?;
        *self.local_cache.write() = None;
        Ok(())
    }

    async fn transition_to_closed(&self) -> Result<(), TaskforgeError> {
        self.half_open_probe.store(false, Ordering::Release);
        self.store
            .update_circuit_breaker(&self.key, CircuitState::Closed, 0, 0, None)
            .await?;
        *self.local_cache.write() = None;
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::collections::HashMap;

    struct MemStore {
        rows: PMutex<HashMap<String, CircuitBreakerState>>,
    }

    impl MemStore {
        fn new() -> Self {
            Self { rows: PMutex::new(HashMap::new()) }
        }
    }

    #[async_trait]
    impl CircuitBreakerStore for MemStore {
        async fn get_circuit_breaker(&self, key: &str) -> Result<Option<CircuitBreakerState>, TaskforgeError> {
            Ok(self.rows.lock().get(key).cloned())
        }

        async fn create_circuit_breaker(&self, key: &str, _config: &CircuitBreakerConfig) -> Result<(), TaskforgeError> {
            self.rows.lock().insert(
                key.to_string(),
                CircuitBreakerState {
                    key: key.to_string(),
                    state: CircuitState::Closed,
                    failure_count: 0,
                    success_count: 0,
                    opened_at: None,
                    updated_at: Utc::now(),
                },
            );
            Ok(())
        }

        async fn update_circuit_breaker(
            &self,
            key: &str,
            state: CircuitState,
            failure_count: u32,
            success_count: u32,
            opened_at: Option<DateTime<Utc>>,
        ) -> Result<(), TaskforgeError> {
            let mut rows = self.rows.lock();
            let entry = rows.entry(key.to_string()).or_insert_with(|| CircuitBreakerState {
                key: key.to_string(),
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                updated_at: Utc::now(),
            });
            entry.state = state;
            entry.failure_count = failure_count;
            entry.success_count = success_count;
            if opened_at.is_some() {
                entry.opened_at = opened_at;
            } else if state == CircuitState::Closed {
                entry.opened_at = None;
            }
            entry.updated_at = Utc::now();
            Ok(())
        }
    }

    fn make_breaker() -> CircuitBreaker {
        let store = Arc::new(MemStore::new());
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::from_millis(100)),
            store,
        )
        .with_cache_duration(Duration::ZERO)
    }

    #[tokio::test]
    async fn starts_closed() {
        let breaker = make_breaker();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = make_breaker();
        for _ in 0..3 {
            let permit = breaker.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        let result = breaker.allow().await;
        assert!(matches!(result, Err(TaskforgeError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn half_opens_after_reset_timeout_then_closes_on_success_threshold() {
        let breaker = make_breaker();
        for _ in 0..3 {
            let permit = breaker.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let permit = breaker.allow().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);
        permit.success().await.unwrap();

        let permit = breaker.allow().await.unwrap();
        permit.success().await.unwrap();

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let breaker = make_breaker();
        for _ in 0..3 {
            let permit = breaker.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let permit = breaker.allow().await.unwrap();
        permit.failure().await.unwrap();

        let result = breaker.allow().await;
        assert!(matches!(result, Err(TaskforgeError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = make_breaker();
        for _ in 0..3 {
            let permit = breaker.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        breaker.reset().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_in_flight_probe() {
        let breaker = make_breaker();
        for _ in 0..3 {
            let permit = breaker.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let probe = breaker.allow().await.unwrap();
        let second = breaker.allow().await;
        assert!(matches!(second, Err(TaskforgeError::CircuitOpen { .. })));

        probe.success().await.unwrap();
        assert!(breaker.allow().await.is_ok());
    }

    #[tokio::test]
    async fn success_while_closed_resets_failure_streak() {
        let breaker = make_breaker();
        let permit = breaker.allow().await.unwrap();
        permit.failure().await.unwrap();
        let permit = breaker.allow().await.unwrap();
        permit.success().await.unwrap();

        // Two more failures shouldn't reach the threshold of 3 since
        // the streak was reset by the intervening success.
        for _ in 0..2 {
            let permit = breaker.allow().await.unwrap();
            permit.failure().await.unwrap();
        }
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_accumulate() {
        let store = Arc::new(MemStore::new());
        let breaker = CircuitBreaker::new(
            "windowed",
            CircuitBreakerConfig::default().with_failure_threshold(3).with_window_size(Duration::from_millis(50)),
            store,
        )
        .with_cache_duration(Duration::ZERO);

        let permit = breaker.allow().await.unwrap();
        permit.failure().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // This failure lands outside the window, so it restarts the
        // count at 1 rather than accumulating to 2.
        let permit = breaker.allow().await.unwrap();
        permit.failure().await.unwrap();
        let permit = breaker.allow().await.unwrap();
        permit.failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }
}
