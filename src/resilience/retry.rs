//! Retry policy: backoff strategy selection plus jitter (spec.md §4.4).
//!
//! Generalizes the teacher's `RetryPolicy`, which only ever computed an
//! exponential-with-jitter-factor delay, into the closed set of backoff
//! strategies and jitter modes spec.md §4.4 names.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every retry.
    Constant,
    /// Delay grows linearly with the retry number.
    Linear,
    /// Delay grows by `backoff_coefficient` each retry.
    Exponential,
    /// Delay follows the Fibonacci sequence scaled by the initial interval.
    Fibonacci,
}

/// How randomness is mixed into the computed delay, to avoid a
/// thundering herd of retries landing on the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// No randomness; use the computed delay as-is.
    None,
    /// Uniform random delay in `[0, computed]` (AWS "full jitter").
    Full,
    /// Uniform random delay in `[computed / 2, computed]` ("equal jitter").
    Equal,
}

/// Retry configuration for a handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial one.
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    pub strategy: BackoffStrategy,

    /// Per-step growth factor used by `Exponential`. Unused by
    /// `Constant`, `Linear`, and `Fibonacci`.
    pub backoff_coefficient: f64,

    /// Fixed per-step increment used by `Linear`:
    /// `initial_interval + step * retry_num`. Unused by every other
    /// strategy.
    #[serde(with = "duration_millis")]
    pub step: Duration,

    pub jitter: JitterMode,

    /// Error types that should never be retried, regardless of attempts
    /// remaining.
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn constant(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            strategy: BackoffStrategy::Constant,
            backoff_coefficient: 1.0,
            step: Duration::ZERO,
            jitter: JitterMode::None,
            non_retryable_errors: vec![],
        }
    }

    /// 5 attempts, 1s initial interval, 1s step, 60s cap, equal jitter.
    pub fn linear() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            strategy: BackoffStrategy::Linear,
            backoff_coefficient: 1.0,
            step: Duration::from_secs(1),
            jitter: JitterMode::Equal,
            non_retryable_errors: vec![],
        }
    }

    /// 5 attempts, 1s initial interval, 60s cap, 2x growth, equal jitter.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            backoff_coefficient: 2.0,
            step: Duration::ZERO,
            jitter: JitterMode::Equal,
            non_retryable_errors: vec![],
        }
    }

    pub fn fibonacci() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            strategy: BackoffStrategy::Fibonacci,
            backoff_coefficient: 1.0,
            step: Duration::ZERO,
            jitter: JitterMode::Equal,
            non_retryable_errors: vec![],
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            strategy: BackoffStrategy::Constant,
            backoff_coefficient: 1.0,
            step: Duration::ZERO,
            jitter: JitterMode::None,
            non_retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay to wait before attempt `attempt` (1-based; attempt 1 is
    /// the initial try and always returns zero).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = (attempt - 1) as i32;

        let base = match self.strategy {
            BackoffStrategy::Constant => self.initial_interval.as_secs_f64(),
            BackoffStrategy::Linear => self.initial_interval.as_secs_f64() + self.step.as_secs_f64() * retry_num as f64,
            BackoffStrategy::Exponential => {
                self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(retry_num - 1)
            }
            BackoffStrategy::Fibonacci => self.initial_interval.as_secs_f64() * fibonacci(retry_num as u32) as f64,
        };
        let capped = base.min(self.max_interval.as_secs_f64()).max(0.0);

        let jittered = match self.jitter {
            JitterMode::None => capped,
            JitterMode::Full => rand::thread_rng().gen_range(0.0..=capped.max(f64::EPSILON)),
            JitterMode::Equal => {
                let half = capped / 2.0;
                half + rand::thread_rng().gen_range(0.0..=half.max(f64::EPSILON))
            }
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.contains(&error_type.to_string()),
            None => true,
        }
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// 1-indexed Fibonacci: fib(1) = fib(2) = 1, fib(3) = 2, ...
fn fibonacci(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
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

    #[test]
    fn constant_backoff_is_flat() {
        let policy = RetryPolicy::constant(Duration::from_secs(2), 4).with_jitter(JitterMode::None);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
    }

    #[test]
    fn linear_backoff_grows_additively_by_step() {
        let policy = RetryPolicy::linear()
            .with_initial_interval(Duration::from_secs(1))
            .with_step(Duration::from_secs(2))
            .with_jitter(JitterMode::None);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(7));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy::exponential().with_jitter(JitterMode::None);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn fibonacci_backoff_follows_sequence() {
        let policy = RetryPolicy::fibonacci().with_jitter(JitterMode::None);
        // retry_num for attempt N is N-1; fib(1)=1, fib(2)=1, fib(3)=2, fib(4)=3
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(3));
    }

    #[test]
    fn max_interval_caps_growth() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(JitterMode::None);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn full_jitter_never_exceeds_computed_delay() {
        let policy = RetryPolicy::exponential().with_jitter(JitterMode::Full);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(4);
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[test]
    fn equal_jitter_stays_within_half_to_full_range() {
        let policy = RetryPolicy::exponential().with_jitter(JitterMode::Equal);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(4);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[test]
    fn non_retryable_errors_are_excluded() {
        let policy = RetryPolicy::exponential().with_non_retryable_error("INVALID_INPUT");
        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn has_attempts_remaining_respects_max() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn serialization_roundtrips() {
        let policy = RetryPolicy::fibonacci().with_max_attempts(10);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
