//! Token-bucket and sliding-window rate limiters, plus a keyed variant
//! that limits per-entity-key traffic with TTL-based cleanup
//! (spec.md §4.4).
//!
//! No teacher equivalent exists for this primitive; it's grounded on
//! the config-builder shape of `reliability/circuit_breaker.rs` and the
//! atomic-counter style of `worker/backpressure.rs::BackpressureConfig`,
//! with the per-key caching idea borrowed from
//! `DistributedCircuitBreaker`'s local cache.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimiterKind {
    TokenBucket,
    SlidingWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimiterConfig {
    pub kind: RateLimiterKind,
    /// Token bucket: maximum burst size. Sliding window: max requests
    /// allowed within `window`.
    pub capacity: u32,
    /// Token bucket: tokens replenished per second. Unused by sliding
    /// window.
    pub refill_per_second: f64,
    /// Sliding window: the window duration. Unused by token bucket.
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl RateLimiterConfig {
    pub fn token_bucket(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            kind: RateLimiterKind::TokenBucket,
            capacity,
            refill_per_second,
            window: Duration::from_secs(1),
        }
    }

    pub fn sliding_window(max_requests: u32, window: Duration) -> Self {
        Self {
            kind: RateLimiterKind::SlidingWindow,
            capacity: max_requests,
            refill_per_second: 0.0,
            window,
        }
    }
}

enum LimiterState {
    TokenBucket { tokens: f64, last_refill: Instant },
    SlidingWindow { timestamps: VecDeque<Instant> },
}

/// A single rate limiter instance, either a token bucket or a sliding
/// window, selected by its [`RateLimiterConfig`].
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let state = match config.kind {
            RateLimiterKind::TokenBucket => LimiterState::TokenBucket {
                tokens: config.capacity as f64,
                last_refill: Instant::now(),
            },
            RateLimiterKind::SlidingWindow => LimiterState::SlidingWindow {
                timestamps: VecDeque::new(),
            },
        };
        Self { config, state: Mutex::new(state) }
    }

    /// Attempt to acquire one permit. Returns `true` if allowed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            LimiterState::TokenBucket { tokens, last_refill } => {
                let now = Instant::now();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * self.config.refill_per_second).min(self.config.capacity as f64);
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            LimiterState::SlidingWindow { timestamps } => {
                let now = Instant::now();
                while let Some(front) = timestamps.front() {
                    if now.duration_since(*front) > self.config.window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                if timestamps.len() < self.config.capacity as usize {
                    timestamps.push_back(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

struct KeyedEntry {
    limiter: RateLimiter,
    last_used: Mutex<Instant>,
}

/// Per-key rate limiters, created lazily on first use and pruned when
/// idle past a TTL — the same idea as `DistributedCircuitBreaker`'s
/// local cache, applied to an unbounded key space instead of a single
/// breaker.
pub struct KeyedRateLimiter {
    config: RateLimiterConfig,
    limiters: DashMap<String, KeyedEntry>,
}

impl KeyedRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self { config, limiters: DashMap::new() }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let entry = self.limiters.entry(key.to_string()).or_insert_with(|| KeyedEntry {
            limiter: RateLimiter::new(self.config.clone()),
            last_used: Mutex::new(Instant::now()),
        });
        *entry.last_used.lock() = Instant::now();
        entry.limiter.try_acquire()
    }

    /// Remove entries whose key hasn't been used within `ttl`. Intended
    /// to be called periodically by whichever executor owns this
    /// limiter, the way a worker pool reclaims stale tasks.
    pub fn cleanup_stale(&self, ttl: Duration) {
        let now = Instant::now();
        self.limiters.retain(|_, entry| now.duration_since(*entry.last_used.lock()) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
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

    #[test]
    fn token_bucket_allows_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(RateLimiterConfig::token_bucket(3, 0.0));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let limiter = RateLimiter::new(RateLimiterConfig::token_bucket(1, 1000.0));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn sliding_window_allows_up_to_capacity_within_window() {
        let limiter = RateLimiter::new(RateLimiterConfig::sliding_window(2, Duration::from_millis(50)));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn sliding_window_resets_after_window_elapses() {
        let limiter = RateLimiter::new(RateLimiterConfig::sliding_window(1, Duration::from_millis(20)));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn keyed_limiter_tracks_independent_buckets() {
        let keyed = KeyedRateLimiter::new(RateLimiterConfig::token_bucket(1, 0.0));
        assert!(keyed.try_acquire("a"));
        assert!(!keyed.try_acquire("a"));
        assert!(keyed.try_acquire("b"));
    }

    #[test]
    fn keyed_limiter_cleanup_removes_stale_entries() {
        let keyed = KeyedRateLimiter::new(RateLimiterConfig::token_bucket(1, 0.0));
        keyed.try_acquire("a");
        assert_eq!(keyed.len(), 1);
        std::thread::sleep(Duration::from_millis(20));
        keyed.cleanup_stale(Duration::from_millis(5));
        assert!(keyed.is_empty());
    }
}
