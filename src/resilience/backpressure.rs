//! Load-aware admission control for `LocalExecutor`'s worker pool
//! (SPEC_FULL.md §B.3 "backpressure watermarks").
//!
//! Grounded on `worker/backpressure.rs::BackpressureState`: the
//! watermark/hysteresis logic carries over unchanged (it was already
//! domain-agnostic — an atomic load counter against a ratio), adapted
//! here to gate run submission into `LocalExecutor` instead of activity
//! claims off a poller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop accepting new runs once `current_load / max_concurrent`
    /// reaches this ratio.
    pub high_watermark: f64,
    /// Resume accepting once the ratio drops to this ratio or below.
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { high_watermark: 0.9, low_watermark: 0.7 }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.low_watermark >= self.high_watermark {
            return Err("low_watermark must be less than high_watermark".to_string());
        }
        Ok(())
    }
}

/// Tracks in-flight run count for one executor and decides, with
/// hysteresis, whether it should keep accepting new work.
pub struct BackpressureGate {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    max_concurrent: usize,
    accepting: AtomicBool,
}

impl BackpressureGate {
    pub fn new(config: BackpressureConfig, max_concurrent: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            max_concurrent,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn should_accept(&self) -> bool {
        let accepting = self.accepting.load(Ordering::Relaxed);
        let ratio = self.load_ratio();

        if accepting {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                return false;
            }
            true
        } else if ratio <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_load.load(Ordering::Relaxed) as f64 / self.max_concurrent.max(1) as f64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.current_load())
    }

    pub fn run_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_completed(&self) {
        self.current_load.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_watermarks() {
        let config = BackpressureConfig::default();
        assert_eq!(config.high_watermark, 0.9);
        assert_eq!(config.low_watermark, 0.7);
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let config = BackpressureConfig::new().with_high_watermark(0.5).with_low_watermark(0.8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn stops_accepting_at_high_watermark() {
        let config = BackpressureConfig::new().with_high_watermark(0.8).with_low_watermark(0.5);
        let gate = BackpressureGate::new(config, 10);
        for _ in 0..8 {
            gate.run_started();
        }
        assert!(!gate.should_accept());
    }

    #[test]
    fn hysteresis_requires_dropping_to_low_watermark() {
        let config = BackpressureConfig::new().with_high_watermark(0.8).with_low_watermark(0.5);
        let gate = BackpressureGate::new(config, 10);
        for _ in 0..8 {
            gate.run_started();
        }
        assert!(!gate.should_accept());

        gate.run_completed();
        assert!(!gate.should_accept(), "70% load is still above the low watermark");

        for _ in 0..2 {
            gate.run_completed();
        }
        assert!(gate.should_accept());
    }

    #[test]
    fn available_slots_tracks_load() {
        let gate = BackpressureGate::new(BackpressureConfig::default(), 10);
        assert_eq!(gate.available_slots(), 10);
        gate.run_started();
        gate.run_started();
        assert_eq!(gate.available_slots(), 8);
    }
}
