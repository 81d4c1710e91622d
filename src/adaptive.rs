//! Live-tunable configuration handles and the adaptive rate controller.
//!
//! `Tunable<T>` gives lock-free snapshot reads with controlled updates; the
//! adaptive controller re-targets a service's token bucket from health and
//! composite load.

use crate::clock::{Clock, MonotonicClock};
use crate::registry::HealthState;
use crate::token_bucket::TokenBucket;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cheap-read, swap-on-write shared config.
#[derive(Debug)]
pub struct Tunable<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Tunable<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Tunable<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let cur = self.inner.load_full();
        self.inner.store(Arc::new(f(&cur)));
    }
}

/// Normalised system load inputs, each already in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu: f64,
    pub memory: f64,
    pub connections: f64,
    pub queue: f64,
    pub errors: f64,
    pub response_time: f64,
}

impl LoadSample {
    /// Weighted composite score in [0, 1].
    pub fn composite(&self) -> f64 {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        0.30 * clamp(self.cpu)
            + 0.20 * clamp(self.memory)
            + 0.15 * clamp(self.connections)
            + 0.15 * clamp(self.queue)
            + 0.10 * clamp(self.errors)
            + 0.10 * clamp(self.response_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadLevel {
    Low,
    Normal,
    High,
    Critical,
}

/// How much of the computed rate delta is applied per adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl ScalingStrategy {
    fn smoothing(&self) -> f64 {
        match self {
            ScalingStrategy::Conservative => 0.5,
            ScalingStrategy::Balanced => 0.75,
            ScalingStrategy::Aggressive => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub min_rate: f64,
    pub max_rate: f64,
    pub scale_up: f64,
    pub scale_down: f64,
    /// Availability at or above which a lightly loaded service scales up.
    pub scale_up_threshold: f64,
    /// Availability below which the rate scales down.
    pub scale_down_threshold: f64,
    pub load_low: f64,
    pub load_high: f64,
    pub load_critical: f64,
    pub strategy: ScalingStrategy,
    pub cooldown: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_rate: 1.0,
            max_rate: 10_000.0,
            scale_up: 1.2,
            scale_down: 0.8,
            scale_up_threshold: 0.99,
            scale_down_threshold: 0.95,
            load_low: 0.3,
            load_high: 0.7,
            load_critical: 0.9,
            strategy: ScalingStrategy::Balanced,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Inputs pushed into a reevaluation cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveInputs {
    pub health: HealthState,
    pub availability: f64,
    pub load: LoadSample,
}

/// Outcome of a rate adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveDecision {
    pub previous_rate: f64,
    pub new_rate: f64,
    pub load_level: LoadLevel,
    pub multiplier: f64,
}

/// Re-targets one token bucket from pushed health/load observations, at most
/// once per cooldown period.
pub struct AdaptiveRateLimiter {
    bucket: Arc<TokenBucket>,
    config: AdaptiveConfig,
    last_eval_millis: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter").field("service", &self.bucket.service()).finish()
    }
}

impl AdaptiveRateLimiter {
    pub fn new(bucket: Arc<TokenBucket>, config: AdaptiveConfig) -> Self {
        Self::with_clock(bucket, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        bucket: Arc<TokenBucket>,
        config: AdaptiveConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { bucket, config, last_eval_millis: AtomicU64::new(u64::MAX), clock }
    }

    pub fn classify(&self, composite: f64) -> LoadLevel {
        if composite >= self.config.load_critical {
            LoadLevel::Critical
        } else if composite >= self.config.load_high {
            LoadLevel::High
        } else if composite <= self.config.load_low {
            LoadLevel::Low
        } else {
            LoadLevel::Normal
        }
    }

    /// The rule table, applied top to bottom; first match wins.
    fn multiplier(&self, inputs: &AdaptiveInputs, level: LoadLevel) -> f64 {
        let cfg = &self.config;
        if matches!(inputs.health, HealthState::Unhealthy | HealthState::Offline) {
            cfg.scale_down * 0.5
        } else if level == LoadLevel::Critical {
            cfg.scale_down * 0.5
        } else if level == LoadLevel::High {
            cfg.scale_down * 0.8
        } else if inputs.availability >= cfg.scale_up_threshold && level == LoadLevel::Low {
            cfg.scale_up
        } else if inputs.availability < cfg.scale_down_threshold {
            cfg.scale_down
        } else {
            1.0
        }
    }

    /// Push fresh observations. Ignored while the cooldown is running; when
    /// the computed rate differs, the bucket is re-targeted with
    /// `max_tokens = 2 * rate` (waiters carried across).
    pub fn submit(&self, inputs: AdaptiveInputs) -> Option<AdaptiveDecision> {
        let now = self.clock.now_millis();
        let last = self.last_eval_millis.load(Ordering::Acquire);
        if last != u64::MAX && now.saturating_sub(last) < self.config.cooldown.as_millis() as u64 {
            return None;
        }
        self.last_eval_millis.store(now, Ordering::Release);

        let level = self.classify(inputs.load.composite());
        let multiplier = self.multiplier(&inputs, level);
        let current = self.bucket.config().tokens_per_second;
        let target = current * multiplier;
        let smoothed = current + (target - current) * self.config.strategy.smoothing();
        let new_rate = smoothed.clamp(self.config.min_rate, self.config.max_rate).floor();

        if (new_rate - current).abs() < f64::EPSILON {
            return None;
        }
        self.bucket.reconfigure(new_rate, new_rate * 2.0);
        tracing::info!(
            service = %self.bucket.service(),
            previous = current,
            new = new_rate,
            ?level,
            "adaptive rate adjusted"
        );
        Some(AdaptiveDecision { previous_rate: current, new_rate, load_level: level, multiplier })
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }
}
