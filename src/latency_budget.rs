//! Latency-budget tracking: tiered thresholds over a fixed ring of samples.

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{EventBus, FabricEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyBudgetConfig {
    /// The latency the service aims for; informational.
    pub target_ms: f64,
    pub warning_ms: f64,
    pub critical_ms: f64,
    pub breach_ms: f64,
    /// Ring size N.
    pub window_size: usize,
    /// Trailing samples examined by the trend computation.
    pub trend_samples: usize,
}

impl Default for LatencyBudgetConfig {
    fn default() -> Self {
        Self {
            target_ms: 100.0,
            warning_ms: 250.0,
            critical_ms: 500.0,
            breach_ms: 1_000.0,
            window_size: 100,
            trend_samples: 20,
        }
    }
}

/// Violation tier of the most recent sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationLevel {
    None,
    Warning,
    Critical,
    Breach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Stable,
    Degrading,
    Improving,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub direction: TrendDirection,
    pub confidence: f64,
}

/// Summary over the current ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub service: String,
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub stdev_ms: f64,
    pub violation: ViolationLevel,
    pub trend: Trend,
}

struct ServiceWindow {
    config: LatencyBudgetConfig,
    samples: VecDeque<f64>,
    violation: ViolationLevel,
    violation_since: Option<u64>,
}

impl ServiceWindow {
    fn classify(&self, value_ms: f64) -> ViolationLevel {
        if value_ms >= self.config.breach_ms {
            ViolationLevel::Breach
        } else if value_ms >= self.config.critical_ms {
            ViolationLevel::Critical
        } else if value_ms >= self.config.warning_ms {
            ViolationLevel::Warning
        } else {
            ViolationLevel::None
        }
    }

    fn stats(&self, service: &str) -> LatencyStats {
        let count = self.samples.len();
        if count == 0 {
            return LatencyStats {
                service: service.to_string(),
                count: 0,
                min_ms: 0.0,
                max_ms: 0.0,
                avg_ms: 0.0,
                p50_ms: 0.0,
                p95_ms: 0.0,
                p99_ms: 0.0,
                stdev_ms: 0.0,
                violation: self.violation,
                trend: Trend { direction: TrendDirection::Stable, confidence: 0.0 },
            };
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let sum: f64 = sorted.iter().sum();
        let avg = sum / count as f64;
        let variance =
            sorted.iter().map(|v| (v - avg) * (v - avg)).sum::<f64>() / count as f64;

        LatencyStats {
            service: service.to_string(),
            count,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            avg_ms: avg,
            p50_ms: percentile_ms(&sorted, 0.50),
            p95_ms: percentile_ms(&sorted, 0.95),
            p99_ms: percentile_ms(&sorted, 0.99),
            stdev_ms: variance.sqrt(),
            violation: self.violation,
            trend: self.trend(),
        }
    }

    /// Compare means of the first and second half of the last
    /// `trend_samples` samples.
    fn trend(&self) -> Trend {
        let take = self.config.trend_samples.min(self.samples.len());
        if take < 4 {
            return Trend { direction: TrendDirection::Stable, confidence: 0.0 };
        }
        let tail: Vec<f64> = self.samples.iter().rev().take(take).rev().copied().collect();
        let mid = tail.len() / 2;
        let first: f64 = tail[..mid].iter().sum::<f64>() / mid as f64;
        let second: f64 = tail[mid..].iter().sum::<f64>() / (tail.len() - mid) as f64;

        let reference = first.max(second).max(1e-9);
        let delta = second - first;
        if (delta.abs() / reference) < 0.05 {
            Trend { direction: TrendDirection::Stable, confidence: 0.0 }
        } else {
            let confidence = (2.0 * delta.abs() / reference).min(1.0);
            let direction =
                if delta > 0.0 { TrendDirection::Degrading } else { TrendDirection::Improving };
            Trend { direction, confidence }
        }
    }
}

/// Rank-with-ceiling percentile over a sorted slice.
fn percentile_ms(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Per-service latency rings plus violation events.
pub struct LatencyBudgetTracker {
    windows: Mutex<HashMap<String, ServiceWindow>>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
}

impl std::fmt::Debug for LatencyBudgetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyBudgetTracker").finish()
    }
}

impl LatencyBudgetTracker {
    pub fn new(bus: EventBus) -> Self {
        Self::with_clock(bus, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self { windows: Mutex::new(HashMap::new()), clock, bus }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServiceWindow>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, service: &str, config: LatencyBudgetConfig) {
        self.lock().insert(
            service.to_string(),
            ServiceWindow {
                config,
                samples: VecDeque::new(),
                violation: ViolationLevel::None,
                violation_since: None,
            },
        );
    }

    pub fn unregister(&self, service: &str) {
        self.lock().remove(service);
    }

    pub fn contains(&self, service: &str) -> bool {
        self.lock().contains_key(service)
    }

    /// Record one latency sample; recording is serialised per service so a
    /// following `stats` call sees it.
    pub fn record(&self, service: &str, latency: Duration) -> Option<LatencyStats> {
        let value_ms = latency.as_secs_f64() * 1_000.0;
        let now = self.clock.now_millis();
        let mut windows = self.lock();
        let window = windows.get_mut(service)?;

        if window.samples.len() >= window.config.window_size.max(1) {
            window.samples.pop_front();
        }
        window.samples.push_back(value_ms);

        let level = window.classify(value_ms);
        let previous = window.violation;
        window.violation = level;

        if previous == ViolationLevel::None && level > ViolationLevel::None {
            window.violation_since.get_or_insert(now);
            tracing::warn!(service, value_ms, ?level, "latency violation");
            self.bus.emit(FabricEvent::LatencyViolation {
                service: service.to_string(),
                level,
                value_ms,
            });
        } else if previous > ViolationLevel::None && level == ViolationLevel::None {
            let since = window.violation_since.take().unwrap_or(now);
            let time_in_violation = Duration::from_millis(now.saturating_sub(since));
            tracing::info!(service, ?time_in_violation, "latency recovered");
            self.bus.emit(FabricEvent::LatencyRecovery {
                service: service.to_string(),
                time_in_violation,
            });
        }

        Some(window.stats(service))
    }

    pub fn stats(&self, service: &str) -> Option<LatencyStats> {
        self.lock().get(service).map(|w| w.stats(service))
    }

    /// Stats for every tracked service, sorted by name.
    pub fn all_stats(&self) -> Vec<LatencyStats> {
        let windows = self.lock();
        let mut out: Vec<LatencyStats> =
            windows.iter().map(|(name, w)| w.stats(name)).collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    pub fn destroy(&self) {
        self.lock().clear();
    }
}
