//! Backpressure: system-pressure scoring and load shedding.

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{EventBus, FabricEvent};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One observation of process-wide load.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemSample {
    /// Used heap over budget, 0..1.
    pub memory_fraction: f64,
    /// Scheduler lag in milliseconds.
    pub event_loop_lag_ms: f64,
    pub pending_tasks: usize,
    /// Failed over total requests, 0..1.
    pub error_rate: f64,
    pub cache_hit_rate: f64,
}

impl SystemSample {
    /// Scheduler lag doubles as a CPU saturation proxy.
    pub fn cpu_proxy(&self) -> f64 {
        (self.event_loop_lag_ms / 100.0).min(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PressureLevel {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SheddingStrategy {
    /// Reject every request while shedding.
    RejectNew,
    /// Reject only low-priority requests.
    ShedLowPriority,
    /// Reject half of the non-high requests at random.
    Proportional,
    /// Accept but ask the caller to delay.
    Delay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackpressureThresholds {
    pub high_memory: f64,
    pub critical_memory: f64,
    pub high_lag_ms: f64,
    pub critical_lag_ms: f64,
    pub high_pending: usize,
    pub critical_pending: usize,
    pub high_error_rate: f64,
    pub critical_error_rate: f64,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self {
            high_memory: 0.75,
            critical_memory: 0.90,
            high_lag_ms: 70.0,
            critical_lag_ms: 200.0,
            high_pending: 100,
            critical_pending: 500,
            high_error_rate: 0.05,
            critical_error_rate: 0.20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub thresholds: BackpressureThresholds,
    pub strategy: SheddingStrategy,
    pub sample_interval: Duration,
    /// Rate multiplier handed out while HIGH.
    pub high_pressure_factor: f64,
    /// Rate multiplier handed out while CRITICAL.
    pub critical_pressure_factor: f64,
    /// Seed for the shedding/delay RNG; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            thresholds: BackpressureThresholds::default(),
            strategy: SheddingStrategy::ShedLowPriority,
            sample_interval: Duration::from_secs(5),
            high_pressure_factor: 0.5,
            critical_pressure_factor: 0.2,
            seed: None,
        }
    }
}

/// Verdict for one admission question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub accept: bool,
    /// For the DELAY strategy: how long the caller should hold off.
    pub delay: Option<Duration>,
}

impl AdmissionDecision {
    fn accepted() -> Self {
        Self { accept: true, delay: None }
    }

    fn rejected() -> Self {
        Self { accept: false, delay: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureStatus {
    pub level: PressureLevel,
    pub score: f64,
    pub shedding: bool,
    pub sample: SystemSample,
    pub last_change_millis: u64,
}

struct PressureState {
    level: PressureLevel,
    score: f64,
    shedding: bool,
    sample: SystemSample,
    last_change_millis: u64,
}

/// Provider of [`SystemSample`]s for the background sampler.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self) -> SystemSample;
}

/// A source embedders push into; the sampler reads the latest value.
#[derive(Debug, Default)]
pub struct SharedSample {
    current: Mutex<SystemSample>,
}

impl SharedSample {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, sample: SystemSample) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = sample;
    }
}

#[async_trait]
impl MetricsSource for SharedSample {
    async fn sample(&self) -> SystemSample {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Samples system load and decides who gets in.
pub struct BackpressureManager {
    config: BackpressureConfig,
    state: Mutex<PressureState>,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackpressureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureManager").field("level", &self.level()).finish()
    }
}

impl BackpressureManager {
    pub fn new(bus: EventBus, config: BackpressureConfig) -> Self {
        Self::with_clock(bus, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(bus: EventBus, config: BackpressureConfig, clock: Arc<dyn Clock>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            state: Mutex::new(PressureState {
                level: PressureLevel::Low,
                score: 0.0,
                shedding: false,
                sample: SystemSample::default(),
                last_change_millis: 0,
            }),
            rng: Mutex::new(rng),
            clock,
            bus,
            sampler: Mutex::new(None),
        }
    }

    /// Spawn the periodic sampler; replaces any prior sampler task. The task
    /// holds only a weak handle, so dropping the manager stops it.
    pub fn start_sampler(self: &Arc<Self>, source: Arc<dyn MetricsSource>) {
        self.stop_sampler();
        let weak = Arc::downgrade(self);
        let interval = self.config.sample_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(manager) => {
                        let sample = source.sample().await;
                        manager.update_sample(sample);
                    }
                    None => break,
                }
            }
        });
        *self.sampler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    fn stop_sampler(&self) {
        if let Some(handle) = self.sampler.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    fn classify(&self, sample: &SystemSample, score: f64) -> PressureLevel {
        let t = &self.config.thresholds;
        if sample.memory_fraction >= t.critical_memory
            || sample.event_loop_lag_ms >= t.critical_lag_ms
            || sample.pending_tasks >= t.critical_pending
            || sample.error_rate >= t.critical_error_rate
        {
            PressureLevel::Critical
        } else if sample.memory_fraction >= t.high_memory
            || sample.event_loop_lag_ms >= t.high_lag_ms
            || sample.pending_tasks >= t.high_pending
            || sample.error_rate >= t.high_error_rate
        {
            PressureLevel::High
        } else if score > 30.0 {
            PressureLevel::Normal
        } else {
            PressureLevel::Low
        }
    }

    /// Weighted pressure score in [0, 100].
    pub fn score(&self, sample: &SystemSample) -> f64 {
        let t = &self.config.thresholds;
        30.0 * sample.memory_fraction.clamp(0.0, 1.0)
            + 30.0 * (sample.event_loop_lag_ms / t.critical_lag_ms).clamp(0.0, 1.0)
            + 20.0 * (sample.pending_tasks as f64 / t.critical_pending as f64).clamp(0.0, 1.0)
            + 20.0 * (sample.error_rate / t.critical_error_rate).clamp(0.0, 1.0)
    }

    /// Feed a fresh sample; recomputes level and shedding, emitting
    /// `pressure_change` when the level moves.
    pub fn update_sample(&self, sample: SystemSample) -> PressureStatus {
        let score = self.score(&sample);
        let level = self.classify(&sample, score);
        let shedding = level == PressureLevel::Critical
            || (level == PressureLevel::High
                && sample.pending_tasks > self.config.thresholds.high_pending);

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let previous = state.level;
        state.score = score;
        state.sample = sample;
        state.shedding = shedding;
        if previous != level {
            state.level = level;
            state.last_change_millis = self.clock.now_millis();
            tracing::info!(?previous, ?level, score, "system pressure changed");
            self.bus.emit(FabricEvent::PressureChange { from: previous, to: level, score });
        }
        PressureStatus {
            level: state.level,
            score: state.score,
            shedding: state.shedding,
            sample: state.sample,
            last_change_millis: state.last_change_millis,
        }
    }

    pub fn level(&self) -> PressureLevel {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).level
    }

    pub fn is_shedding(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).shedding
    }

    pub fn status(&self) -> PressureStatus {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        PressureStatus {
            level: state.level,
            score: state.score,
            shedding: state.shedding,
            sample: state.sample,
            last_change_millis: state.last_change_millis,
        }
    }

    /// Decide whether a request of `priority` gets in right now.
    pub fn should_accept(&self, priority: Priority) -> AdmissionDecision {
        let (level, shedding) = {
            let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            (state.level, state.shedding)
        };
        if !shedding {
            return AdmissionDecision::accepted();
        }
        match self.config.strategy {
            SheddingStrategy::RejectNew => AdmissionDecision::rejected(),
            SheddingStrategy::ShedLowPriority => {
                if priority == Priority::Low {
                    AdmissionDecision::rejected()
                } else {
                    AdmissionDecision::accepted()
                }
            }
            SheddingStrategy::Proportional => {
                if priority == Priority::High {
                    AdmissionDecision::accepted()
                } else if self.rng.lock().unwrap_or_else(|p| p.into_inner()).random_bool(0.5) {
                    AdmissionDecision::rejected()
                } else {
                    AdmissionDecision::accepted()
                }
            }
            SheddingStrategy::Delay => {
                let range_ms = match level {
                    PressureLevel::Critical => 500..=1_000,
                    _ => 100..=300,
                };
                let millis =
                    self.rng.lock().unwrap_or_else(|p| p.into_inner()).random_range(range_ms);
                AdmissionDecision { accept: true, delay: Some(Duration::from_millis(millis)) }
            }
        }
    }

    /// Multiplier external rate limits should apply under pressure.
    pub fn rate_limit_factor(&self) -> f64 {
        match self.level() {
            PressureLevel::High => self.config.high_pressure_factor,
            PressureLevel::Critical => self.config.critical_pressure_factor,
            _ => 1.0,
        }
    }

    pub fn destroy(&self) {
        self.stop_sampler();
    }
}

impl Drop for BackpressureManager {
    fn drop(&mut self) {
        self.stop_sampler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{EventKind, MemorySink};

    fn critical_sample() -> SystemSample {
        SystemSample {
            memory_fraction: 0.95,
            event_loop_lag_ms: 300.0,
            pending_tasks: 600,
            error_rate: 0.5,
            cache_hit_rate: 0.2,
        }
    }

    fn manager(strategy: SheddingStrategy) -> (Arc<BackpressureManager>, MemorySink, EventBus) {
        let bus = EventBus::new();
        let sink = MemorySink::new();
        bus.attach_sink(sink.clone());
        let manager = Arc::new(BackpressureManager::new(
            bus.clone(),
            BackpressureConfig { strategy, seed: Some(7), ..Default::default() },
        ));
        (manager, sink, bus)
    }

    #[tokio::test]
    async fn score_is_weighted_sum() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::RejectNew);
        let sample = SystemSample {
            memory_fraction: 1.0,
            event_loop_lag_ms: 200.0,
            pending_tasks: 500,
            error_rate: 0.2,
            cache_hit_rate: 1.0,
        };
        assert!((manager.score(&sample) - 100.0).abs() < 1e-9);

        let half = SystemSample {
            memory_fraction: 0.5,
            event_loop_lag_ms: 100.0,
            pending_tasks: 250,
            error_rate: 0.1,
            cache_hit_rate: 1.0,
        };
        assert!((manager.score(&half) - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn any_critical_metric_forces_critical_level() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::RejectNew);
        let status = manager.update_sample(SystemSample {
            memory_fraction: 0.95, // critical on its own
            ..Default::default()
        });
        assert_eq!(status.level, PressureLevel::Critical);
        assert!(status.shedding);
    }

    #[tokio::test]
    async fn high_level_sheds_only_with_pending_backlog() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::RejectNew);

        let status = manager.update_sample(SystemSample {
            memory_fraction: 0.8, // high, but pending below the bar
            pending_tasks: 10,
            ..Default::default()
        });
        assert_eq!(status.level, PressureLevel::High);
        assert!(!status.shedding);

        let status = manager.update_sample(SystemSample {
            memory_fraction: 0.8,
            pending_tasks: 150,
            ..Default::default()
        });
        assert_eq!(status.level, PressureLevel::High);
        assert!(status.shedding);
    }

    #[tokio::test]
    async fn quiet_system_is_low() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::RejectNew);
        let status = manager.update_sample(SystemSample::default());
        assert_eq!(status.level, PressureLevel::Low);
        assert!(!status.shedding);
        assert!((manager.rate_limit_factor() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn shed_low_priority_passes_high() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::ShedLowPriority);
        manager.update_sample(critical_sample());

        assert!(!manager.should_accept(Priority::Low).accept);
        assert!(manager.should_accept(Priority::Normal).accept);
        assert!(manager.should_accept(Priority::High).accept);
        assert!((manager.rate_limit_factor() - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reject_new_rejects_everyone() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::RejectNew);
        manager.update_sample(critical_sample());
        assert!(!manager.should_accept(Priority::High).accept);
        assert!(!manager.should_accept(Priority::Low).accept);
    }

    #[tokio::test]
    async fn proportional_sheds_roughly_half_of_non_high() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::Proportional);
        manager.update_sample(critical_sample());

        let rejected = (0..1_000)
            .filter(|_| !manager.should_accept(Priority::Normal).accept)
            .count();
        assert!(rejected > 350 && rejected < 650, "rejected {} of 1000", rejected);

        // High priority always passes.
        assert!((0..100).all(|_| manager.should_accept(Priority::High).accept));
    }

    #[tokio::test]
    async fn delay_strategy_returns_level_scaled_delays() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::Delay);
        manager.update_sample(critical_sample());
        for _ in 0..50 {
            let decision = manager.should_accept(Priority::Normal);
            assert!(decision.accept);
            let delay = decision.delay.unwrap();
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1_000));
        }

        // HIGH band: 100-300ms.
        manager.update_sample(SystemSample {
            memory_fraction: 0.8,
            pending_tasks: 150,
            ..Default::default()
        });
        for _ in 0..50 {
            let delay = manager.should_accept(Priority::Normal).delay.unwrap();
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn pressure_change_events_fire_once_per_transition() {
        let (manager, sink, bus) = manager(SheddingStrategy::RejectNew);
        manager.update_sample(critical_sample());
        manager.update_sample(critical_sample()); // same level, no event
        manager.update_sample(SystemSample::default());
        bus.flush().await;

        let changes =
            sink.events().iter().filter(|e| e.kind() == EventKind::PressureChange).count();
        assert_eq!(changes, 2);
    }

    #[tokio::test]
    async fn sampler_pulls_from_source() {
        let (manager, _sink, _bus) = manager(SheddingStrategy::RejectNew);
        let source = SharedSample::new();
        source.set(critical_sample());

        let quick = Arc::new(BackpressureManager::new(
            EventBus::new(),
            BackpressureConfig {
                sample_interval: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        quick.start_sampler(source.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(quick.level(), PressureLevel::Critical);
        quick.destroy();
        drop(manager);
    }
}
