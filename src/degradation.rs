//! Graceful degradation: a per-service level ladder with fallback chains.
//!
//! Execution starts at the current level and walks down the chain until a
//! handler answers; every attempt runs under its own timeout. Consecutive
//! failures sink the level one step, consecutive successes raise it one step,
//! never skipping.

use crate::error::FabricError;
use crate::registry::HealthState;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Operating level, best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DegradationLevel {
    Full,
    Partial,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    /// Coarse health projection of this level.
    pub fn health(&self) -> HealthState {
        match self {
            DegradationLevel::Full => HealthState::Healthy,
            DegradationLevel::Partial => HealthState::Degraded,
            DegradationLevel::Minimal => HealthState::Unhealthy,
            DegradationLevel::Emergency => HealthState::Offline,
        }
    }

    fn degrade(&self) -> Self {
        match self {
            DegradationLevel::Full => DegradationLevel::Partial,
            DegradationLevel::Partial => DegradationLevel::Minimal,
            _ => DegradationLevel::Emergency,
        }
    }

    fn recover(&self) -> Self {
        match self {
            DegradationLevel::Emergency => DegradationLevel::Minimal,
            DegradationLevel::Minimal => DegradationLevel::Partial,
            _ => DegradationLevel::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationConfig {
    /// Consecutive failures that sink the level one step.
    pub failure_threshold: u32,
    /// Consecutive successes that raise it one step.
    pub success_threshold: u32,
    /// Deadline applied to each handler attempt.
    pub attempt_timeout: Duration,
    /// Rolling window of outcomes backing the availability figure.
    pub availability_window: usize,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            attempt_timeout: Duration::from_secs(2),
            availability_window: 100,
        }
    }
}

type Handler<T, E> = Box<dyn FnMut() -> BoxFuture<'static, Result<T, E>> + Send>;

/// Handlers for one call, keyed by the level they serve.
pub struct FallbackChain<T, E> {
    handlers: Vec<(DegradationLevel, Handler<T, E>)>,
}

impl<T, E> FallbackChain<T, E> {
    /// Start a chain with the primary (FULL) handler.
    pub fn new<F, Fut>(primary: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut chain = Self { handlers: Vec::new() };
        chain.push(DegradationLevel::Full, primary);
        chain
    }

    pub fn partial<F, Fut>(mut self, handler: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.push(DegradationLevel::Partial, handler);
        self
    }

    pub fn minimal<F, Fut>(mut self, handler: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.push(DegradationLevel::Minimal, handler);
        self
    }

    /// Static or cached response of last resort.
    pub fn emergency<F, Fut>(mut self, handler: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.push(DegradationLevel::Emergency, handler);
        self
    }

    fn push<F, Fut>(&mut self, level: DegradationLevel, mut handler: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.handlers.push((level, Box::new(move || Box::pin(handler()))));
        self.handlers.sort_by_key(|(level, _)| *level);
    }
}

/// A successful execution and the level that served it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Served<T> {
    pub value: T,
    pub level: DegradationLevel,
}

struct ControllerState {
    level: DegradationLevel,
    consecutive_failures: u32,
    consecutive_successes: u32,
    health_override: Option<HealthState>,
    outcomes: VecDeque<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationStatus {
    pub service: String,
    pub level: DegradationLevel,
    pub health: HealthState,
    pub availability: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Per-service degradation state machine.
pub struct DegradationController {
    service: String,
    config: DegradationConfig,
    state: Mutex<ControllerState>,
}

impl std::fmt::Debug for DegradationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationController")
            .field("service", &self.service)
            .field("level", &self.level())
            .finish()
    }
}

impl DegradationController {
    pub fn new(service: impl Into<String>, config: DegradationConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(ControllerState {
                level: DegradationLevel::Full,
                consecutive_failures: 0,
                consecutive_successes: 0,
                health_override: None,
                outcomes: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn level(&self) -> DegradationLevel {
        self.lock().level
    }

    /// Projected health; an explicit override wins.
    pub fn health(&self) -> HealthState {
        let state = self.lock();
        state.health_override.unwrap_or_else(|| state.level.health())
    }

    pub fn set_health_override(&self, health: Option<HealthState>) {
        self.lock().health_override = health;
    }

    /// Force a level (testing and operator intervention).
    pub fn set_level(&self, level: DegradationLevel) {
        let mut state = self.lock();
        state.level = level;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
    }

    /// Fraction of recent executions that succeeded at their serving level.
    pub fn availability(&self) -> f64 {
        let state = self.lock();
        if state.outcomes.is_empty() {
            1.0
        } else {
            state.outcomes.iter().filter(|ok| **ok).count() as f64 / state.outcomes.len() as f64
        }
    }

    pub fn status(&self) -> DegradationStatus {
        let state = self.lock();
        DegradationStatus {
            service: self.service.clone(),
            level: state.level,
            health: state.health_override.unwrap_or_else(|| state.level.health()),
            availability: if state.outcomes.is_empty() {
                1.0
            } else {
                state.outcomes.iter().filter(|ok| **ok).count() as f64
                    / state.outcomes.len() as f64
            },
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
        }
    }

    /// Run the chain starting at the current level. The outcome of the
    /// handler at the current level (not of deeper fallbacks) drives the
    /// level machine.
    pub async fn execute<T, E>(
        &self,
        mut chain: FallbackChain<T, E>,
    ) -> Result<Served<T>, FabricError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let start_level = self.level();
        let mut last_error: Option<FabricError<E>> = None;
        let mut attempted_any = false;

        for (level, handler) in chain.handlers.iter_mut() {
            if *level < start_level {
                continue;
            }
            attempted_any = true;
            let attempt = tokio::time::timeout(self.config.attempt_timeout, handler());
            match attempt.await {
                Ok(Ok(value)) => {
                    // Only the outcome at the starting level drives the
                    // machine; a fallback answer still counts the level as
                    // failing.
                    self.record(*level == start_level);
                    return Ok(Served { value, level: *level });
                }
                Ok(Err(err)) => {
                    last_error = Some(FabricError::Inner(err));
                }
                Err(_) => {
                    last_error = Some(FabricError::Timeout {
                        elapsed: self.config.attempt_timeout,
                        timeout: self.config.attempt_timeout,
                    });
                }
            }
        }

        if attempted_any {
            self.record(false);
        }
        Err(last_error.unwrap_or(FabricError::Shutdown))
    }

    /// Feed an outcome into the level machine.
    fn record(&self, success: bool) {
        let mut state = self.lock();
        if state.outcomes.len() >= self.config.availability_window.max(1) {
            state.outcomes.pop_front();
        }
        state.outcomes.push_back(success);

        if success {
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            if state.consecutive_successes >= self.config.success_threshold {
                let recovered = state.level.recover();
                if recovered != state.level {
                    tracing::info!(
                        service = %self.service,
                        from = ?state.level,
                        to = ?recovered,
                        "degradation level recovered one step"
                    );
                    state.level = recovered;
                }
                state.consecutive_successes = 0;
            }
        } else {
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            if state.consecutive_failures >= self.config.failure_threshold {
                let degraded = state.level.degrade();
                if degraded != state.level {
                    tracing::warn!(
                        service = %self.service,
                        from = ?state.level,
                        to = ?degraded,
                        "degradation level sank one step"
                    );
                    state.level = degraded;
                }
                state.consecutive_failures = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn controller(failure_threshold: u32, success_threshold: u32) -> DegradationController {
        DegradationController::new(
            "search",
            DegradationConfig {
                failure_threshold,
                success_threshold,
                attempt_timeout: Duration::from_millis(50),
                availability_window: 10,
            },
        )
    }

    fn failing_primary_chain() -> FallbackChain<&'static str, TestError> {
        FallbackChain::new(|| async { Err(TestError("primary down")) })
            .partial(|| async { Ok("partial") })
            .emergency(|| async { Ok("cached") })
    }

    #[tokio::test]
    async fn serves_primary_at_full() {
        let controller = controller(3, 3);
        let chain: FallbackChain<&str, TestError> =
            FallbackChain::new(|| async { Ok("primary") }).partial(|| async { Ok("partial") });
        let served = controller.execute(chain).await.unwrap();
        assert_eq!(served.value, "primary");
        assert_eq!(served.level, DegradationLevel::Full);
    }

    #[tokio::test]
    async fn falls_through_to_partial_when_primary_fails() {
        let controller = controller(3, 3);
        let served = controller.execute(failing_primary_chain()).await.unwrap();
        assert_eq!(served.value, "partial");
        assert_eq!(served.level, DegradationLevel::Partial);
    }

    #[tokio::test]
    async fn consecutive_failures_sink_one_level() {
        let controller = controller(2, 3);
        for _ in 0..2 {
            let served = controller.execute(failing_primary_chain()).await.unwrap();
            assert_eq!(served.value, "partial");
        }
        assert_eq!(controller.level(), DegradationLevel::Partial);
        assert_eq!(controller.health(), HealthState::Degraded);
    }

    #[tokio::test]
    async fn execution_starts_at_current_level() {
        let controller = controller(3, 3);
        controller.set_level(DegradationLevel::Partial);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let chain: FallbackChain<&str, TestError> = FallbackChain::new(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("primary")
            }
        })
        .partial(|| async { Ok("partial") });

        let served = controller.execute(chain).await.unwrap();
        assert_eq!(served.value, "partial");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "primary handler skipped below FULL");
    }

    #[tokio::test]
    async fn successes_recover_one_step_never_skipping() {
        let controller = controller(3, 2);
        controller.set_level(DegradationLevel::Minimal);

        let succeed = || {
            FallbackChain::<&str, TestError>::new(|| async { Ok("primary") })
                .partial(|| async { Ok("partial") })
                .minimal(|| async { Ok("minimal") })
        };

        for _ in 0..2 {
            controller.execute(succeed()).await.unwrap();
        }
        assert_eq!(controller.level(), DegradationLevel::Partial, "one step only");

        for _ in 0..2 {
            controller.execute(succeed()).await.unwrap();
        }
        assert_eq!(controller.level(), DegradationLevel::Full);
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_falls_back() {
        let controller = controller(3, 3);
        let chain: FallbackChain<&str, TestError> = FallbackChain::new(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("primary")
        })
        .partial(|| async { Ok("partial") });

        let served = controller.execute(chain).await.unwrap();
        assert_eq!(served.value, "partial");
    }

    #[tokio::test]
    async fn exhausted_chain_surfaces_last_error() {
        let controller = controller(3, 3);
        let chain: FallbackChain<&str, TestError> =
            FallbackChain::new(|| async { Err(TestError("primary")) })
                .partial(|| async { Err(TestError("partial")) });

        let err = controller.execute(chain).await.unwrap_err();
        assert_eq!(err.into_inner().unwrap().0, "partial");
    }

    #[tokio::test]
    async fn health_projection_and_override() {
        let controller = controller(3, 3);
        controller.set_level(DegradationLevel::Emergency);
        assert_eq!(controller.health(), HealthState::Offline);

        controller.set_health_override(Some(HealthState::Degraded));
        assert_eq!(controller.health(), HealthState::Degraded);

        controller.set_health_override(None);
        assert_eq!(controller.health(), HealthState::Offline);
    }

    #[tokio::test]
    async fn availability_tracks_current_level_outcomes() {
        let controller = controller(10, 10);
        controller.execute(failing_primary_chain()).await.unwrap();
        let ok_chain: FallbackChain<&str, TestError> =
            FallbackChain::new(|| async { Ok("primary") });
        controller.execute(ok_chain).await.unwrap();

        // One failure (primary failed at FULL) and one success.
        assert!((controller.availability() - 0.5).abs() < 1e-9);
    }
}
