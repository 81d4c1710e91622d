//! Resilience policy: pattern composition for one service.
//!
//! The chain has a fixed outer-to-inner order, BULKHEAD -> CIRCUIT_BREAKER ->
//! RETRY -> TIMEOUT -> operation, with FALLBACK wrapping the whole chain.
//! Disabled patterns are pass-throughs.

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::clock::{Clock, MonotonicClock};
use crate::error::FabricError;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::timeout::TimeoutPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Ring size for latency percentiles.
const LATENCY_RING: usize = 1_000;

/// Plain-data policy settings; `None` disables a pattern.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: Option<RetryConfig>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pattern {
    Bulkhead,
    CircuitBreaker,
    Retry,
    Timeout,
    Fallback,
}

impl Pattern {
    fn label(&self) -> &'static str {
        match self {
            Pattern::Bulkhead => "bulkhead",
            Pattern::CircuitBreaker => "circuit_breaker",
            Pattern::Retry => "retry",
            Pattern::Timeout => "timeout",
            Pattern::Fallback => "fallback",
        }
    }
}

#[derive(Default)]
struct PatternStats {
    activations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternSnapshot {
    pub activations: u64,
    pub successes: u64,
    pub failures: u64,
}

struct MetricsInner {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    timeouts: AtomicU64,
    fallbacks: AtomicU64,
    retries: AtomicU64,
    bulkhead: PatternStats,
    circuit_breaker: PatternStats,
    retry: PatternStats,
    timeout: PatternStats,
    fallback: PatternStats,
    latencies_micros: Mutex<Vec<u64>>,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            bulkhead: PatternStats::default(),
            circuit_breaker: PatternStats::default(),
            retry: PatternStats::default(),
            timeout: PatternStats::default(),
            fallback: PatternStats::default(),
            latencies_micros: Mutex::new(Vec::with_capacity(LATENCY_RING)),
        }
    }

    fn stats(&self, pattern: Pattern) -> &PatternStats {
        match pattern {
            Pattern::Bulkhead => &self.bulkhead,
            Pattern::CircuitBreaker => &self.circuit_breaker,
            Pattern::Retry => &self.retry,
            Pattern::Timeout => &self.timeout,
            Pattern::Fallback => &self.fallback,
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut ring = self.latencies_micros.lock().unwrap_or_else(|p| p.into_inner());
        if ring.len() >= LATENCY_RING {
            ring.remove(0);
        }
        ring.push(elapsed.as_micros() as u64);
    }
}

/// Aggregated policy counters plus latency percentiles over the last
/// `LATENCY_RING` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetrics {
    pub service: String,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub retries: u64,
    pub patterns: BTreeMap<String, PatternSnapshot>,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub circuit: Option<CircuitSnapshot>,
}

/// Rank-with-ceiling percentile over an unsorted sample set.
pub(crate) fn percentile(sorted: &[u64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1] as f64 / 1_000.0
}

/// Per-service composition of resilience patterns.
pub struct ResiliencePolicy<E> {
    service: String,
    bulkhead: Option<Arc<Bulkhead>>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<RetryPolicy<E>>,
    timeout: Option<TimeoutPolicy>,
    metrics: Arc<MetricsInner>,
}

impl<E> std::fmt::Debug for ResiliencePolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePolicy").field("service", &self.service).finish()
    }
}

impl<E> ResiliencePolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder(service: impl Into<String>) -> ResiliencePolicyBuilder<E> {
        ResiliencePolicyBuilder::new(service)
    }

    /// Assemble from plain config; the bulkhead is shared with the caller so
    /// its occupancy is visible outside the policy.
    pub fn from_config(
        service: &str,
        config: &PolicyConfig,
        bulkhead: Option<Arc<Bulkhead>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, crate::config::ConfigError> {
        let mut builder = Self::builder(service).with_clock(clock);
        if let Some(bulkhead) = bulkhead {
            builder = builder.bulkhead(bulkhead);
        }
        if let Some(cb) = &config.circuit_breaker {
            builder = builder.circuit_breaker(cb.clone());
        }
        if let Some(retry) = &config.retry {
            builder = builder.retry_config(retry);
        }
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout)?;
        }
        Ok(builder.build())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Arc<Bulkhead>> {
        self.bulkhead.as_ref()
    }

    /// Run the full chain.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.run(operation, true).await
    }

    /// Run the chain without the bulkhead stage (admission already decided).
    pub async fn execute_unisolated<T, Fut, Op>(&self, operation: Op) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.run(operation, false).await
    }

    /// Run the chain; on any terminal error invoke `fallback`. A failing
    /// fallback supersedes the original error.
    pub async fn execute_with_fallback<T, Fut, Op, FbFut, Fb>(
        &self,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        FbFut: Future<Output = Result<T, E>> + Send,
        Fb: FnOnce(&FabricError<E>) -> FbFut + Send,
    {
        match self.run(operation, true).await {
            Ok(value) => Ok(value),
            Err(error) => {
                self.metrics.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.metrics.stats(Pattern::Fallback).activations.fetch_add(1, Ordering::Relaxed);
                match fallback(&error).await {
                    Ok(value) => {
                        self.metrics
                            .stats(Pattern::Fallback)
                            .successes
                            .fetch_add(1, Ordering::Relaxed);
                        Ok(value)
                    }
                    Err(fallback_error) => {
                        self.metrics
                            .stats(Pattern::Fallback)
                            .failures
                            .fetch_add(1, Ordering::Relaxed);
                        Err(FabricError::FallbackFailed {
                            original: Box::new(error),
                            error: fallback_error,
                        })
                    }
                }
            }
        }
    }

    async fn run<T, Fut, Op>(&self, operation: Op, isolate: bool) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.metrics.total.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let attempts = Arc::new(AtomicU64::new(0));
        let result = self.run_chain(operation, isolate, attempts.clone()).await;
        self.metrics.record_latency(start.elapsed());

        let attempts = attempts.load(Ordering::Relaxed);
        if attempts > 1 {
            self.metrics.retries.fetch_add(attempts - 1, Ordering::Relaxed);
            let retry_stats = self.metrics.stats(Pattern::Retry);
            retry_stats.activations.fetch_add(attempts - 1, Ordering::Relaxed);
        }

        let outcome_ok = result.is_ok();
        if outcome_ok {
            self.metrics.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.failure.fetch_add(1, Ordering::Relaxed);
        }
        for (enabled, pattern) in [
            (isolate && self.bulkhead.is_some(), Pattern::Bulkhead),
            (self.circuit_breaker.is_some(), Pattern::CircuitBreaker),
            (self.timeout.is_some(), Pattern::Timeout),
        ] {
            if enabled {
                let stats = self.metrics.stats(pattern);
                stats.activations.fetch_add(1, Ordering::Relaxed);
                if outcome_ok {
                    stats.successes.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        result
    }

    async fn run_chain<T, Fut, Op>(
        &self,
        operation: Op,
        isolate: bool,
        attempts: Arc<AtomicU64>,
    ) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op_cell = Arc::new(Mutex::new(operation));
        let timeout = self.timeout;
        let metrics = self.metrics.clone();

        // RETRY -> TIMEOUT -> op
        let retried = {
            let op_cell = op_cell.clone();
            async move {
                match &self.retry {
                    Some(retry) => {
                        retry
                            .execute(move || {
                                attempt(op_cell.clone(), timeout, metrics.clone(), attempts.clone())
                            })
                            .await
                    }
                    None => attempt(op_cell, timeout, metrics, attempts).await,
                }
            }
        };

        // CIRCUIT_BREAKER -> ...
        let protected = async move {
            match &self.circuit_breaker {
                Some(breaker) => breaker.execute(move || retried).await,
                None => retried.await,
            }
        };

        // BULKHEAD -> ...
        match (&self.bulkhead, isolate) {
            (Some(bulkhead), true) => bulkhead.execute(move || protected).await,
            _ => protected.await,
        }
    }

    pub fn metrics(&self) -> PolicyMetrics {
        let inner = &self.metrics;
        let mut sorted = inner.latencies_micros.lock().unwrap_or_else(|p| p.into_inner()).clone();
        sorted.sort_unstable();

        let mut patterns = BTreeMap::new();
        for pattern in [
            Pattern::Bulkhead,
            Pattern::CircuitBreaker,
            Pattern::Retry,
            Pattern::Timeout,
            Pattern::Fallback,
        ] {
            let stats = inner.stats(pattern);
            patterns.insert(
                pattern.label().to_string(),
                PatternSnapshot {
                    activations: stats.activations.load(Ordering::Relaxed),
                    successes: stats.successes.load(Ordering::Relaxed),
                    failures: stats.failures.load(Ordering::Relaxed),
                },
            );
        }

        PolicyMetrics {
            service: self.service.clone(),
            total: inner.total.load(Ordering::Relaxed),
            success: inner.success.load(Ordering::Relaxed),
            failure: inner.failure.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            fallbacks: inner.fallbacks.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            patterns,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
            circuit: self.circuit_breaker.as_ref().map(|cb| cb.snapshot()),
        }
    }
}

/// One attempt: TIMEOUT -> op. Counted so the retry stats can report
/// re-attempts.
async fn attempt<T, E, Fut, Op>(
    op_cell: Arc<Mutex<Op>>,
    timeout: Option<TimeoutPolicy>,
    metrics: Arc<MetricsInner>,
    attempts: Arc<AtomicU64>,
) -> Result<T, FabricError<E>>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FabricError<E>>> + Send,
    Op: FnMut() -> Fut + Send,
{
    attempts.fetch_add(1, Ordering::Relaxed);
    let fut = {
        let mut op = op_cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        op()
    };
    let result = match timeout {
        Some(timeout) => timeout.execute(move || fut).await,
        None => fut.await,
    };
    if matches!(result, Err(FabricError::Timeout { .. })) {
        metrics.timeouts.fetch_add(1, Ordering::Relaxed);
    }
    result
}

pub struct ResiliencePolicyBuilder<E> {
    service: String,
    bulkhead: Option<Arc<Bulkhead>>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryPolicy<E>>,
    timeout: Option<TimeoutPolicy>,
    clock: Arc<dyn Clock>,
}

impl<E> ResiliencePolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            bulkhead: None,
            circuit_breaker: None,
            retry: None,
            timeout: None,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn retry_config(mut self, config: &RetryConfig) -> Self {
        self.retry = Some(RetryPolicy::from_config(config));
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Result<Self, crate::config::ConfigError> {
        let policy = TimeoutPolicy::new(duration)
            .map_err(|source| crate::config::ConfigError::InvalidTimeout { source })?;
        self.timeout = Some(policy);
        Ok(self)
    }

    pub fn build(self) -> ResiliencePolicy<E> {
        let circuit_breaker = self
            .circuit_breaker
            .map(|config| CircuitBreaker::with_clock(self.service.clone(), config, self.clock));
        ResiliencePolicy {
            service: self.service,
            bulkhead: self.bulkhead,
            circuit_breaker,
            retry: self.retry,
            timeout: self.timeout,
            metrics: Arc::new(MetricsInner::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::BulkheadConfig;
    use crate::InstantSleeper;
    use std::fmt;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn plain_policy() -> ResiliencePolicy<TestError> {
        ResiliencePolicy::builder("svc").build()
    }

    #[tokio::test]
    async fn bare_policy_passes_through() {
        let policy = plain_policy();
        let result = policy.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);

        let metrics = policy.metrics();
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.success, 1);
        assert_eq!(metrics.failure, 0);
    }

    #[tokio::test]
    async fn timeout_failures_are_retried_once_with_two_attempts() {
        let retry = RetryPolicy::builder()
            .max_attempts(2)
            .with_jitter(crate::Jitter::None)
            .with_sleeper(InstantSleeper)
            .build();
        let policy = ResiliencePolicy::builder("svc")
            .retry(retry)
            .timeout(Duration::from_millis(20))
            .unwrap()
            .build();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = policy
            .execute(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            })
            .await;

        assert!(result.unwrap_err().is_retry_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly one retry");

        let metrics = policy.metrics();
        assert_eq!(metrics.timeouts, 2);
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.failure, 1);
    }

    #[tokio::test]
    async fn circuit_breaker_sits_outside_retry() {
        let retry = RetryPolicy::builder().max_attempts(3).with_sleeper(InstantSleeper).build();
        let policy = ResiliencePolicy::builder("svc")
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            })
            .retry(retry)
            .build();

        // Each policy call exhausts 3 attempts but registers as ONE breaker
        // failure; two calls trip the breaker.
        for _ in 0..2 {
            let result: Result<(), _> = policy
                .execute(|| async { Err(FabricError::Inner(TestError("down".into()))) })
                .await;
            assert!(result.is_err());
        }
        let err = policy.execute(|| async { Ok(()) }).await.unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn saturated_bulkhead_sheds_without_retry() {
        let bulkhead = Arc::new(Bulkhead::new(
            "svc",
            BulkheadConfig {
                max_concurrent: 1,
                max_wait: Duration::ZERO,
                degradation_threshold: 0.8,
            },
        ));
        let retry = RetryPolicy::builder().max_attempts(5).with_sleeper(InstantSleeper).build();
        let policy = Arc::new(
            ResiliencePolicy::builder("svc").bulkhead(bulkhead.clone()).retry(retry).build(),
        );

        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let gate_clone = gate.clone();
        let p = policy.clone();
        let holder = tokio::spawn(async move {
            p.execute(|| {
                let gate = gate_clone.clone();
                async move {
                    gate.wait().await;
                    Ok::<_, FabricError<TestError>>(())
                }
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let err = policy
            .execute(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FabricError<TestError>>(())
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_bulkhead());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "operation never ran, never retried");

        gate.wait().await;
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fallback_rescues_terminal_errors() {
        let policy = plain_policy();
        let result = policy
            .execute_with_fallback(
                || async { Err(FabricError::Inner(TestError("primary down".into()))) },
                |_err| async { Ok(99) },
            )
            .await;
        assert_eq!(result.unwrap(), 99);

        let metrics = policy.metrics();
        assert_eq!(metrics.fallbacks, 1);
        assert_eq!(metrics.patterns["fallback"].successes, 1);
    }

    #[tokio::test]
    async fn failing_fallback_supersedes_original() {
        let policy = plain_policy();
        let result: Result<u32, _> = policy
            .execute_with_fallback(
                || async { Err(FabricError::Inner(TestError("primary down".into()))) },
                |_err| async { Err(TestError("fallback down".into())) },
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind().as_str(), "FALLBACK_FAILED");
    }

    #[tokio::test]
    async fn percentiles_use_rank_with_ceiling() {
        let samples: Vec<u64> = (1..=100).map(|v| v * 1_000).collect();
        assert!((percentile(&samples, 0.50) - 50.0).abs() < f64::EPSILON);
        assert!((percentile(&samples, 0.95) - 95.0).abs() < f64::EPSILON);
        assert!((percentile(&samples, 0.99) - 99.0).abs() < f64::EPSILON);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[tokio::test]
    async fn unisolated_run_skips_the_bulkhead() {
        let bulkhead = Arc::new(Bulkhead::new(
            "svc",
            BulkheadConfig {
                max_concurrent: 1,
                max_wait: Duration::ZERO,
                degradation_threshold: 0.8,
            },
        ));
        let policy = Arc::new(
            ResiliencePolicy::<TestError>::builder("svc").bulkhead(bulkhead.clone()).build(),
        );

        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let gate_clone = gate.clone();
        let p = policy.clone();
        let holder = tokio::spawn(async move {
            p.execute(|| {
                let gate = gate_clone.clone();
                async move {
                    gate.wait().await;
                    Ok::<_, FabricError<TestError>>(())
                }
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Saturated, but the unisolated path bypasses admission.
        policy.execute_unisolated(|| async { Ok(()) }).await.unwrap();

        gate.wait().await;
        holder.await.unwrap().unwrap();
    }
}
