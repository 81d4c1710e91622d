#![forbid(unsafe_code)]

//! # Seawall
//!
//! A reliability fabric for async Rust: admission control, fault isolation,
//! observation, and diagnosis for named downstream services, in one process,
//! over one shared clock.
//!
//! ## What's inside
//!
//! - **Admission**: token-bucket rate limiting with FIFO wait queues, an
//!   adaptive controller that re-targets rates from health and load, and
//!   backpressure-driven load shedding.
//! - **Isolation**: bulkheads (concurrency caps with bounded waiting) and
//!   circuit breakers, composed with retry, timeout, and fallback into a
//!   per-service resilience policy.
//! - **Observation**: health-check scheduling, dependency-graph health
//!   propagation, error budgets (SLOs), and latency budgets.
//! - **Diagnosis**: a cascading-failure detector (correlations and
//!   predictions) and a metrics exporter (JSON, Prometheus text, summary).
//!
//! ## Quick start
//!
//! ```rust
//! use seawall::{ReliabilityFabric, ServiceConfig, RateLimiterConfig, BulkheadConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let fabric = ReliabilityFabric::new();
//!
//!     fabric
//!         .register_service(
//!             ServiceConfig::new("db")
//!                 .kind("database")
//!                 .rate_limiter(RateLimiterConfig {
//!                     tokens_per_second: 100.0,
//!                     max_tokens: 200.0,
//!                     ..Default::default()
//!                 })
//!                 .bulkhead(BulkheadConfig { max_concurrent: 16, ..Default::default() }),
//!             None,
//!         )
//!         .expect("valid config");
//!
//!     let rows = fabric
//!         .execute("db", || async { Ok::<_, std::io::Error>(42) })
//!         .await
//!         .expect("query succeeds");
//!     assert_eq!(rows, 42);
//!
//!     fabric.shutdown();
//! }
//! ```

mod adaptive;
mod backoff;
mod backpressure;
mod bulkhead;
mod cascade;
mod circuit_breaker;
mod clock;
mod config;
mod degradation;
mod dependency_graph;
mod error;
mod error_budget;
mod exporter;
mod health;
mod jitter;
mod latency_budget;
mod orchestrator;
mod policy;
mod rate_limit;
mod registry;
mod retry;
mod sleeper;
mod timeout;
mod token_bucket;

pub mod telemetry;

// Re-exports
pub use adaptive::{
    AdaptiveConfig, AdaptiveDecision, AdaptiveInputs, AdaptiveRateLimiter, LoadLevel, LoadSample,
    ScalingStrategy, Tunable,
};
pub use backoff::Backoff;
pub use backpressure::{
    AdmissionDecision, BackpressureConfig, BackpressureManager, BackpressureThresholds,
    MetricsSource, PressureLevel, PressureStatus, Priority, SharedSample, SheddingStrategy,
    SystemSample,
};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadState};
pub use cascade::{
    CascadeConfig, CascadeDetector, CascadeReport, Correlation, CorrelationPattern,
    FailurePrediction, FailureRecord, RuntimeInfo,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, ServiceConfig};
pub use degradation::{
    DegradationConfig, DegradationController, DegradationLevel, DegradationStatus, FallbackChain,
    Served,
};
pub use dependency_graph::{
    DependencyEdge, DependencyGraph, DependencyType, ImpactAnalysis, ImpactSeverity,
};
pub use error::{BoxError, ErrorKind, FabricError, MAX_RETRY_FAILURES};
pub use error_budget::{ErrorBudgetStatus, ErrorBudgetTracker, SloConfig};
pub use exporter::{ExportFormat, FabricSnapshot, MetricsExporter};
pub use health::{
    probe_fn, HealthCheckConfig, HealthCheckScheduler, HealthProbe, ProbeStatus,
};
pub use jitter::Jitter;
pub use latency_budget::{
    LatencyBudgetConfig, LatencyBudgetTracker, LatencyStats, Trend, TrendDirection,
    ViolationLevel,
};
pub use orchestrator::{
    ExecuteOptions, FabricBuilder, FabricConfig, ReliabilityFabric, SelfHealing, ServiceStatus,
    SystemSummary,
};
pub use policy::{
    Pattern, PatternSnapshot, PolicyConfig, PolicyMetrics, ResiliencePolicy,
    ResiliencePolicyBuilder,
};
pub use rate_limit::{RateLimiterManager, REFILL_TICK};
pub use registry::{
    Criticality, HealthState, Incident, ServiceRegistration, ServiceRegistry, ServiceSnapshot,
    SloThresholds,
};
pub use retry::{RetryConfig, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{EventBus, EventKind, FabricEvent, Subscription};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
pub use token_bucket::{ConsumeGrant, RateLimiterConfig, TokenBucket, TokenBucketStatus};

pub mod prelude;
