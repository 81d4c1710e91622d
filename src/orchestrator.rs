//! The reliability fabric: single entry point wiring every component.
//!
//! `execute` runs the admission pipeline (backpressure, rate limiter), then
//! the per-service resilience policy (bulkhead, circuit breaker, retry,
//! timeout), and finally records the outcome into the error budget, latency
//! budget, and cascade detector. Admission rejections reflect intended
//! shedding and are not recorded as service failures.

use crate::adaptive::{AdaptiveInputs, AdaptiveRateLimiter, LoadSample};
use crate::backpressure::{
    BackpressureConfig, BackpressureManager, MetricsSource, Priority, SystemSample,
};
use crate::bulkhead::{Bulkhead, BulkheadState};
use crate::cascade::{CascadeConfig, CascadeDetector, CascadeReport, RuntimeInfo};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, ServiceConfig};
use crate::degradation::{
    DegradationConfig, DegradationController, DegradationLevel, FallbackChain, Served,
};
use crate::dependency_graph::{DependencyEdge, DependencyGraph, ImpactAnalysis};
use crate::error::{BoxError, FabricError};
use crate::error_budget::ErrorBudgetTracker;
use crate::exporter::{ExportFormat, FabricSnapshot, MetricsExporter};
use crate::health::{HealthCheckScheduler, HealthProbe};
use crate::latency_budget::LatencyBudgetTracker;
use crate::policy::ResiliencePolicy;
use crate::rate_limit::RateLimiterManager;
use crate::registry::{HealthState, ServiceRegistry};
use crate::telemetry::{EventBus, EventKind, FabricEvent, Subscription};
use crate::token_bucket::TokenBucket;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Optional sink invoked when a guarded execution fails terminally.
#[async_trait]
pub trait SelfHealing: Send + Sync {
    async fn trigger_healing(&self, service: &str, reason: &str);
}

/// Per-call options for [`ReliabilityFabric::execute_with_options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub skip_rate_limit: bool,
    pub skip_bulkhead: bool,
    pub skip_healing: bool,
    pub priority: Priority,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            skip_rate_limit: false,
            skip_bulkhead: false,
            skip_healing: false,
            priority: Priority::Normal,
        }
    }
}

/// Fabric-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricConfig {
    pub backpressure: BackpressureConfig,
    pub cascade: CascadeConfig,
    /// Cadence of the metrics collection loop.
    pub collection_interval: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressureConfig::default(),
            cascade: CascadeConfig::default(),
            collection_interval: Duration::from_secs(30),
        }
    }
}

pub(crate) struct ServiceComponents {
    pub(crate) bucket: Option<Arc<TokenBucket>>,
    pub(crate) adaptive: Option<Arc<AdaptiveRateLimiter>>,
    pub(crate) bulkhead: Option<Arc<Bulkhead>>,
    pub(crate) policy: Arc<ResiliencePolicy<BoxError>>,
    pub(crate) degradation: Arc<DegradationController>,
}

impl Clone for ServiceComponents {
    fn clone(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            adaptive: self.adaptive.clone(),
            bulkhead: self.bulkhead.clone(),
            policy: self.policy.clone(),
            degradation: self.degradation.clone(),
        }
    }
}

/// Shared state between the orchestrator and the metrics exporter.
pub(crate) struct FabricCore {
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) graph: Arc<DependencyGraph>,
    pub(crate) rate_limiters: Arc<RateLimiterManager>,
    pub(crate) services: Mutex<HashMap<String, ServiceComponents>>,
    pub(crate) backpressure: Arc<BackpressureManager>,
    pub(crate) cascade: Arc<CascadeDetector>,
    pub(crate) error_budgets: Arc<ErrorBudgetTracker>,
    pub(crate) latency_budgets: Arc<LatencyBudgetTracker>,
    pub(crate) scheduler: Arc<HealthCheckScheduler>,
    pub(crate) bus: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
}

impl FabricCore {
    pub(crate) fn components(&self, service: &str) -> Option<ServiceComponents> {
        self.services.lock().unwrap_or_else(|p| p.into_inner()).get(service).cloned()
    }

    pub(crate) fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.services.lock().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect();
        names.sort();
        names
    }

    /// Periodic measurement feed: push availability and latency into the
    /// registry, and health/load into the adaptive controllers.
    pub(crate) fn feed_observations(&self) {
        let sample = self.backpressure.status().sample;
        for name in self.service_names() {
            let availability = self
                .error_budgets
                .status(&name)
                .map(|s| s.current_availability)
                .unwrap_or(1.0);
            let avg_ms =
                self.latency_budgets.stats(&name).map(|s| s.avg_ms).unwrap_or(0.0);
            self.registry.record_observation(&name, availability, avg_ms);

            let components = match self.components(&name) {
                Some(c) => c,
                None => continue,
            };
            if let Some(adaptive) = components.adaptive {
                let health =
                    self.registry.health(&name).unwrap_or(HealthState::Healthy);
                let load = self.load_sample_for(&components.bulkhead, &sample, avg_ms);
                adaptive.submit(AdaptiveInputs { health, availability, load });
            }
        }
    }

    fn load_sample_for(
        &self,
        bulkhead: &Option<Arc<Bulkhead>>,
        sample: &SystemSample,
        avg_ms: f64,
    ) -> LoadSample {
        let connections = bulkhead
            .as_ref()
            .map(|b| {
                let metrics = b.metrics();
                metrics.active as f64 / metrics.max_concurrent.max(1) as f64
            })
            .unwrap_or(0.0);
        LoadSample {
            cpu: sample.cpu_proxy(),
            memory: sample.memory_fraction,
            connections,
            queue: (sample.pending_tasks as f64 / 500.0).min(1.0),
            errors: (sample.error_rate / 0.2).min(1.0),
            response_time: (avg_ms / 1_000.0).min(1.0),
        }
    }
}

impl RuntimeInfo for FabricCore {
    fn bulkhead_state(&self, service: &str) -> Option<BulkheadState> {
        self.components(service).and_then(|c| c.bulkhead.map(|b| b.state()))
    }

    fn degradation_level(&self, service: &str) -> Option<DegradationLevel> {
        self.components(service).map(|c| c.degradation.level())
    }
}

/// Full status of one guarded service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub registry: crate::registry::ServiceSnapshot,
    pub rate_limiter: Option<crate::token_bucket::TokenBucketStatus>,
    pub bulkhead: Option<crate::bulkhead::BulkheadMetrics>,
    pub policy: crate::policy::PolicyMetrics,
    pub degradation: crate::degradation::DegradationStatus,
    pub error_budget: Option<crate::error_budget::ErrorBudgetStatus>,
    pub latency: Option<crate::latency_budget::LatencyStats>,
    pub probe: Option<crate::health::ProbeStatus>,
}

/// One-screen view of the whole fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSummary {
    pub total_services: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub health_score: f64,
    pub pressure: crate::backpressure::PressureLevel,
    pub cascade_risk_level: u8,
    pub throttled_rate_limiters: usize,
    pub saturated_bulkheads: usize,
}

/// The fabric itself; cheap to clone.
#[derive(Clone)]
pub struct ReliabilityFabric {
    core: Arc<FabricCore>,
    exporter: Arc<MetricsExporter>,
    healing: Option<Arc<dyn SelfHealing>>,
}

impl std::fmt::Debug for ReliabilityFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityFabric")
            .field("services", &self.core.registry.len())
            .finish()
    }
}

impl ReliabilityFabric {
    /// Build with defaults. Must run inside a tokio runtime: the event
    /// dispatcher, refill ticker, cascade analyzer, and collector are spawned
    /// here.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> FabricBuilder {
        FabricBuilder::default()
    }

    /// Register (or replace) a guarded service. The optional probe activates
    /// the health-check schedule.
    pub fn register_service(
        &self,
        config: ServiceConfig,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Result<(), ConfigError> {
        config.validate()?;
        let name = config.name.clone();
        let core = &self.core;

        // Re-registration replaces the previous entry atomically; tear the
        // old edges down first.
        core.graph.remove_service(&name);
        core.registry.register(config.registration());
        for dependency in &config.dependencies {
            core.graph.add_dependency(DependencyEdge::required(&name, dependency));
        }

        let bucket = config
            .rate_limiter
            .as_ref()
            .map(|rl| core.rate_limiters.register(&name, rl.clone()));
        let adaptive = match (&bucket, &config.adaptive) {
            (Some(bucket), Some(adaptive_cfg)) => Some(Arc::new(AdaptiveRateLimiter::with_clock(
                bucket.clone(),
                adaptive_cfg.clone(),
                core.clock.clone(),
            ))),
            _ => None,
        };
        let bulkhead =
            config.bulkhead.as_ref().map(|b| Arc::new(Bulkhead::new(&name, b.clone())));
        let policy_config = config.policy.clone().unwrap_or_default();
        let policy = Arc::new(ResiliencePolicy::from_config(
            &name,
            &policy_config,
            bulkhead.clone(),
            core.clock.clone(),
        )?);
        let degradation =
            Arc::new(DegradationController::new(&name, DegradationConfig::default()));

        core.error_budgets.register(&name, config.slo.clone().unwrap_or_default());
        core.latency_budgets
            .register(&name, config.latency_budget.clone().unwrap_or_default());

        // Without a probe the health section still works: external monitors
        // feed record_probe_result through the same transition logic.
        if let Some(probe) = probe {
            core.scheduler.schedule(
                &name,
                config.criticality,
                config.health_check.clone().unwrap_or_default(),
                probe,
            );
        }

        let previous = core.services.lock().unwrap_or_else(|p| p.into_inner()).insert(
            name.clone(),
            ServiceComponents { bucket, adaptive, bulkhead, policy, degradation },
        );
        if let Some(previous) = previous {
            if let Some(bulkhead) = previous.bulkhead {
                bulkhead.destroy();
            }
        }
        tracing::info!(service = %name, "service registered with fabric");
        Ok(())
    }

    /// Remove a service everywhere. Unknown names are a no-op.
    pub fn unregister_service(&self, name: &str) {
        let core = &self.core;
        let removed = core.services.lock().unwrap_or_else(|p| p.into_inner()).remove(name);
        if let Some(components) = removed {
            if let Some(bulkhead) = components.bulkhead {
                bulkhead.destroy();
            }
        }
        core.rate_limiters.unregister(name);
        core.scheduler.unschedule(name);
        core.error_budgets.unregister(name);
        core.latency_budgets.unregister(name);
        core.graph.remove_service(name);
        core.registry.unregister(name);
    }

    /// Guarded execution with default options.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        service: &str,
        operation: Op,
    ) -> Result<T, FabricError<BoxError>>
    where
        T: Send,
        E: Into<BoxError> + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_with_options(service, operation, ExecuteOptions::default()).await
    }

    /// Guarded execution. Pipeline: backpressure -> rate limiter -> policy
    /// (bulkhead, circuit breaker, retry, timeout) -> outcome recording.
    pub async fn execute_with_options<T, E, Fut, Op>(
        &self,
        service: &str,
        mut operation: Op,
        options: ExecuteOptions,
    ) -> Result<T, FabricError<BoxError>>
    where
        T: Send,
        E: Into<BoxError> + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let components = self
            .core
            .components(service)
            .ok_or_else(|| FabricError::UnknownService { service: service.to_string() })?;

        // Backpressure admission.
        let decision = self.core.backpressure.should_accept(options.priority);
        if !decision.accept {
            return Err(FabricError::RateLimitExceeded {
                service: service.to_string(),
                remaining: 0.0,
            });
        }
        if let Some(delay) = decision.delay {
            tokio::time::sleep(delay).await;
        }

        // Rate limiting: one token per call, non-blocking.
        if !options.skip_rate_limit {
            if let Some(bucket) = &components.bucket {
                if !bucket.try_consume(1.0) {
                    let status = bucket.status();
                    return Err(FabricError::RateLimitExceeded {
                        service: service.to_string(),
                        remaining: status.tokens,
                    });
                }
            }
        }

        let started = Instant::now();
        let wrapped = move || {
            let fut = operation();
            async move { fut.await.map_err(|e| FabricError::Inner(e.into())) }
        };
        let result = if options.skip_bulkhead {
            components.policy.execute_unisolated(wrapped).await
        } else {
            components.policy.execute(wrapped).await
        };
        let elapsed = started.elapsed();

        self.record_outcome(service, &result, elapsed, options).await;
        result
    }

    /// Guarded execution with a caller-supplied fallback around the chain.
    pub async fn execute_with_fallback<T, E, Fut, Op, FbFut, Fb>(
        &self,
        service: &str,
        mut operation: Op,
        fallback: Fb,
        options: ExecuteOptions,
    ) -> Result<T, FabricError<BoxError>>
    where
        T: Send,
        E: Into<BoxError> + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
        FbFut: Future<Output = Result<T, BoxError>> + Send,
        Fb: FnOnce(&FabricError<BoxError>) -> FbFut + Send,
    {
        let components = self
            .core
            .components(service)
            .ok_or_else(|| FabricError::UnknownService { service: service.to_string() })?;

        let decision = self.core.backpressure.should_accept(options.priority);
        if !decision.accept {
            return Err(FabricError::RateLimitExceeded {
                service: service.to_string(),
                remaining: 0.0,
            });
        }
        if let Some(delay) = decision.delay {
            tokio::time::sleep(delay).await;
        }
        if !options.skip_rate_limit {
            if let Some(bucket) = &components.bucket {
                if !bucket.try_consume(1.0) {
                    let status = bucket.status();
                    return Err(FabricError::RateLimitExceeded {
                        service: service.to_string(),
                        remaining: status.tokens,
                    });
                }
            }
        }

        let started = Instant::now();
        let wrapped = move || {
            let fut = operation();
            async move { fut.await.map_err(|e| FabricError::Inner(e.into())) }
        };
        let result = components.policy.execute_with_fallback(wrapped, fallback).await;
        let elapsed = started.elapsed();
        self.record_outcome(service, &result, elapsed, options).await;
        result
    }

    /// Run a degradation chain for `service` under its controller.
    pub async fn execute_degraded<T>(
        &self,
        service: &str,
        chain: FallbackChain<T, BoxError>,
    ) -> Result<Served<T>, FabricError<BoxError>>
    where
        T: Send,
    {
        let components = self
            .core
            .components(service)
            .ok_or_else(|| FabricError::UnknownService { service: service.to_string() })?;
        let result = components.degradation.execute(chain).await;
        // Project the controller's health into the graph.
        let health = components.degradation.health();
        if self.core.registry.health(service) != Some(health) {
            self.core.graph.update_health(
                &self.core.registry,
                service,
                health,
                "degradation level change",
            );
        }
        result
    }

    async fn record_outcome<T>(
        &self,
        service: &str,
        result: &Result<T, FabricError<BoxError>>,
        elapsed: Duration,
        options: ExecuteOptions,
    ) {
        match result {
            Ok(_) => {
                self.core.latency_budgets.record(service, elapsed);
                self.core.error_budgets.record_request(service, true);
                self.core.cascade.record_recovery(service);
            }
            Err(error) if error.is_admission() => {
                // Intended shedding: not a service failure, not a sample.
            }
            Err(error) => {
                self.core.latency_budgets.record(service, elapsed);
                self.core.error_budgets.record_request(service, false);
                self.core.cascade.record_failure(
                    service,
                    error.kind().as_str(),
                    &error.to_string(),
                );
                if !options.skip_healing {
                    if let Some(healing) = &self.healing {
                        healing.trigger_healing(service, error.kind().as_str()).await;
                    }
                }
            }
        }
    }

    pub fn get_service_status(&self, service: &str) -> Option<ServiceStatus> {
        let components = self.core.components(service)?;
        let registry = self.core.registry.snapshot(service)?;
        Some(ServiceStatus {
            registry,
            rate_limiter: components.bucket.as_ref().map(|b| b.status()),
            bulkhead: components.bulkhead.as_ref().map(|b| b.metrics()),
            policy: components.policy.metrics(),
            degradation: components.degradation.status(),
            error_budget: self.core.error_budgets.status(service),
            latency: self.core.latency_budgets.stats(service),
            probe: self.core.scheduler.status(service),
        })
    }

    pub fn get_system_summary(&self) -> SystemSummary {
        let snapshot = self.exporter.collect();
        summarize(&snapshot)
    }

    /// Subscribe to fabric events; listeners run in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&FabricEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.core.bus.subscribe(kind, listener)
    }

    /// Feed an externally produced probe result.
    pub fn record_probe_result(&self, service: &str, healthy: bool, details: Option<String>) {
        self.core.scheduler.record_probe_result(service, healthy, details);
    }

    /// Render current metrics in the requested format.
    pub fn export_metrics(&self, format: ExportFormat) -> String {
        self.exporter.export(format)
    }

    /// Latest collected snapshot (collects on demand).
    pub fn snapshot(&self) -> FabricSnapshot {
        self.exporter.collect()
    }

    /// Push a system sample into the backpressure manager.
    pub fn update_pressure(&self, sample: SystemSample) {
        self.core.backpressure.update_sample(sample);
    }

    /// Current pressure state.
    pub fn pressure(&self) -> crate::backpressure::PressureStatus {
        self.core.backpressure.status()
    }

    /// Multiplier external rate limits should apply under current pressure.
    pub fn rate_limit_factor(&self) -> f64 {
        self.core.backpressure.rate_limit_factor()
    }

    /// Recorded failures for one service, oldest first.
    pub fn failure_history(&self, service: &str) -> Vec<crate::cascade::FailureRecord> {
        self.core.cascade.history(service)
    }

    /// Start the periodic pressure sampler from an external source.
    pub fn start_pressure_sampler(&self, source: Arc<dyn MetricsSource>) {
        self.core.backpressure.start_sampler(source);
    }

    /// Set or replace the fabric-wide health of a service by hand (operator
    /// override); propagates through the dependency graph.
    pub fn set_service_health(&self, service: &str, health: HealthState, reason: &str) {
        self.core.graph.update_health(&self.core.registry, service, health, reason);
    }

    pub fn analyze_impact(&self, service: &str) -> ImpactAnalysis {
        self.core.graph.analyze_impact(&self.core.registry, service)
    }

    pub fn cascade_report(&self) -> CascadeReport {
        self.core.cascade.last_report()
    }

    /// Flush pending events; useful in tests and before shutdown.
    pub async fn flush_events(&self) {
        self.core.bus.flush().await;
    }

    /// Stop every scheduler, reject queued waiters with `SHUTDOWN`, clear
    /// all registrations. Idempotent.
    pub fn shutdown(&self) {
        self.exporter.stop();
        self.core.cascade.destroy();
        self.core.scheduler.destroy();
        self.core.backpressure.destroy();
        self.core.rate_limiters.destroy();
        let mut services = self.core.services.lock().unwrap_or_else(|p| p.into_inner());
        for (_, components) in services.drain() {
            if let Some(bulkhead) = components.bulkhead {
                bulkhead.destroy();
            }
        }
        drop(services);
        self.core.error_budgets.destroy();
        self.core.latency_budgets.destroy();
        self.core.graph.destroy();
        self.core.registry.destroy();
    }
}

impl Default for ReliabilityFabric {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn summarize(snapshot: &FabricSnapshot) -> SystemSummary {
    let healthy = snapshot
        .services
        .iter()
        .filter(|s| s.health == HealthState::Healthy)
        .count();
    let degraded = snapshot
        .services
        .iter()
        .filter(|s| s.health == HealthState::Degraded)
        .count();
    let unhealthy = snapshot.services.len() - healthy - degraded;
    SystemSummary {
        total_services: snapshot.services.len(),
        healthy,
        degraded,
        unhealthy,
        health_score: snapshot.health_score,
        pressure: snapshot.pressure.level,
        cascade_risk_level: snapshot.cascade_risk_level,
        throttled_rate_limiters: snapshot
            .rate_limiters
            .iter()
            .filter(|r| r.throttled)
            .count(),
        saturated_bulkheads: snapshot
            .bulkheads
            .iter()
            .filter(|b| b.state == BulkheadState::Closed)
            .count(),
    }
}

/// Builder for [`ReliabilityFabric`].
pub struct FabricBuilder {
    config: FabricConfig,
    clock: Arc<dyn Clock>,
    healing: Option<Arc<dyn SelfHealing>>,
    start_collector: bool,
}

impl Default for FabricBuilder {
    fn default() -> Self {
        Self {
            config: FabricConfig::default(),
            clock: Arc::new(MonotonicClock::default()),
            healing: None,
            start_collector: true,
        }
    }
}

impl FabricBuilder {
    pub fn config(mut self, config: FabricConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn self_healing(mut self, healing: Arc<dyn SelfHealing>) -> Self {
        self.healing = Some(healing);
        self
    }

    /// Disable the background collection loop (tests drive `collect` by hand).
    pub fn manual_collection(mut self) -> Self {
        self.start_collector = false;
        self
    }

    pub fn build(self) -> ReliabilityFabric {
        let bus = EventBus::new();
        let registry = Arc::new(ServiceRegistry::with_clock(self.clock.clone()));
        let graph = Arc::new(DependencyGraph::new());
        let rate_limiters = Arc::new(RateLimiterManager::with_clock(self.clock.clone()));
        let backpressure = Arc::new(BackpressureManager::with_clock(
            bus.clone(),
            self.config.backpressure.clone(),
            self.clock.clone(),
        ));
        let cascade = Arc::new(CascadeDetector::with_clock(
            registry.clone(),
            graph.clone(),
            bus.clone(),
            self.config.cascade.clone(),
            self.clock.clone(),
        ));
        let error_budgets =
            Arc::new(ErrorBudgetTracker::with_clock(bus.clone(), self.clock.clone()));
        let latency_budgets =
            Arc::new(LatencyBudgetTracker::with_clock(bus.clone(), self.clock.clone()));
        let scheduler = Arc::new(HealthCheckScheduler::new(registry.clone(), bus.clone()));

        let core = Arc::new(FabricCore {
            registry,
            graph,
            rate_limiters,
            services: Mutex::new(HashMap::new()),
            backpressure,
            cascade,
            error_budgets,
            latency_budgets,
            scheduler,
            bus,
            clock: self.clock,
        });

        // Health transitions propagate through the graph synchronously from
        // the probe task.
        {
            let graph = core.graph.clone();
            let registry = core.registry.clone();
            core.scheduler.set_transition_hook(move |service, health| {
                graph.update_health(&registry, service, health, "health checks");
            });
        }

        let runtime: Arc<dyn RuntimeInfo> = core.clone();
        core.cascade.start_analyzer(Some(runtime));

        let exporter = Arc::new(MetricsExporter::new(
            core.clone(),
            self.config.collection_interval,
        ));
        if self.start_collector {
            exporter.start();
        }

        ReliabilityFabric { core, exporter, healing: self.healing }
    }
}
