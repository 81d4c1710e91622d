//! Cascading-failure detection: failure history, cross-service correlation,
//! and failure predictions.

use crate::bulkhead::BulkheadState;
use crate::clock::{Clock, MonotonicClock};
use crate::degradation::DegradationLevel;
use crate::dependency_graph::{DependencyGraph, ImpactSeverity};
use crate::registry::{Criticality, ServiceRegistry};
use crate::telemetry::{EventBus, FabricEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Two failures this close count as simultaneous.
const SIMULTANEOUS_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Failure records kept per service.
    pub max_history: usize,
    /// Consecutive failures that raise `cascade_warning`.
    pub min_failure_threshold: u32,
    /// Lookback window for correlation analysis.
    pub correlation_window: Duration,
    /// Minimum score for a pair to be reported as correlated.
    pub correlation_threshold: f64,
    /// Cadence of the background `analyze` pass.
    pub analysis_interval: Duration,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            min_failure_threshold: 5,
            correlation_window: Duration::from_secs(60),
            correlation_threshold: 0.7,
            analysis_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at_millis: u64,
    pub kind: String,
    pub message: String,
    pub recovered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationPattern {
    Simultaneous,
    Sequential,
    Periodic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub services: (String, String),
    pub score: f64,
    pub shared: usize,
    pub pattern: CorrelationPattern,
    pub window: Duration,
    pub computed_at_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePrediction {
    pub service: String,
    pub probability: f64,
    pub impact: ImpactSeverity,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CascadeReport {
    pub at_millis: u64,
    pub correlations: Vec<Correlation>,
    pub predictions: Vec<FailurePrediction>,
}

/// Live component state the detector folds into recommendations; implemented
/// by whoever owns the bulkheads and degradation controllers.
pub trait RuntimeInfo: Send + Sync {
    fn bulkhead_state(&self, service: &str) -> Option<BulkheadState>;
    fn degradation_level(&self, service: &str) -> Option<DegradationLevel>;
}

struct ServiceFailures {
    records: VecDeque<FailureRecord>,
    consecutive: u32,
}

impl ServiceFailures {
    fn new() -> Self {
        Self { records: VecDeque::new(), consecutive: 0 }
    }

    fn recent(&self, cutoff: u64) -> Vec<u64> {
        self.records.iter().filter(|r| r.at_millis >= cutoff).map(|r| r.at_millis).collect()
    }
}

/// Watches per-service failure streams for cross-service patterns.
pub struct CascadeDetector {
    config: CascadeConfig,
    failures: Mutex<HashMap<String, ServiceFailures>>,
    correlations: Mutex<HashMap<(String, String), Correlation>>,
    last_report: Mutex<CascadeReport>,
    registry: Arc<ServiceRegistry>,
    graph: Arc<DependencyGraph>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    analyzer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CascadeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeDetector").finish()
    }
}

impl CascadeDetector {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        graph: Arc<DependencyGraph>,
        bus: EventBus,
        config: CascadeConfig,
    ) -> Self {
        Self::with_clock(registry, graph, bus, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        registry: Arc<ServiceRegistry>,
        graph: Arc<DependencyGraph>,
        bus: EventBus,
        config: CascadeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
            correlations: Mutex::new(HashMap::new()),
            last_report: Mutex::new(CascadeReport::default()),
            registry,
            graph,
            clock,
            bus,
            analyzer: Mutex::new(None),
        }
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServiceFailures>> {
        self.failures.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record one failure; may emit `cascade_warning` and `cascade_detected`.
    pub fn record_failure(&self, service: &str, kind: &str, message: &str) {
        let now = self.clock.now_millis();
        let consecutive = {
            let mut failures = self.lock_failures();
            let entry = failures.entry(service.to_string()).or_insert_with(ServiceFailures::new);
            if entry.records.len() >= self.config.max_history.max(1) {
                entry.records.pop_front();
            }
            entry.records.push_back(FailureRecord {
                at_millis: now,
                kind: kind.to_string(),
                message: message.to_string(),
                recovered: false,
            });
            entry.consecutive += 1;
            entry.consecutive
        };

        if consecutive == self.config.min_failure_threshold {
            tracing::warn!(service, consecutive, "cascade warning threshold reached");
            self.bus.emit(FabricEvent::CascadeWarning {
                service: service.to_string(),
                consecutive_failures: consecutive,
            });
        }

        if self.registry.criticality(service) == Some(Criticality::Critical) {
            self.check_dependents(service);
        }
    }

    /// A critical service is failing: if any dependent is already struggling
    /// the cascade is live, not hypothetical.
    fn check_dependents(&self, service: &str) {
        let dependents = self.graph.dependents_of(service);
        if dependents.is_empty() {
            return;
        }
        let failures = self.lock_failures();
        let affected: Vec<String> = dependents
            .iter()
            .filter(|edge| {
                let down = self
                    .registry
                    .health(&edge.from)
                    .map(|h| h.is_down())
                    .unwrap_or(false);
                let failing = failures
                    .get(&edge.from)
                    .map(|f| f.consecutive > 0)
                    .unwrap_or(false);
                down || failing
            })
            .map(|edge| edge.from.clone())
            .collect();
        drop(failures);

        if !affected.is_empty() {
            let mut path = vec![service.to_string()];
            path.extend(affected);
            tracing::error!(root = service, ?path, "cascade detected");
            self.bus.emit(FabricEvent::CascadeDetected {
                root: service.to_string(),
                propagation_path: path,
            });
        }
    }

    /// Record a success; resets the consecutive count and marks the latest
    /// failure recovered.
    pub fn record_recovery(&self, service: &str) {
        let mut failures = self.lock_failures();
        if let Some(entry) = failures.get_mut(service) {
            entry.consecutive = 0;
            if let Some(last) = entry.records.iter_mut().rev().find(|r| !r.recovered) {
                last.recovered = true;
            }
        }
    }

    pub fn consecutive_failures(&self, service: &str) -> u32 {
        self.lock_failures().get(service).map(|f| f.consecutive).unwrap_or(0)
    }

    pub fn history(&self, service: &str) -> Vec<FailureRecord> {
        self.lock_failures()
            .get(service)
            .map(|f| f.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pairwise correlation + prediction pass. Runs on the analyzer cadence;
    /// callable directly for tests and on-demand reports.
    pub fn analyze(&self, runtime: Option<&dyn RuntimeInfo>) -> CascadeReport {
        let now = self.clock.now_millis();
        let window_millis = self.config.correlation_window.as_millis() as u64;
        let cutoff = now.saturating_sub(window_millis);

        let per_service: Vec<(String, Vec<u64>, u32)> = {
            let failures = self.lock_failures();
            failures
                .iter()
                .map(|(name, f)| (name.clone(), f.recent(cutoff), f.consecutive))
                .collect()
        };

        // Correlations: sources must clear the failure threshold, partners
        // only need any failure in the window. A pair is compared once no
        // matter which side crossed the threshold.
        let mut fresh: Vec<Correlation> = Vec::new();
        let mut seen_pairs: HashSet<(String, String)> = HashSet::new();
        for (name_a, times_a, _) in per_service
            .iter()
            .filter(|(_, times, _)| times.len() >= self.config.min_failure_threshold as usize)
        {
            for (name_b, times_b, _) in per_service.iter() {
                if name_a == name_b || times_b.is_empty() {
                    continue;
                }
                let key = if name_a < name_b {
                    (name_a.clone(), name_b.clone())
                } else {
                    (name_b.clone(), name_a.clone())
                };
                if !seen_pairs.insert(key) {
                    continue;
                }
                if let Some(correlation) =
                    self.correlate(name_a, times_a, name_b, times_b, now)
                {
                    if correlation.score >= self.config.correlation_threshold {
                        tracing::warn!(
                            a = %correlation.services.0,
                            b = %correlation.services.1,
                            score = correlation.score,
                            "correlated failures"
                        );
                        fresh.push(correlation);
                    }
                }
            }
        }

        {
            let mut cache = self.correlations.lock().unwrap_or_else(|p| p.into_inner());
            for correlation in &fresh {
                cache.insert(correlation.services.clone(), correlation.clone());
            }
            // Entries expire when both endpoints were quiet for 2 windows.
            let expiry_cutoff = now.saturating_sub(2 * window_millis);
            let failures = self.lock_failures();
            cache.retain(|(a, b), _| {
                let recent = |name: &str| {
                    failures
                        .get(name)
                        .map(|f| f.records.iter().any(|r| r.at_millis >= expiry_cutoff))
                        .unwrap_or(false)
                };
                recent(a) || recent(b)
            });
        }

        let predictions = self.predict(&per_service, runtime);
        let report = CascadeReport {
            at_millis: now,
            correlations: self.correlations(),
            predictions,
        };
        *self.last_report.lock().unwrap_or_else(|p| p.into_inner()) = report.clone();
        report
    }

    fn correlate(
        &self,
        name_a: &str,
        times_a: &[u64],
        name_b: &str,
        times_b: &[u64],
        now: u64,
    ) -> Option<Correlation> {
        let simultaneous_millis = SIMULTANEOUS_WINDOW.as_millis() as u64;
        let sequential_millis = self.config.correlation_window.as_millis() as u64 / 10;

        let mut simultaneous = 0usize;
        let mut sequential = 0usize;
        let mut matched_gaps: Vec<u64> = Vec::new();
        for ta in times_a {
            for tb in times_b {
                let gap = ta.abs_diff(*tb);
                if gap <= simultaneous_millis {
                    simultaneous += 1;
                    matched_gaps.push(gap);
                } else if gap <= sequential_millis {
                    sequential += 1;
                    matched_gaps.push(gap);
                }
            }
        }

        let shared = simultaneous.max(sequential);
        if shared == 0 {
            return None;
        }
        let score =
            (shared as f64 / times_a.len().max(times_b.len()) as f64).min(1.0);

        let pattern = if is_periodic(&matched_gaps) {
            CorrelationPattern::Periodic
        } else if simultaneous >= sequential {
            CorrelationPattern::Simultaneous
        } else {
            CorrelationPattern::Sequential
        };

        // Normalised pair label so the cache holds one entry per pair
        // regardless of which side was the source.
        let services = if name_a < name_b {
            (name_a.to_string(), name_b.to_string())
        } else {
            (name_b.to_string(), name_a.to_string())
        };

        Some(Correlation {
            services,
            score,
            shared,
            pattern,
            window: self.config.correlation_window,
            computed_at_millis: now,
        })
    }

    fn predict(
        &self,
        per_service: &[(String, Vec<u64>, u32)],
        runtime: Option<&dyn RuntimeInfo>,
    ) -> Vec<FailurePrediction> {
        let mut predictions = Vec::new();
        for (name, recent, consecutive) in per_service {
            if recent.is_empty() {
                continue;
            }
            let failure_rate =
                (recent.len() as f64 / self.config.max_history.max(1) as f64).min(1.0);
            let multiplier = self
                .registry
                .criticality(name)
                .map(|c| c.cascade_multiplier())
                .unwrap_or(1.0);
            let probability =
                (failure_rate * multiplier * (*consecutive as f64 / 10.0)).min(1.0);

            let dependents = self.graph.dependents_of(name);
            let criticality = self.registry.criticality(name);
            let impact = if criticality == Some(Criticality::Critical) || dependents.len() > 3 {
                ImpactSeverity::Critical
            } else if criticality == Some(Criticality::High) || dependents.len() > 1 {
                ImpactSeverity::High
            } else {
                ImpactSeverity::Medium
            };

            let mut recommendations = Vec::new();
            if let Some(runtime) = runtime {
                match runtime.bulkhead_state(name) {
                    Some(BulkheadState::Closed) => recommendations.push(format!(
                        "bulkhead for {} is saturated; shed load or raise capacity",
                        name
                    )),
                    Some(BulkheadState::Degraded) => recommendations.push(format!(
                        "bulkhead for {} is near capacity; consider early shedding",
                        name
                    )),
                    _ => {}
                }
                if let Some(level) = runtime.degradation_level(name) {
                    if level != DegradationLevel::Full {
                        recommendations.push(format!(
                            "{} already serves degraded responses ({:?}); prioritise recovery",
                            name, level
                        ));
                    }
                }
            }
            if !dependents.is_empty() {
                recommendations.push(format!(
                    "{} has {} dependent(s); verify their circuit breakers before the failure spreads",
                    name,
                    dependents.len()
                ));
            }

            predictions.push(FailurePrediction {
                service: name.clone(),
                probability,
                impact,
                recommendations,
            });
        }
        predictions.sort_by(|a, b| {
            b.probability.partial_cmp(&a.probability).unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions
    }

    /// Currently cached correlations, sorted by pair.
    pub fn correlations(&self) -> Vec<Correlation> {
        let cache = self.correlations.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<Correlation> = cache.values().cloned().collect();
        out.sort_by(|a, b| a.services.cmp(&b.services));
        out
    }

    pub fn last_report(&self) -> CascadeReport {
        self.last_report.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Coarse risk for the exporter: 1 low, 2 medium, 3 high, 4 critical.
    pub fn risk_level(&self) -> u8 {
        let report = self.last_report();
        let max_probability =
            report.predictions.iter().map(|p| p.probability).fold(0.0f64, f64::max);
        if max_probability >= 0.8 {
            4
        } else if max_probability >= 0.5 || !report.correlations.is_empty() {
            3
        } else if !report.predictions.is_empty() {
            2
        } else {
            1
        }
    }

    /// Spawn the periodic analyzer; holds only weak handles so dropping the
    /// detector (or the runtime-info owner) stops it.
    pub fn start_analyzer(self: &Arc<Self>, runtime: Option<Arc<dyn RuntimeInfo>>) {
        self.stop_analyzer();
        let weak = Arc::downgrade(self);
        let weak_runtime = runtime.as_ref().map(Arc::downgrade);
        let interval = self.config.analysis_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(detector) => {
                        let runtime = weak_runtime.as_ref().and_then(|w| w.upgrade());
                        detector.analyze(runtime.as_deref());
                    }
                    None => break,
                }
            }
        });
        *self.analyzer.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    fn stop_analyzer(&self) {
        if let Some(handle) = self.analyzer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    pub fn destroy(&self) {
        self.stop_analyzer();
        self.lock_failures().clear();
        self.correlations.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl Drop for CascadeDetector {
    fn drop(&mut self) {
        self.stop_analyzer();
    }
}

/// Matched gaps with near-constant spacing suggest a periodic driver.
fn is_periodic(gaps: &[u64]) -> bool {
    if gaps.len() < 4 {
        return false;
    }
    let mean = gaps.iter().sum::<u64>() as f64 / gaps.len() as f64;
    if mean < 1.0 {
        return false;
    }
    let variance =
        gaps.iter().map(|g| (*g as f64 - mean) * (*g as f64 - mean)).sum::<f64>()
            / gaps.len() as f64;
    variance.sqrt() / mean < 0.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dependency_graph::DependencyEdge;
    use crate::registry::{HealthState, ServiceRegistration, SloThresholds};
    use crate::telemetry::{EventKind, MemorySink};

    struct Fixture {
        detector: Arc<CascadeDetector>,
        registry: Arc<ServiceRegistry>,
        graph: Arc<DependencyGraph>,
        clock: ManualClock,
        sink: MemorySink,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new();
        let registry = Arc::new(ServiceRegistry::with_clock(Arc::new(clock.clone())));
        for (name, criticality, deps) in [
            ("auth", Criticality::Critical, vec![]),
            ("api", Criticality::High, vec!["auth".to_string()]),
            ("worker", Criticality::Medium, vec![]),
        ] {
            registry.register(ServiceRegistration {
                name: name.to_string(),
                kind: "svc".to_string(),
                criticality,
                dependencies: deps,
                slo: SloThresholds::default(),
            });
        }
        let graph = Arc::new(DependencyGraph::new());
        graph.add_dependency(DependencyEdge::required("api", "auth"));

        let bus = EventBus::new();
        let sink = MemorySink::new();
        bus.attach_sink(sink.clone());
        let detector = Arc::new(CascadeDetector::with_clock(
            registry.clone(),
            graph.clone(),
            bus.clone(),
            CascadeConfig {
                min_failure_threshold: 5,
                correlation_window: Duration::from_secs(60),
                correlation_threshold: 0.7,
                ..Default::default()
            },
            Arc::new(clock.clone()),
        ));
        Fixture { detector, registry, graph, clock, sink, bus }
    }

    #[tokio::test]
    async fn warning_fires_at_threshold_once() {
        let f = fixture();
        for _ in 0..7 {
            f.detector.record_failure("worker", "TIMEOUT", "slow");
        }
        f.bus.flush().await;
        let warnings =
            f.sink.events().iter().filter(|e| e.kind() == EventKind::CascadeWarning).count();
        assert_eq!(warnings, 1);
        assert_eq!(f.detector.consecutive_failures("worker"), 7);
    }

    #[tokio::test]
    async fn critical_failure_with_struggling_dependent_is_a_cascade() {
        let f = fixture();
        // B (api) is already down via propagation.
        f.graph.update_health(&f.registry, "auth", HealthState::Unhealthy, "probes");
        assert_eq!(f.registry.health("api"), Some(HealthState::Unhealthy));

        for i in 0..5 {
            f.clock.advance(1_000);
            f.detector.record_failure("auth", "TIMEOUT", &format!("failure {}", i));
        }
        f.bus.flush().await;

        let detected = f
            .sink
            .events()
            .iter()
            .find_map(|e| match e {
                FabricEvent::CascadeDetected { root, propagation_path } => {
                    Some((root.clone(), propagation_path.clone()))
                }
                _ => None,
            })
            .expect("cascade_detected");
        assert_eq!(detected.0, "auth");
        assert!(detected.1.contains(&"api".to_string()));
    }

    #[tokio::test]
    async fn recovery_resets_consecutive_and_marks_record() {
        let f = fixture();
        f.detector.record_failure("worker", "TIMEOUT", "x");
        f.detector.record_failure("worker", "TIMEOUT", "y");
        f.detector.record_recovery("worker");

        assert_eq!(f.detector.consecutive_failures("worker"), 0);
        let history = f.detector.history("worker");
        assert_eq!(history.len(), 2);
        assert!(history.last().unwrap().recovered);
        assert!(!history.first().unwrap().recovered);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let f = fixture();
        for _ in 0..250 {
            f.detector.record_failure("worker", "INNER", "boom");
        }
        assert_eq!(f.detector.history("worker").len(), 100);
    }

    #[tokio::test]
    async fn simultaneous_failures_correlate() {
        let f = fixture();
        // worker and api fail together 5 times, a second apart each round.
        for _ in 0..5 {
            f.clock.advance(1_000);
            f.detector.record_failure("api", "TIMEOUT", "spike");
            f.detector.record_failure("worker", "TIMEOUT", "spike");
        }
        let report = f.detector.analyze(None);
        assert!(!report.correlations.is_empty(), "expected a correlation");
        let correlation = &report.correlations[0];
        assert_eq!(
            correlation.services,
            ("api".to_string(), "worker".to_string())
        );
        assert!(correlation.score >= 0.7);
        assert_eq!(correlation.pattern, CorrelationPattern::Simultaneous);
        assert!(f.detector.risk_level() >= 3);
    }

    #[tokio::test]
    async fn threshold_side_sorting_after_partner_still_correlates() {
        let f = fixture();
        // "zoo" crosses the threshold; "api" fails only twice, at the same
        // instants. "zoo" sorts after "api", so only the zoo->api direction
        // of the pair walk can find it.
        for i in 0..5 {
            f.clock.advance(1_000);
            f.detector.record_failure("zoo", "TIMEOUT", "spike");
            if i < 2 {
                f.detector.record_failure("api", "TIMEOUT", "spike");
            }
        }
        let report = f.detector.analyze(None);
        assert_eq!(report.correlations.len(), 1);
        let correlation = &report.correlations[0];
        assert_eq!(correlation.services, ("api".to_string(), "zoo".to_string()));
        assert!(correlation.score >= 0.7);
    }

    #[tokio::test]
    async fn quiet_pairs_do_not_correlate() {
        let f = fixture();
        for _ in 0..5 {
            f.clock.advance(1_000);
            f.detector.record_failure("api", "TIMEOUT", "spike");
        }
        // worker fails far outside the sequential window.
        f.clock.advance(30_000);
        f.detector.record_failure("worker", "TIMEOUT", "unrelated");

        let report = f.detector.analyze(None);
        assert!(report.correlations.is_empty());
    }

    #[tokio::test]
    async fn correlation_cache_expires_when_both_sides_quiet() {
        let f = fixture();
        for _ in 0..5 {
            f.clock.advance(1_000);
            f.detector.record_failure("api", "TIMEOUT", "spike");
            f.detector.record_failure("worker", "TIMEOUT", "spike");
        }
        assert!(!f.detector.analyze(None).correlations.is_empty());

        // Both endpoints silent for > 2 windows.
        f.clock.advance(200_000);
        assert!(f.detector.analyze(None).correlations.is_empty());
    }

    #[tokio::test]
    async fn predictions_scale_with_criticality_and_consecutive() {
        let f = fixture();
        for _ in 0..10 {
            f.clock.advance(100);
            f.detector.record_failure("auth", "TIMEOUT", "slow");
        }
        let report = f.detector.analyze(None);
        let prediction =
            report.predictions.iter().find(|p| p.service == "auth").expect("prediction");
        // failure_rate 10/100, multiplier 1.5, consecutive 10/10.
        assert!((prediction.probability - 0.15).abs() < 1e-9);
        assert_eq!(prediction.impact, ImpactSeverity::Critical);
        assert!(prediction
            .recommendations
            .iter()
            .any(|r| r.contains("dependent")));
    }

    struct StubRuntime;
    impl RuntimeInfo for StubRuntime {
        fn bulkhead_state(&self, _service: &str) -> Option<BulkheadState> {
            Some(BulkheadState::Closed)
        }
        fn degradation_level(&self, _service: &str) -> Option<DegradationLevel> {
            Some(DegradationLevel::Minimal)
        }
    }

    #[tokio::test]
    async fn runtime_info_enriches_recommendations() {
        let f = fixture();
        for _ in 0..3 {
            f.detector.record_failure("worker", "TIMEOUT", "x");
        }
        let report = f.detector.analyze(Some(&StubRuntime));
        let prediction = &report.predictions[0];
        assert!(prediction.recommendations.iter().any(|r| r.contains("saturated")));
        assert!(prediction.recommendations.iter().any(|r| r.contains("degraded responses")));
    }
}
