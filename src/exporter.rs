//! Metrics collection and export: JSON, Prometheus text, human summary.

use crate::bulkhead::{BulkheadMetrics, BulkheadState};
use crate::cascade::CascadeReport;
use crate::error_budget::ErrorBudgetStatus;
use crate::latency_budget::{LatencyStats, ViolationLevel};
use crate::orchestrator::FabricCore;
use crate::policy::PolicyMetrics;
use crate::registry::{HealthState, ServiceSnapshot};
use crate::token_bucket::TokenBucketStatus;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Output format for [`MetricsExporter::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    Json,
    Prometheus,
    Summary,
}

/// Health-score weights per component family.
const WEIGHT_SERVICES: f64 = 0.25;
const WEIGHT_RATE_LIMITERS: f64 = 0.10;
const WEIGHT_BULKHEADS: f64 = 0.15;
const WEIGHT_ERROR_BUDGETS: f64 = 0.20;
const WEIGHT_LATENCY_BUDGETS: f64 = 0.20;
const WEIGHT_DEPENDENCIES: f64 = 0.10;

/// Everything the fabric knows, at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricSnapshot {
    pub at_millis: u64,
    pub health_score: f64,
    pub services: Vec<ServiceSnapshot>,
    pub rate_limiters: Vec<TokenBucketStatus>,
    pub bulkheads: Vec<BulkheadMetrics>,
    pub policies: Vec<PolicyMetrics>,
    pub error_budgets: Vec<ErrorBudgetStatus>,
    pub latency_budgets: Vec<LatencyStats>,
    pub pressure: crate::backpressure::PressureStatus,
    pub cascade: CascadeReport,
    pub cascade_risk_level: u8,
    pub dependency_cycles: Vec<Vec<String>>,
}

/// Periodically harvests component snapshots and renders them on demand.
pub struct MetricsExporter {
    core: Arc<FabricCore>,
    interval: Duration,
    last: Mutex<Option<FabricSnapshot>>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter").finish()
    }
}

impl MetricsExporter {
    pub(crate) fn new(core: Arc<FabricCore>, interval: Duration) -> Self {
        Self { core, interval, last: Mutex::new(None), collector: Mutex::new(None) }
    }

    /// Spawn the periodic collection loop.
    pub(crate) fn start(self: &Arc<Self>) {
        self.stop();
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(exporter) => {
                        exporter.collect();
                    }
                    None => break,
                }
            }
        });
        *self.collector.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub(crate) fn stop(&self) {
        if let Some(handle) = self.collector.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    /// Harvest a fresh snapshot (also feeds observations back into the
    /// registry and adaptive controllers) and cache it.
    pub fn collect(&self) -> FabricSnapshot {
        let core = &self.core;
        core.feed_observations();

        let services = core.registry.snapshots();
        let rate_limiters = core.rate_limiters.statuses();
        let (bulkheads, policies) = {
            let map = core.services.lock().unwrap_or_else(|p| p.into_inner());
            let mut bulkheads: Vec<BulkheadMetrics> =
                map.values().filter_map(|c| c.bulkhead.as_ref().map(|b| b.metrics())).collect();
            bulkheads.sort_by(|a, b| a.service.cmp(&b.service));
            let mut policies: Vec<PolicyMetrics> =
                map.values().map(|c| c.policy.metrics()).collect();
            policies.sort_by(|a, b| a.service.cmp(&b.service));
            (bulkheads, policies)
        };
        let error_budgets = core.error_budgets.statuses();
        let latency_budgets = core.latency_budgets.all_stats();
        let pressure = core.backpressure.status();
        let cascade = core.cascade.last_report();
        let cascade_risk_level = core.cascade.risk_level();
        let dependency_cycles = core.graph.find_cycles();

        let health_score = health_score(
            &services,
            &rate_limiters,
            &bulkheads,
            &error_budgets,
            &latency_budgets,
            &dependency_scores(core, &services),
        );

        let snapshot = FabricSnapshot {
            at_millis: core.clock.now_millis(),
            health_score,
            services,
            rate_limiters,
            bulkheads,
            policies,
            error_budgets,
            latency_budgets,
            pressure,
            cascade,
            cascade_risk_level,
            dependency_cycles,
        };
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot.clone());
        snapshot
    }

    /// The most recent snapshot, collecting one if none exists yet.
    pub fn latest(&self) -> FabricSnapshot {
        let cached = self.last.lock().unwrap_or_else(|p| p.into_inner()).clone();
        cached.unwrap_or_else(|| self.collect())
    }

    pub fn export(&self, format: ExportFormat) -> String {
        let snapshot = self.collect();
        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(&snapshot).unwrap_or_else(|e| {
                    tracing::error!(error = %e, "snapshot serialization failed");
                    "{}".to_string()
                })
            }
            ExportFormat::Prometheus => prometheus_text(&snapshot),
            ExportFormat::Summary => summary_text(&snapshot),
        }
    }
}

fn dependency_scores(core: &FabricCore, services: &[ServiceSnapshot]) -> Vec<f64> {
    services
        .iter()
        .filter(|s| !s.dependencies.is_empty())
        .map(|s| {
            let all_healthy = s.dependencies.iter().all(|dep| {
                core.registry.health(dep).map(|h| h == HealthState::Healthy).unwrap_or(false)
            });
            if all_healthy {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

fn average(scores: impl Iterator<Item = f64>) -> Option<f64> {
    let collected: Vec<f64> = scores.collect();
    if collected.is_empty() {
        None
    } else {
        Some(collected.iter().sum::<f64>() / collected.len() as f64)
    }
}

/// Weighted overall health in [0, 100]. Families with no members count as
/// fully healthy.
fn health_score(
    services: &[ServiceSnapshot],
    rate_limiters: &[TokenBucketStatus],
    bulkheads: &[BulkheadMetrics],
    error_budgets: &[ErrorBudgetStatus],
    latency_budgets: &[LatencyStats],
    dependency_scores: &[f64],
) -> f64 {
    let service_score = average(services.iter().map(|s| match s.health {
        HealthState::Healthy => 1.0,
        HealthState::Degraded => 0.5,
        HealthState::Unhealthy | HealthState::Offline => 0.0,
    }))
    .unwrap_or(1.0);

    let limiter_score =
        average(rate_limiters.iter().map(|r| if r.throttled { 0.0 } else { 1.0 })).unwrap_or(1.0);

    let bulkhead_score = average(bulkheads.iter().map(|b| match b.state {
        BulkheadState::Open => 1.0,
        BulkheadState::Degraded => 0.5,
        BulkheadState::Closed => 0.0,
    }))
    .unwrap_or(1.0);

    let budget_score = average(error_budgets.iter().map(|b| {
        (b.remaining_budget.max(0) as f64 / b.total_budget.max(1) as f64).clamp(0.0, 1.0)
    }))
    .unwrap_or(1.0);

    let latency_score = average(latency_budgets.iter().map(|l| match l.violation {
        ViolationLevel::None => 1.0,
        ViolationLevel::Warning => 0.66,
        ViolationLevel::Critical => 0.33,
        ViolationLevel::Breach => 0.0,
    }))
    .unwrap_or(1.0);

    let dependency_score =
        average(dependency_scores.iter().copied()).unwrap_or(1.0);

    100.0
        * (WEIGHT_SERVICES * service_score
            + WEIGHT_RATE_LIMITERS * limiter_score
            + WEIGHT_BULKHEADS * bulkhead_score
            + WEIGHT_ERROR_BUDGETS * budget_score
            + WEIGHT_LATENCY_BUDGETS * latency_score
            + WEIGHT_DEPENDENCIES * dependency_score)
}

fn epoch_millis() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

/// Prometheus text exposition: one gauge line per metric with a millisecond
/// timestamp.
fn prometheus_text(snapshot: &FabricSnapshot) -> String {
    let ts = epoch_millis();
    let mut out = String::new();
    let mut gauge = |name: &str, help: &str, value: f64| {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} gauge", name);
        let _ = writeln!(out, "{} {} {}", name, value, ts);
    };

    gauge(
        "reliability_health_score",
        "Weighted overall fabric health (0-100)",
        snapshot.health_score,
    );
    gauge(
        "reliability_services_total",
        "Registered services",
        snapshot.services.len() as f64,
    );
    gauge(
        "reliability_services_healthy",
        "Services currently healthy",
        snapshot.services.iter().filter(|s| s.health == HealthState::Healthy).count() as f64,
    );
    gauge(
        "reliability_services_degraded",
        "Services currently degraded",
        snapshot.services.iter().filter(|s| s.health == HealthState::Degraded).count() as f64,
    );
    gauge(
        "reliability_services_unhealthy",
        "Services currently unhealthy or offline",
        snapshot.services.iter().filter(|s| s.health.is_down()).count() as f64,
    );
    gauge(
        "reliability_rate_limiters_throttled",
        "Rate limiters below 10% of capacity",
        snapshot.rate_limiters.iter().filter(|r| r.throttled).count() as f64,
    );
    gauge(
        "reliability_rate_limiters_total_requests",
        "Requests seen by all rate limiters",
        snapshot.rate_limiters.iter().map(|r| r.total).sum::<u64>() as f64,
    );
    gauge(
        "reliability_rate_limiters_rejected_requests",
        "Requests rejected by all rate limiters",
        snapshot.rate_limiters.iter().map(|r| r.rejected).sum::<u64>() as f64,
    );
    gauge(
        "reliability_error_budgets_exhausted",
        "Services with no error budget remaining",
        snapshot.error_budgets.iter().filter(|b| b.remaining_budget <= 0).count() as f64,
    );
    gauge(
        "reliability_latency_budgets_breached",
        "Services whose latest latency breached the budget",
        snapshot
            .latency_budgets
            .iter()
            .filter(|l| l.violation == ViolationLevel::Breach)
            .count() as f64,
    );
    gauge(
        "reliability_cascade_risk_level",
        "Cascade risk: 1 low, 2 medium, 3 high, 4 critical",
        snapshot.cascade_risk_level as f64,
    );
    out
}

fn summary_text(snapshot: &FabricSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "reliability fabric summary");
    let _ = writeln!(out, "  health score: {:.1}/100", snapshot.health_score);
    let healthy =
        snapshot.services.iter().filter(|s| s.health == HealthState::Healthy).count();
    let _ = writeln!(
        out,
        "  services: {} total, {} healthy, {} degraded, {} down",
        snapshot.services.len(),
        healthy,
        snapshot.services.iter().filter(|s| s.health == HealthState::Degraded).count(),
        snapshot.services.iter().filter(|s| s.health.is_down()).count(),
    );
    let _ = writeln!(
        out,
        "  pressure: {:?} (score {:.1}, shedding: {})",
        snapshot.pressure.level, snapshot.pressure.score, snapshot.pressure.shedding
    );
    let _ = writeln!(
        out,
        "  rate limiters: {} registered, {} throttled",
        snapshot.rate_limiters.len(),
        snapshot.rate_limiters.iter().filter(|r| r.throttled).count()
    );
    let _ = writeln!(
        out,
        "  bulkheads: {} registered, {} saturated",
        snapshot.bulkheads.len(),
        snapshot.bulkheads.iter().filter(|b| b.state == BulkheadState::Closed).count()
    );
    let _ = writeln!(
        out,
        "  error budgets: {} tracked, {} exhausted",
        snapshot.error_budgets.len(),
        snapshot.error_budgets.iter().filter(|b| b.remaining_budget <= 0).count()
    );
    let _ = writeln!(
        out,
        "  latency: {} tracked, {} in violation",
        snapshot.latency_budgets.len(),
        snapshot
            .latency_budgets
            .iter()
            .filter(|l| l.violation != ViolationLevel::None)
            .count()
    );
    let _ = writeln!(out, "  cascade risk: {}/4", snapshot.cascade_risk_level);
    if !snapshot.dependency_cycles.is_empty() {
        let _ = writeln!(
            out,
            "  dependency cycles detected: {:?}",
            snapshot.dependency_cycles
        );
    }
    for prediction in &snapshot.cascade.predictions {
        let _ = writeln!(
            out,
            "  prediction: {} p={:.2} ({:?})",
            prediction.service, prediction.probability, prediction.impact
        );
    }
    out
}

impl Drop for MetricsExporter {
    fn drop(&mut self) {
        self.stop();
    }
}
