//! Service registry: registrations, health, incidents, reliability scoring.

use crate::clock::{Clock, MonotonicClock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Incidents kept per service.
const MAX_INCIDENTS: usize = 100;

/// How much a service matters; drives probe cadence and cascade weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Criticality {
    Critical,
    High,
    Medium,
    Low,
}

impl Criticality {
    /// Default health-probe cadence for this tier.
    pub fn default_probe_interval(&self) -> Duration {
        match self {
            Criticality::Critical => Duration::from_secs(15),
            Criticality::High => Duration::from_secs(30),
            Criticality::Medium => Duration::from_secs(60),
            Criticality::Low => Duration::from_secs(120),
        }
    }

    /// Weight applied to failure-probability predictions.
    pub fn cascade_multiplier(&self) -> f64 {
        match self {
            Criticality::Critical => 1.5,
            Criticality::High => 1.2,
            _ => 1.0,
        }
    }
}

/// Coarse service health as tracked by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HealthState {
    /// Unhealthy or offline: states that propagate hard through REQUIRED edges.
    pub fn is_down(&self) -> bool {
        matches!(self, HealthState::Unhealthy | HealthState::Offline)
    }
}

/// SLO thresholds the reliability score is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloThresholds {
    pub max_response_time_ms: f64,
    pub min_availability: f64,
}

impl Default for SloThresholds {
    fn default() -> Self {
        Self { max_response_time_ms: 1_000.0, min_availability: 0.99 }
    }
}

/// Immutable registration data for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    /// Free-form type tag ("database", "api", ...).
    pub kind: String,
    pub criticality: Criticality,
    pub dependencies: Vec<String>,
    pub slo: SloThresholds,
}

/// A recorded health transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub at_millis: u64,
    pub health: HealthState,
    pub reason: String,
}

struct ServiceEntry {
    registration: ServiceRegistration,
    health: HealthState,
    last_check_millis: Option<u64>,
    incidents: VecDeque<Incident>,
    availability: f64,
    avg_response_time_ms: f64,
    checks_total: u64,
    checks_degraded: u64,
}

impl ServiceEntry {
    fn new(registration: ServiceRegistration) -> Self {
        Self {
            registration,
            health: HealthState::Healthy,
            last_check_millis: None,
            incidents: VecDeque::new(),
            availability: 1.0,
            avg_response_time_ms: 0.0,
            checks_total: 0,
            checks_degraded: 0,
        }
    }

    fn degradation_rate(&self) -> f64 {
        if self.checks_total == 0 {
            0.0
        } else {
            100.0 * self.checks_degraded as f64 / self.checks_total as f64
        }
    }

    fn reliability_score(&self) -> f64 {
        let slo = &self.registration.slo;
        let availability_part =
            40.0 * (self.availability / slo.min_availability).min(1.0);
        let latency_part =
            30.0 * (1.0 - self.avg_response_time_ms / slo.max_response_time_ms).max(0.0);
        let degradation_part = 30.0 * (1.0 - self.degradation_rate() / 100.0).max(0.0);
        availability_part + latency_part + degradation_part
    }
}

/// Public point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub kind: String,
    pub criticality: Criticality,
    pub dependencies: Vec<String>,
    pub health: HealthState,
    pub last_check_millis: Option<u64>,
    pub availability: f64,
    pub avg_response_time_ms: f64,
    pub degradation_rate: f64,
    pub reliability_score: f64,
    pub incident_count: usize,
}

/// Process-wide store of service registrations and their runtime health.
pub struct ServiceRegistry {
    entries: Mutex<HashMap<String, ServiceEntry>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").field("services", &self.len()).finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServiceEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a service; an existing entry is replaced atomically.
    pub fn register(&self, registration: ServiceRegistration) {
        let name = registration.name.clone();
        self.lock().insert(name.clone(), ServiceEntry::new(registration));
        tracing::debug!(service = %name, "service registered");
    }

    /// Remove a service. Unknown names are a no-op.
    pub fn unregister(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn registration(&self, name: &str) -> Option<ServiceRegistration> {
        self.lock().get(name).map(|e| e.registration.clone())
    }

    pub fn health(&self, name: &str) -> Option<HealthState> {
        self.lock().get(name).map(|e| e.health)
    }

    pub fn criticality(&self, name: &str) -> Option<Criticality> {
        self.lock().get(name).map(|e| e.registration.criticality)
    }

    /// Services whose declared dependencies include `dependency`.
    pub fn dependents_of(&self, dependency: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.registration.dependencies.iter().any(|d| d == dependency))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Set health directly, recording an incident on every transition.
    pub fn set_health(&self, name: &str, health: HealthState, reason: &str) -> Option<HealthState> {
        let mut entries = self.lock();
        let entry = entries.get_mut(name)?;
        let previous = entry.health;
        if previous != health {
            entry.health = health;
            if entry.incidents.len() >= MAX_INCIDENTS {
                entry.incidents.pop_front();
            }
            entry.incidents.push_back(Incident {
                at_millis: self.clock.now_millis(),
                health,
                reason: reason.to_string(),
            });
        }
        Some(previous)
    }

    /// Record a probe outcome; feeds the degradation-rate component of the
    /// reliability score.
    pub fn record_check(&self, name: &str, healthy: bool) {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(name) {
            entry.last_check_millis = Some(now);
            entry.checks_total += 1;
            if !healthy {
                entry.checks_degraded += 1;
            }
        }
    }

    /// Feed measured availability and average response time.
    pub fn record_observation(&self, name: &str, availability: f64, avg_response_time_ms: f64) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(name) {
            entry.availability = availability.clamp(0.0, 1.0);
            entry.avg_response_time_ms = avg_response_time_ms.max(0.0);
        }
    }

    pub fn reliability_score(&self, name: &str) -> Option<f64> {
        self.lock().get(name).map(|e| e.reliability_score())
    }

    pub fn incidents(&self, name: &str) -> Vec<Incident> {
        self.lock().get(name).map(|e| e.incidents.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn snapshot(&self, name: &str) -> Option<ServiceSnapshot> {
        self.lock().get(name).map(|entry| ServiceSnapshot {
            name: entry.registration.name.clone(),
            kind: entry.registration.kind.clone(),
            criticality: entry.registration.criticality,
            dependencies: entry.registration.dependencies.clone(),
            health: entry.health,
            last_check_millis: entry.last_check_millis,
            availability: entry.availability,
            avg_response_time_ms: entry.avg_response_time_ms,
            degradation_rate: entry.degradation_rate(),
            reliability_score: entry.reliability_score(),
            incident_count: entry.incidents.len(),
        })
    }

    /// Snapshots of all services, sorted by name.
    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let names = self.names();
        names.into_iter().filter_map(|n| self.snapshot(&n)).collect()
    }

    /// Drop everything.
    pub fn destroy(&self) {
        self.lock().clear();
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
