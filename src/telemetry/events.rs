//! Fabric events emitted by the reliability components.

use crate::backpressure::PressureLevel;
use crate::latency_budget::ViolationLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Everything observable about the fabric flows through this enum.
///
/// Events are delivered to subscribers in registration order; a subscriber
/// error is logged and swallowed, never surfaced to the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FabricEvent {
    /// A single health probe succeeded.
    HealthCheckPass { service: String },
    /// A single health probe failed or timed out.
    HealthCheckFail { service: String, reason: String },
    /// Consecutive successes crossed the recovery threshold.
    ServiceHealthy { service: String },
    /// Consecutive failures crossed the unhealthy threshold.
    ServiceUnhealthy { service: String, consecutive_failures: u32 },
    /// System pressure moved to a different level.
    PressureChange { from: PressureLevel, to: PressureLevel, score: f64 },
    /// The latest latency sample crossed a violation threshold.
    LatencyViolation { service: String, level: ViolationLevel, value_ms: f64 },
    /// Latency returned below the warning threshold.
    LatencyRecovery { service: String, time_in_violation: Duration },
    /// A service is failing repeatedly and may drag down its dependents.
    CascadeWarning { service: String, consecutive_failures: u32 },
    /// A critical service's failure is visibly propagating.
    CascadeDetected { root: String, propagation_path: Vec<String> },
    /// Error budget remaining fell below the alert threshold.
    BudgetLow { service: String, remaining_fraction: f64 },
    /// Error budget fully consumed.
    BudgetExhausted { service: String },
    /// Budget burn rate exceeds the sustainable rate.
    BurnRateHigh { service: String, burn_rate: f64, expected: f64 },
    /// Availability dropped well below the SLO target.
    AvailabilityDrop { service: String, current: f64, target: f64 },
}

/// Subscription filter; `All` matches every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    HealthCheckPass,
    HealthCheckFail,
    ServiceHealthy,
    ServiceUnhealthy,
    PressureChange,
    LatencyViolation,
    LatencyRecovery,
    CascadeWarning,
    CascadeDetected,
    BudgetLow,
    BudgetExhausted,
    BurnRateHigh,
    AvailabilityDrop,
    All,
}

impl FabricEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            FabricEvent::HealthCheckPass { .. } => EventKind::HealthCheckPass,
            FabricEvent::HealthCheckFail { .. } => EventKind::HealthCheckFail,
            FabricEvent::ServiceHealthy { .. } => EventKind::ServiceHealthy,
            FabricEvent::ServiceUnhealthy { .. } => EventKind::ServiceUnhealthy,
            FabricEvent::PressureChange { .. } => EventKind::PressureChange,
            FabricEvent::LatencyViolation { .. } => EventKind::LatencyViolation,
            FabricEvent::LatencyRecovery { .. } => EventKind::LatencyRecovery,
            FabricEvent::CascadeWarning { .. } => EventKind::CascadeWarning,
            FabricEvent::CascadeDetected { .. } => EventKind::CascadeDetected,
            FabricEvent::BudgetLow { .. } => EventKind::BudgetLow,
            FabricEvent::BudgetExhausted { .. } => EventKind::BudgetExhausted,
            FabricEvent::BurnRateHigh { .. } => EventKind::BurnRateHigh,
            FabricEvent::AvailabilityDrop { .. } => EventKind::AvailabilityDrop,
        }
    }

    /// The service this event concerns, when it concerns exactly one.
    pub fn service(&self) -> Option<&str> {
        match self {
            FabricEvent::HealthCheckPass { service }
            | FabricEvent::HealthCheckFail { service, .. }
            | FabricEvent::ServiceHealthy { service }
            | FabricEvent::ServiceUnhealthy { service, .. }
            | FabricEvent::LatencyViolation { service, .. }
            | FabricEvent::LatencyRecovery { service, .. }
            | FabricEvent::CascadeWarning { service, .. }
            | FabricEvent::BudgetLow { service, .. }
            | FabricEvent::BudgetExhausted { service }
            | FabricEvent::BurnRateHigh { service, .. }
            | FabricEvent::AvailabilityDrop { service, .. } => Some(service),
            FabricEvent::CascadeDetected { root, .. } => Some(root),
            FabricEvent::PressureChange { .. } => None,
        }
    }
}

impl EventKind {
    pub fn matches(&self, event: &FabricEvent) -> bool {
        *self == EventKind::All || *self == event.kind()
    }
}

impl fmt::Display for FabricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricEvent::HealthCheckPass { service } => write!(f, "health_check_pass {}", service),
            FabricEvent::HealthCheckFail { service, reason } => {
                write!(f, "health_check_fail {} ({})", service, reason)
            }
            FabricEvent::ServiceHealthy { service } => write!(f, "service_healthy {}", service),
            FabricEvent::ServiceUnhealthy { service, consecutive_failures } => {
                write!(f, "service_unhealthy {} ({} consecutive)", service, consecutive_failures)
            }
            FabricEvent::PressureChange { from, to, score } => {
                write!(f, "pressure_change {:?} -> {:?} (score {:.1})", from, to, score)
            }
            FabricEvent::LatencyViolation { service, level, value_ms } => {
                write!(f, "latency_violation {} {:?} at {:.1}ms", service, level, value_ms)
            }
            FabricEvent::LatencyRecovery { service, time_in_violation } => {
                write!(f, "latency_recovery {} after {:?}", service, time_in_violation)
            }
            FabricEvent::CascadeWarning { service, consecutive_failures } => {
                write!(f, "cascade_warning {} ({} consecutive)", service, consecutive_failures)
            }
            FabricEvent::CascadeDetected { root, propagation_path } => {
                write!(f, "cascade_detected root={} path={:?}", root, propagation_path)
            }
            FabricEvent::BudgetLow { service, remaining_fraction } => {
                write!(f, "budget_low {} ({:.1}% left)", service, remaining_fraction * 100.0)
            }
            FabricEvent::BudgetExhausted { service } => write!(f, "budget_exhausted {}", service),
            FabricEvent::BurnRateHigh { service, burn_rate, expected } => {
                write!(f, "burn_rate_high {} ({:.2} vs {:.2})", service, burn_rate, expected)
            }
            FabricEvent::AvailabilityDrop { service, current, target } => {
                write!(f, "availability_drop {} ({:.4} vs {:.4})", service, current, target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        let event = FabricEvent::BudgetExhausted { service: "db".into() };
        assert_eq!(event.kind(), EventKind::BudgetExhausted);
        assert!(EventKind::BudgetExhausted.matches(&event));
        assert!(EventKind::All.matches(&event));
        assert!(!EventKind::BudgetLow.matches(&event));
    }

    #[test]
    fn service_accessor() {
        let event = FabricEvent::CascadeDetected {
            root: "auth".into(),
            propagation_path: vec!["auth".into(), "api".into()],
        };
        assert_eq!(event.service(), Some("auth"));

        let event = FabricEvent::PressureChange {
            from: PressureLevel::Normal,
            to: PressureLevel::High,
            score: 61.0,
        };
        assert_eq!(event.service(), None);
    }
}
