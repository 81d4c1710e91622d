//! Per-service configuration tree and validation.

use crate::adaptive::AdaptiveConfig;
use crate::bulkhead::BulkheadConfig;
use crate::error_budget::SloConfig;
use crate::health::HealthCheckConfig;
use crate::latency_budget::LatencyBudgetConfig;
use crate::policy::PolicyConfig;
use crate::registry::{Criticality, ServiceRegistration, SloThresholds};
use crate::timeout::TimeoutError;
use crate::token_bucket::RateLimiterConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("service name must not be empty")]
    EmptyName,
    #[error("{field} must be > 0 (got {value})")]
    NonPositive { field: &'static str, value: f64 },
    #[error("{field} must be within [0, 1] (got {value})")]
    OutOfUnitRange { field: &'static str, value: f64 },
    #[error("a service cannot depend on itself ({service})")]
    SelfDependency { service: String },
    #[error("invalid timeout: {source}")]
    InvalidTimeout {
        #[source]
        source: TimeoutError,
    },
}

/// Everything the fabric needs to guard one service. Optional sections leave
/// the corresponding component unconfigured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Free-form type tag ("database", "cache", ...).
    pub kind: String,
    pub criticality: Criticality,
    pub dependencies: Vec<String>,
    pub slo_thresholds: SloThresholds,
    pub health_check: Option<HealthCheckConfig>,
    pub rate_limiter: Option<RateLimiterConfig>,
    pub adaptive: Option<AdaptiveConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub policy: Option<PolicyConfig>,
    pub slo: Option<SloConfig>,
    pub latency_budget: Option<LatencyBudgetConfig>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "service".to_string(),
            criticality: Criticality::Medium,
            dependencies: Vec::new(),
            slo_thresholds: SloThresholds::default(),
            health_check: None,
            rate_limiter: None,
            adaptive: None,
            bulkhead: None,
            policy: None,
            slo: None,
            latency_budget: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    pub fn adaptive(mut self, config: AdaptiveConfig) -> Self {
        self.adaptive = Some(config);
        self
    }

    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn policy(mut self, config: PolicyConfig) -> Self {
        self.policy = Some(config);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    pub fn slo(mut self, config: SloConfig) -> Self {
        self.slo = Some(config);
        self
    }

    pub fn latency_budget(mut self, config: LatencyBudgetConfig) -> Self {
        self.latency_budget = Some(config);
        self
    }

    /// Check every section before anything is registered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.dependencies.iter().any(|d| d == &self.name) {
            return Err(ConfigError::SelfDependency { service: self.name.clone() });
        }

        if let Some(rl) = &self.rate_limiter {
            positive("rate_limiter.tokens_per_second", rl.tokens_per_second)?;
            positive("rate_limiter.max_tokens", rl.max_tokens)?;
        }
        if let Some(adaptive) = &self.adaptive {
            positive("adaptive.min_rate", adaptive.min_rate)?;
            positive("adaptive.max_rate", adaptive.max_rate)?;
            positive("adaptive.scale_up", adaptive.scale_up)?;
            positive("adaptive.scale_down", adaptive.scale_down)?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            positive("bulkhead.max_concurrent", bulkhead.max_concurrent as f64)?;
            unit_range("bulkhead.degradation_threshold", bulkhead.degradation_threshold)?;
        }
        if let Some(policy) = &self.policy {
            if let Some(timeout) = policy.timeout {
                crate::timeout::TimeoutPolicy::new(timeout)
                    .map_err(|source| ConfigError::InvalidTimeout { source })?;
            }
            if let Some(retry) = &policy.retry {
                positive("policy.retry.max_attempts", retry.max_attempts as f64)?;
                positive("policy.retry.multiplier", retry.multiplier)?;
            }
        }
        if let Some(slo) = &self.slo {
            unit_range("slo.target_availability", slo.target_availability)?;
            positive("slo.window_secs", slo.window.as_secs_f64())?;
            unit_range("slo.alert_threshold", slo.alert_threshold)?;
            positive("slo.burn_rate_alert_threshold", slo.burn_rate_alert_threshold)?;
        }
        if let Some(budget) = &self.latency_budget {
            positive("latency_budget.target_ms", budget.target_ms)?;
            positive("latency_budget.window_size", budget.window_size as f64)?;
        }
        positive("slo_thresholds.max_response_time_ms", self.slo_thresholds.max_response_time_ms)?;
        unit_range("slo_thresholds.min_availability", self.slo_thresholds.min_availability)?;
        Ok(())
    }

    /// The registry-facing portion of this config.
    pub fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            name: self.name.clone(),
            kind: self.kind.clone(),
            criticality: self.criticality,
            dependencies: self.dependencies.clone(),
            slo: self.slo_thresholds,
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

fn unit_range(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { field, value })
    }
}
