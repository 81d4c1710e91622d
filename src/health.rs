//! Health-check scheduling and probe state tracking.
//!
//! Each scheduled service gets its own probe task running at a
//! criticality-defaulted cadence; probes run under a timeout and feed
//! consecutive-success/failure counters. Threshold crossings emit events and
//! invoke the transition hook (wired to dependency-graph propagation by the
//! fabric).

use crate::registry::{Criticality, HealthState, ServiceRegistry};
use crate::telemetry::{EventBus, FabricEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe cadence; `None` uses the criticality default.
    pub interval: Option<Duration>,
    /// A probe that runs longer than this counts as a failure.
    pub timeout: Duration,
    /// Consecutive failures before the service is declared unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes before it is declared healthy again.
    pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: None,
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

/// An async health probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), BoxError>;
}

struct FnProbe<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn check(&self) -> Result<(), BoxError> {
        (self.f)().await
    }
}

/// Wrap an async closure as a [`HealthProbe`].
pub fn probe_fn<F, Fut>(f: F) -> Arc<dyn HealthProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(FnProbe { f })
}

/// Per-service probe bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeStatus {
    pub service: String,
    pub healthy: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

struct ProbeState {
    thresholds: HealthCheckConfig,
    healthy: AtomicBool,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl ProbeState {
    fn new(thresholds: HealthCheckConfig) -> Self {
        Self {
            thresholds,
            healthy: AtomicBool::new(true),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }
}

type TransitionHook = Arc<dyn Fn(&str, HealthState) + Send + Sync>;

struct SchedulerShared {
    states: Mutex<HashMap<String, Arc<ProbeState>>>,
    registry: Arc<ServiceRegistry>,
    bus: EventBus,
    transition_hook: Mutex<Option<TransitionHook>>,
}

impl SchedulerShared {
    fn apply_result(&self, service: &str, ok: bool, reason: Option<String>) {
        self.registry.record_check(service, ok);

        let state = {
            let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
            states
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(ProbeState::new(HealthCheckConfig::default())))
                .clone()
        };

        if ok {
            self.bus.emit(FabricEvent::HealthCheckPass { service: service.to_string() });
            state.consecutive_failures.store(0, Ordering::Release);
            let successes = state.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if !state.healthy.load(Ordering::Acquire)
                && successes >= state.thresholds.success_threshold
                && !state.healthy.swap(true, Ordering::AcqRel)
            {
                tracing::info!(service, successes, "service back to healthy");
                self.bus.emit(FabricEvent::ServiceHealthy { service: service.to_string() });
                self.fire_hook(service, HealthState::Healthy);
            }
        } else {
            self.bus.emit(FabricEvent::HealthCheckFail {
                service: service.to_string(),
                reason: reason.unwrap_or_else(|| "probe failed".to_string()),
            });
            state.consecutive_successes.store(0, Ordering::Release);
            let failures = state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= state.thresholds.failure_threshold
                && state.healthy.swap(false, Ordering::AcqRel)
            {
                tracing::warn!(service, failures, "service declared unhealthy");
                self.bus.emit(FabricEvent::ServiceUnhealthy {
                    service: service.to_string(),
                    consecutive_failures: failures,
                });
                self.fire_hook(service, HealthState::Unhealthy);
            }
        }
    }

    fn fire_hook(&self, service: &str, health: HealthState) {
        let hook = self
            .transition_hook
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(service, health);
        }
    }
}

/// Owns one probe task per scheduled service.
pub struct HealthCheckScheduler {
    shared: Arc<SchedulerShared>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthCheckScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckScheduler").finish()
    }
}

impl HealthCheckScheduler {
    pub fn new(registry: Arc<ServiceRegistry>, bus: EventBus) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                states: Mutex::new(HashMap::new()),
                registry,
                bus,
                transition_hook: Mutex::new(None),
            }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Invoked synchronously from the probe task on every health transition.
    pub fn set_transition_hook<F>(&self, hook: F)
    where
        F: Fn(&str, HealthState) + Send + Sync + 'static,
    {
        *self.shared.transition_hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(hook));
    }

    /// Start probing `service`; an existing schedule is replaced.
    pub fn schedule(
        &self,
        service: &str,
        criticality: Criticality,
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) {
        self.unschedule(service);

        let interval = config.interval.unwrap_or_else(|| criticality.default_probe_interval());
        let timeout = config.timeout;
        let state = Arc::new(ProbeState::new(config));
        self.shared
            .states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(service.to_string(), state);

        let shared = self.shared.clone();
        let name = service.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = tokio::time::timeout(timeout, probe.check()).await;
                let (ok, reason) = match outcome {
                    Ok(Ok(())) => (true, None),
                    Ok(Err(err)) => (false, Some(err.to_string())),
                    Err(_) => (false, Some(format!("probe timed out after {:?}", timeout))),
                };
                shared.apply_result(&name, ok, reason);
            }
        });
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).insert(service.to_string(), handle);
    }

    /// Stop probing `service`; unknown names are a no-op.
    pub fn unschedule(&self, service: &str) {
        if let Some(handle) =
            self.tasks.lock().unwrap_or_else(|p| p.into_inner()).remove(service)
        {
            handle.abort();
        }
        self.shared.states.lock().unwrap_or_else(|p| p.into_inner()).remove(service);
    }

    /// Feed an externally produced probe result through the same transition
    /// logic as scheduled probes.
    pub fn record_probe_result(&self, service: &str, healthy: bool, details: Option<String>) {
        self.shared.apply_result(service, healthy, details);
    }

    pub fn is_healthy(&self, service: &str) -> Option<bool> {
        self.shared
            .states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(service)
            .map(|s| s.healthy.load(Ordering::Acquire))
    }

    pub fn status(&self, service: &str) -> Option<ProbeStatus> {
        self.shared.states.lock().unwrap_or_else(|p| p.into_inner()).get(service).map(|s| {
            ProbeStatus {
                service: service.to_string(),
                healthy: s.healthy.load(Ordering::Acquire),
                consecutive_successes: s.consecutive_successes.load(Ordering::Acquire),
                consecutive_failures: s.consecutive_failures.load(Ordering::Acquire),
            }
        })
    }

    /// Stop every probe task and clear all state.
    pub fn destroy(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        self.shared.states.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl Drop for HealthCheckScheduler {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}
