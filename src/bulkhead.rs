//! Bulkhead: a per-service concurrency cap with a bounded FIFO wait queue.
//!
//! Admission rides on `tokio::sync::Semaphore`, which queues acquirers fairly
//! and releases nothing when a waiter is cancelled. The active count is kept
//! by an RAII guard so every admit is released on success, failure, and panic
//! alike.

use crate::error::FabricError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// Zero means fail fast with `BULKHEAD_FULL` instead of queueing.
    pub max_wait: Duration,
    /// Fraction of capacity at which the bulkhead reports itself degraded.
    pub degradation_threshold: f64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 32,
            max_wait: Duration::from_millis(100),
            degradation_threshold: 0.8,
        }
    }
}

const STATE_OPEN: u8 = 0;
const STATE_DEGRADED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Occupancy state; `Closed` means saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkheadState {
    Open,
    Degraded,
    Closed,
}

impl BulkheadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_DEGRADED => BulkheadState::Degraded,
            STATE_CLOSED => BulkheadState::Closed,
            _ => BulkheadState::Open,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BulkheadState::Open => STATE_OPEN,
            BulkheadState::Degraded => STATE_DEGRADED,
            BulkheadState::Closed => STATE_CLOSED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadMetrics {
    pub service: String,
    pub max_concurrent: usize,
    pub active: usize,
    pub waiting: usize,
    pub state: BulkheadState,
    pub total: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub wait_timeouts: u64,
}

type TransitionCallback = Box<dyn Fn(BulkheadState) + Send + Sync>;

/// Concurrency isolation for one service.
pub struct Bulkhead {
    service: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    waiting: AtomicUsize,
    state: AtomicU8,
    total: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    wait_timeouts: AtomicU64,
    transition_callbacks: Mutex<Vec<TransitionCallback>>,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}

struct ActiveGuard<'a> {
    bulkhead: &'a Bulkhead,
}

impl<'a> ActiveGuard<'a> {
    fn enter(bulkhead: &'a Bulkhead) -> Self {
        bulkhead.active.fetch_add(1, Ordering::AcqRel);
        bulkhead.refresh_state();
        Self { bulkhead }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.bulkhead.active.fetch_sub(1, Ordering::AcqRel);
        self.bulkhead.refresh_state();
    }
}

impl Bulkhead {
    pub fn new(service: impl Into<String>, config: BulkheadConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            service: service.into(),
            semaphore: Arc::new(Semaphore::new(permits)),
            config: BulkheadConfig { max_concurrent: permits, ..config },
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            state: AtomicU8::new(STATE_OPEN),
            total: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
            transition_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> BulkheadState {
        BulkheadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Register a callback fired on every state transition.
    pub fn on_transition<F>(&self, callback: F)
    where
        F: Fn(BulkheadState) + Send + Sync + 'static,
    {
        self.transition_callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
    }

    fn compute_state(&self, active: usize) -> BulkheadState {
        let max = self.config.max_concurrent;
        let threshold = (self.config.degradation_threshold * max as f64).ceil() as usize;
        if active >= max {
            BulkheadState::Closed
        } else if active >= threshold {
            BulkheadState::Degraded
        } else {
            BulkheadState::Open
        }
    }

    fn refresh_state(&self) {
        let next = self.compute_state(self.active.load(Ordering::Acquire));
        let previous = self.state.swap(next.as_u8(), Ordering::AcqRel);
        if previous != next.as_u8() {
            tracing::debug!(service = %self.service, from = ?BulkheadState::from_u8(previous), to = ?next, "bulkhead state change");
            let callbacks =
                self.transition_callbacks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for callback in callbacks.iter() {
                callback(next);
            }
        }
    }

    /// Execute under the cap, waiting up to `max_wait` for a slot.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.total.fetch_add(1, Ordering::Relaxed);
        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(tokio::sync::TryAcquireError::Closed) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::Shutdown);
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                if self.config.max_wait.is_zero() {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(FabricError::BulkheadFull {
                        service: self.service.clone(),
                        active: self.active.load(Ordering::Acquire),
                        max: self.config.max_concurrent,
                    });
                }
                self.waiting.fetch_add(1, Ordering::AcqRel);
                let waited = tokio::time::timeout(self.config.max_wait, self.semaphore.acquire());
                let outcome = waited.await;
                self.waiting.fetch_sub(1, Ordering::AcqRel);
                match outcome {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(FabricError::Shutdown);
                    }
                    Err(_elapsed) => {
                        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(FabricError::BulkheadWaitTimeout {
                            service: self.service.clone(),
                            waited: self.config.max_wait,
                        });
                    }
                }
            }
        };

        self.accepted.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard::enter(self);
        let result = operation().await;
        drop(guard);
        drop(permit);
        result
    }

    /// Execute only if a slot is free right now; never waits.
    pub async fn try_execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.total.fetch_add(1, Ordering::Relaxed);
        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(tokio::sync::TryAcquireError::Closed) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::Shutdown);
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::BulkheadFull {
                    service: self.service.clone(),
                    active: self.active.load(Ordering::Acquire),
                    max: self.config.max_concurrent,
                });
            }
        };
        self.accepted.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard::enter(self);
        let result = operation().await;
        drop(guard);
        drop(permit);
        result
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            service: self.service.clone(),
            max_concurrent: self.config.max_concurrent,
            active: self.active.load(Ordering::Acquire),
            waiting: self.waiting.load(Ordering::Acquire),
            state: self.state(),
            total: self.total.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Close the semaphore; queued waiters fail with `SHUTDOWN`.
    pub fn destroy(&self) {
        self.semaphore.close();
    }
}
