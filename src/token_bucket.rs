//! Token-bucket admission control with a FIFO waiter queue.
//!
//! Refill is lazy (every operation tops the bucket up from elapsed time) plus
//! periodic: the owning manager polls each bucket on a ticker so queued
//! waiters wake in bounded time even when the bucket is otherwise idle.

use crate::adaptive::Tunable;
use crate::clock::{Clock, MonotonicClock};
use crate::error::FabricError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Remaining-capacity fraction below which a bucket reports itself throttled.
const THROTTLE_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Tokens added per second.
    pub tokens_per_second: f64,
    /// Bucket capacity; refill clamps here.
    pub max_tokens: f64,
    /// Default deadline for queued `consume` calls.
    pub max_wait: Duration,
    /// Whether `consume` may queue when tokens are short.
    pub queue_enabled: bool,
    /// Queue capacity; further callers fail fast.
    pub max_queue_size: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 100.0,
            max_tokens: 100.0,
            max_wait: Duration::from_millis(500),
            queue_enabled: true,
            max_queue_size: 1024,
        }
    }
}

/// Point-in-time view of a bucket, refreshed before snapshotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketStatus {
    pub service: String,
    pub tokens: f64,
    pub max_tokens: f64,
    pub tokens_per_second: f64,
    pub queue_len: usize,
    pub throttled: bool,
    pub total: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub queued: u64,
}

/// Successful `consume` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeGrant {
    pub waited: Duration,
}

enum QueueSignal {
    Granted,
    Expired,
    Shutdown,
}

struct Waiter {
    needed: f64,
    deadline_millis: u64,
    cancelled: Arc<AtomicBool>,
    tx: oneshot::Sender<QueueSignal>,
}

struct Core {
    tokens: f64,
    last_refill_millis: u64,
    waiters: VecDeque<Waiter>,
    shut_down: bool,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    allowed: AtomicU64,
    rejected: AtomicU64,
    queued: AtomicU64,
}

/// A single service's token bucket.
pub struct TokenBucket {
    service: String,
    config: Tunable<RateLimiterConfig>,
    core: Mutex<Core>,
    counters: Counters,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket").field("service", &self.service).finish()
    }
}

impl TokenBucket {
    pub fn new(service: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self::with_clock(service, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        service: impl Into<String>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            service: service.into(),
            core: Mutex::new(Core {
                tokens: config.max_tokens,
                last_refill_millis: now,
                waiters: VecDeque::new(),
                shut_down: false,
            }),
            config: Tunable::new(config),
            counters: Counters::default(),
            clock,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> Arc<RateLimiterConfig> {
        self.config.get()
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill_locked(&self, core: &mut Core, cfg: &RateLimiterConfig) {
        let now = self.clock.now_millis();
        let elapsed = now.saturating_sub(core.last_refill_millis);
        if elapsed > 0 {
            let added = (elapsed as f64 / 1_000.0) * cfg.tokens_per_second;
            core.tokens = (core.tokens + added).min(cfg.max_tokens);
            core.last_refill_millis = now;
        }
        // A shrunk capacity clamps immediately.
        core.tokens = core.tokens.min(cfg.max_tokens);
    }

    fn drain_locked(&self, core: &mut Core) {
        let now = self.clock.now_millis();
        while let Some(front) = core.waiters.front() {
            if front.cancelled.load(Ordering::Acquire) {
                core.waiters.pop_front();
                continue;
            }
            if front.deadline_millis <= now {
                if let Some(waiter) = core.waiters.pop_front() {
                    let _ = waiter.tx.send(QueueSignal::Expired);
                }
                continue;
            }
            if core.tokens >= front.needed {
                let waiter = match core.waiters.pop_front() {
                    Some(w) => w,
                    None => break,
                };
                let needed = waiter.needed;
                // Deduct only when the waiter is still listening; a dropped
                // receiver must not consume tokens.
                if waiter.tx.send(QueueSignal::Granted).is_ok() {
                    core.tokens -= needed;
                }
                continue;
            }
            break;
        }
    }

    /// Refill and wake any satisfiable waiters; called by the manager ticker.
    pub fn poll(&self) {
        let cfg = self.config.get();
        let mut core = self.lock_core();
        if core.shut_down {
            return;
        }
        self.refill_locked(&mut core, &cfg);
        self.drain_locked(&mut core);
    }

    /// Non-blocking consume. Queued waiters are never overtaken.
    pub fn try_consume(&self, n: f64) -> bool {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let cfg = self.config.get();
        let mut core = self.lock_core();
        if core.shut_down {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.refill_locked(&mut core, &cfg);
        self.drain_locked(&mut core);
        if core.waiters.is_empty() && core.tokens >= n {
            core.tokens -= n;
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Consume `n` tokens, waiting up to `max_wait` in FIFO order if needed.
    pub async fn consume<E>(&self, n: f64, max_wait: Duration) -> Result<ConsumeGrant, FabricError<E>> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let cfg = self.config.get();

        let (rx, cancelled) = {
            let mut core = self.lock_core();
            if core.shut_down {
                return Err(FabricError::Shutdown);
            }
            self.refill_locked(&mut core, &cfg);
            self.drain_locked(&mut core);

            if core.waiters.is_empty() && core.tokens >= n {
                core.tokens -= n;
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                return Ok(ConsumeGrant { waited: Duration::ZERO });
            }
            if !cfg.queue_enabled || max_wait.is_zero() {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::RateLimitExceeded {
                    service: self.service.clone(),
                    remaining: core.tokens,
                });
            }
            if core.waiters.len() >= cfg.max_queue_size {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::RateLimitQueueFull {
                    service: self.service.clone(),
                    queue_len: core.waiters.len(),
                    max: cfg.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel();
            let cancelled = Arc::new(AtomicBool::new(false));
            let deadline_millis =
                self.clock.now_millis().saturating_add(max_wait.as_millis() as u64);
            core.waiters.push_back(Waiter {
                needed: n,
                deadline_millis,
                cancelled: cancelled.clone(),
                tx,
            });
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            (rx, cancelled)
        };

        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(QueueSignal::Granted)) => {
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                Ok(ConsumeGrant { waited: started.elapsed() })
            }
            Ok(Ok(QueueSignal::Expired)) | Err(_) => {
                // Mark so the drain loop discards this node without a scan.
                cancelled.store(true, Ordering::Release);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(FabricError::RateLimitTimeout {
                    service: self.service.clone(),
                    waited: started.elapsed(),
                })
            }
            Ok(Ok(QueueSignal::Shutdown)) | Ok(Err(_)) => {
                cancelled.store(true, Ordering::Release);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(FabricError::Shutdown)
            }
        }
    }

    /// Re-target the bucket. Queued waiters are carried across and drain
    /// under the new rate.
    pub fn reconfigure(&self, tokens_per_second: f64, max_tokens: f64) {
        self.config.update(|cfg| RateLimiterConfig {
            tokens_per_second,
            max_tokens,
            ..cfg.clone()
        });
        self.poll();
        tracing::debug!(
            service = %self.service,
            rate = tokens_per_second,
            max = max_tokens,
            "token bucket re-targeted"
        );
    }

    pub fn status(&self) -> TokenBucketStatus {
        let cfg = self.config.get();
        let mut core = self.lock_core();
        if !core.shut_down {
            self.refill_locked(&mut core, &cfg);
            self.drain_locked(&mut core);
        }
        TokenBucketStatus {
            service: self.service.clone(),
            tokens: core.tokens,
            max_tokens: cfg.max_tokens,
            tokens_per_second: cfg.tokens_per_second,
            queue_len: core.waiters.len(),
            throttled: core.tokens < cfg.max_tokens * THROTTLE_FRACTION,
            total: self.counters.total.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
        }
    }

    /// Reject all queued waiters and refuse further work.
    pub fn destroy(&self) {
        let mut core = self.lock_core();
        core.shut_down = true;
        while let Some(waiter) = core.waiters.pop_front() {
            let _ = waiter.tx.send(QueueSignal::Shutdown);
        }
    }
}
