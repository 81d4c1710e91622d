//! Registry of named token buckets with a shared refill ticker.

use crate::clock::{Clock, MonotonicClock};
use crate::error::FabricError;
use crate::token_bucket::{ConsumeGrant, RateLimiterConfig, TokenBucket, TokenBucketStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Cadence of the background refill pass that wakes queued waiters.
pub const REFILL_TICK: Duration = Duration::from_millis(100);

/// Process-wide collection of per-service token buckets.
///
/// One ticker serves every bucket; `destroy` stops it and rejects all queued
/// waiters with `SHUTDOWN`.
pub struct RateLimiterManager {
    buckets: Arc<Mutex<HashMap<String, Arc<TokenBucket>>>>,
    clock: Arc<dyn Clock>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RateLimiterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterManager").finish()
    }
}

impl RateLimiterManager {
    /// Must be called within a tokio runtime; the refill ticker is spawned here.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let buckets: Arc<Mutex<HashMap<String, Arc<TokenBucket>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let tick_buckets = buckets.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFILL_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let snapshot: Vec<Arc<TokenBucket>> = tick_buckets
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .values()
                    .cloned()
                    .collect();
                for bucket in snapshot {
                    bucket.poll();
                }
            }
        });
        Self { buckets, clock, ticker: Mutex::new(Some(ticker)) }
    }

    fn lock_buckets(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TokenBucket>>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create (or replace) the bucket for `service`. Replacement destroys the
    /// previous bucket, rejecting its queued waiters with `SHUTDOWN`.
    pub fn register(&self, service: &str, config: RateLimiterConfig) -> Arc<TokenBucket> {
        let bucket = Arc::new(TokenBucket::with_clock(service, config, self.clock.clone()));
        let previous = self.lock_buckets().insert(service.to_string(), bucket.clone());
        if let Some(previous) = previous {
            previous.destroy();
        }
        bucket
    }

    /// Remove and destroy the bucket for `service`. Unknown names are a no-op.
    pub fn unregister(&self, service: &str) {
        if let Some(bucket) = self.lock_buckets().remove(service) {
            bucket.destroy();
        }
    }

    pub fn get(&self, service: &str) -> Option<Arc<TokenBucket>> {
        self.lock_buckets().get(service).cloned()
    }

    pub fn try_consume<E>(&self, service: &str, n: f64) -> Result<bool, FabricError<E>> {
        match self.get(service) {
            Some(bucket) => Ok(bucket.try_consume(n)),
            None => Err(FabricError::UnknownService { service: service.to_string() }),
        }
    }

    pub async fn consume<E>(
        &self,
        service: &str,
        n: f64,
        max_wait: Duration,
    ) -> Result<ConsumeGrant, FabricError<E>> {
        match self.get(service) {
            Some(bucket) => bucket.consume(n, max_wait).await,
            None => Err(FabricError::UnknownService { service: service.to_string() }),
        }
    }

    pub fn status(&self, service: &str) -> Option<TokenBucketStatus> {
        self.get(service).map(|bucket| bucket.status())
    }

    /// Snapshot every bucket, sorted by service name.
    pub fn statuses(&self) -> Vec<TokenBucketStatus> {
        let mut statuses: Vec<TokenBucketStatus> =
            self.lock_buckets().values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Stop the ticker, destroy every bucket, clear the map.
    pub fn destroy(&self) {
        if let Some(handle) =
            self.ticker.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
        {
            handle.abort();
        }
        let mut buckets = self.lock_buckets();
        for bucket in buckets.values() {
            bucket.destroy();
        }
        buckets.clear();
    }
}

impl Drop for RateLimiterManager {
    fn drop(&mut self) {
        if let Some(handle) =
            self.ticker.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
        {
            handle.abort();
        }
    }
}
