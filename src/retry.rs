//! Retry policy with exponential backoff, jitter, and cooperative cancellation.

use crate::error::{FabricError, MAX_RETRY_FAILURES};
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Plain-data retry settings, convertible into a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Error-kind tags eligible for retry; `None` means every transient kind.
    pub retryable_kinds: Option<Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            retryable_kinds: None,
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&FabricError<E>) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    rng: Arc<Mutex<StdRng>>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Build a policy straight from plain config.
    pub fn from_config(config: &RetryConfig) -> Self {
        let kinds = config.retryable_kinds.clone();
        let mut builder = Self::builder()
            .max_attempts(config.max_attempts.max(1))
            .backoff(Backoff::new(config.initial_delay, config.multiplier, config.max_delay))
            .with_jitter(if config.jitter { Jitter::Equal } else { Jitter::None });
        if let Some(kinds) = kinds {
            builder = builder
                .should_retry(move |err: &FabricError<E>| kinds.iter().any(|k| k == err.kind().as_str()));
        }
        builder.build()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Transient kinds only: inner failures and timeouts. Everything else
    /// (admission shedding, open circuits, cancellation) is terminal here.
    fn is_transient(error: &FabricError<E>) -> bool {
        matches!(error, FabricError::Inner(_) | FabricError::Timeout { .. })
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let (_tx, rx) = watch::channel(false);
        self.execute_with_cancel(operation, rx).await
    }

    /// Retry with an external cancellation signal, checked before every
    /// backoff sleep. Cancellation while sleeping returns `CANCELLED` without
    /// another attempt.
    pub async fn execute_with_cancel<T, Fut, Op>(
        &self,
        mut operation: Op,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures: Vec<FabricError<E>> = Vec::new();

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !Self::is_transient(&error) || !(self.should_retry)(&error) {
                        return Err(error);
                    }

                    failures.push(error);
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    if attempt >= self.max_attempts {
                        return Err(FabricError::RetryExhausted {
                            attempts: self.max_attempts,
                            failures,
                        });
                    }

                    if *cancel.borrow() {
                        return Err(FabricError::Cancelled);
                    }

                    let delay = {
                        let base = self.backoff.delay(attempt);
                        let mut rng =
                            self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        self.jitter.apply_with_rng(base, &mut rng)
                    };
                    tracing::debug!(attempt, ?delay, "retrying after backoff");

                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                return Err(FabricError::Cancelled);
                            }
                        }
                    }
                }
            }
        }

        unreachable!("retry loop returns from within")
    }
}

pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&FabricError<E>) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    seed: Option<u64>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::Equal,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
            seed: None,
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Extra filter on top of the transient-kind rule.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FabricError<E>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Seed the jitter RNG for reproducible delays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> RetryPolicy<E> {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            rng: Arc::new(Mutex::new(rng)),
        }
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
