//! Timeout policy bounding async operation duration.
//!
//! Uses `tokio::time::timeout`; at the deadline the inner future is dropped,
//! which is the cooperative cancellation contract: the operation stops at its
//! next suspension point and holds no fabric resources across it.

use crate::error::FabricError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Maximum allowed timeout (30 days); guards accidental `u64::MAX`-style values.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when configuring timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeoutError {
    #[error("timeout duration must be > 0")]
    ZeroDuration,
    #[error("timeout duration {requested:?} exceeds maximum allowed {limit:?}")]
    ExceedsMaximum { requested: Duration, limit: Duration },
}

/// Policy that enforces a maximum duration on async operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Creates a timeout policy with the specified duration.
    ///
    /// # Errors
    ///
    /// Returns [`TimeoutError::ZeroDuration`] for a zero duration and
    /// [`TimeoutError::ExceedsMaximum`] beyond [`MAX_TIMEOUT`].
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError::ZeroDuration);
        }
        if duration > MAX_TIMEOUT {
            return Err(TimeoutError::ExceedsMaximum { requested: duration, limit: MAX_TIMEOUT });
        }
        Ok(Self { duration })
    }

    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute an operation with a deadline.
    ///
    /// `elapsed` in the error is measured from just before the operation is
    /// invoked and can exceed the configured timeout slightly due to
    /// scheduling overhead.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, FabricError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                Err(FabricError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}
