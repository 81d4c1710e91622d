//! Error types shared by every fabric component.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Type-erased operation error; the orchestrator stores per-service policies
/// against this so callers can bring any error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boundary tag for a fabric error, stable across the public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimitExceeded,
    RateLimitTimeout,
    RateLimitQueueFull,
    BulkheadFull,
    BulkheadWaitTimeout,
    CircuitOpen,
    Timeout,
    RetryExhausted,
    FallbackFailed,
    Cancelled,
    Shutdown,
    UnknownService,
    Inner,
}

impl ErrorKind {
    /// The wire-stable tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::RateLimitTimeout => "RATE_LIMIT_TIMEOUT",
            ErrorKind::RateLimitQueueFull => "RATE_LIMIT_QUEUE_FULL",
            ErrorKind::BulkheadFull => "BULKHEAD_FULL",
            ErrorKind::BulkheadWaitTimeout => "BULKHEAD_WAIT_TIMEOUT",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorKind::FallbackFailed => "FALLBACK_FAILED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Shutdown => "SHUTDOWN",
            ErrorKind::UnknownService => "UNKNOWN_SERVICE",
            ErrorKind::Inner => "INNER",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for fabric operations.
///
/// Admission errors (`RateLimit*`, `Bulkhead*`) carry the name of the service
/// that shed the call; wrapper errors (`Timeout`, `RetryExhausted`, …) apply
/// to whichever call they wrapped.
#[derive(Debug)]
pub enum FabricError<E> {
    /// The token bucket had no capacity and queueing was not an option.
    RateLimitExceeded { service: String, remaining: f64 },
    /// A queued consume waited past its deadline.
    RateLimitTimeout { service: String, waited: Duration },
    /// The waiter queue was already at capacity.
    RateLimitQueueFull { service: String, queue_len: usize, max: usize },
    /// The bulkhead was saturated and no wait was allowed.
    BulkheadFull { service: String, active: usize, max: usize },
    /// A queued bulkhead entry waited past its deadline.
    BulkheadWaitTimeout { service: String, waited: Duration },
    /// The circuit breaker is open.
    CircuitOpen { service: String, failure_count: usize, open_for: Duration },
    /// The operation exceeded its deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Vec<FabricError<E>> },
    /// The fallback handler itself failed; it supersedes the original error.
    FallbackFailed { original: Box<FabricError<E>>, error: E },
    /// The caller cancelled while waiting.
    Cancelled,
    /// The component was shut down while the caller waited.
    Shutdown,
    /// No service is registered under this name.
    UnknownService { service: String },
    /// The underlying operation failed.
    Inner(E),
}

impl<E> FabricError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::RateLimitTimeout { .. } => ErrorKind::RateLimitTimeout,
            Self::RateLimitQueueFull { .. } => ErrorKind::RateLimitQueueFull,
            Self::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            Self::BulkheadWaitTimeout { .. } => ErrorKind::BulkheadWaitTimeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::FallbackFailed { .. } => ErrorKind::FallbackFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::UnknownService { .. } => ErrorKind::UnknownService,
            Self::Inner(_) => ErrorKind::Inner,
        }
    }

    /// The service that produced this error, when the variant is scoped to one.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::RateLimitExceeded { service, .. }
            | Self::RateLimitTimeout { service, .. }
            | Self::RateLimitQueueFull { service, .. }
            | Self::BulkheadFull { service, .. }
            | Self::BulkheadWaitTimeout { service, .. }
            | Self::CircuitOpen { service, .. }
            | Self::UnknownService { service } => Some(service),
            _ => None,
        }
    }

    /// Admission errors reflect intended shedding: never retried, never healed,
    /// never counted against a budget.
    pub fn is_admission(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimitExceeded
                | ErrorKind::RateLimitTimeout
                | ErrorKind::RateLimitQueueFull
                | ErrorKind::BulkheadFull
                | ErrorKind::BulkheadWaitTimeout
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimitExceeded | ErrorKind::RateLimitTimeout | ErrorKind::RateLimitQueueFull
        )
    }

    pub fn is_bulkhead(&self) -> bool {
        matches!(self.kind(), ErrorKind::BulkheadFull | ErrorKind::BulkheadWaitTimeout)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access all recorded failures for RetryExhausted, if present.
    pub fn failures(&self) -> Option<&[FabricError<E>]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for FabricError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitExceeded { service, remaining } => {
                write!(f, "[{}] rate limit exceeded ({:.1} tokens remaining)", service, remaining)
            }
            Self::RateLimitTimeout { service, waited } => {
                write!(f, "[{}] rate limit wait timed out after {:?}", service, waited)
            }
            Self::RateLimitQueueFull { service, queue_len, max } => {
                write!(f, "[{}] rate limit queue full ({} queued, max {})", service, queue_len, max)
            }
            Self::BulkheadFull { service, active, max } => {
                write!(f, "[{}] bulkhead rejected request ({} active, max {})", service, active, max)
            }
            Self::BulkheadWaitTimeout { service, waited } => {
                write!(f, "[{}] bulkhead wait timed out after {:?}", service, waited)
            }
            Self::CircuitOpen { service, failure_count, open_for } => {
                write!(
                    f,
                    "[{}] circuit breaker open ({} failures, open for {:?})",
                    service, failure_count, open_for
                )
            }
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(f, "retry exhausted after {} attempts, last error: {}", attempts, last)
            }
            Self::FallbackFailed { original, error } => {
                write!(f, "fallback failed ({}) after original error: {}", error, original)
            }
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Shutdown => write!(f, "component shut down"),
            Self::UnknownService { service } => write!(f, "unknown service: {}", service),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FabricError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::FallbackFailed { error, .. } => Some(error),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}
