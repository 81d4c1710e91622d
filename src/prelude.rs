//! Convenience re-exports for the common path: build a fabric, register
//! services, execute guarded calls, subscribe to events.

pub use crate::{
    BulkheadConfig, Criticality, ErrorKind, EventKind, ExecuteOptions, ExportFormat, FabricError,
    FabricEvent, HealthCheckConfig, HealthState, LatencyBudgetConfig, PolicyConfig, Priority,
    RateLimiterConfig, ReliabilityFabric, RetryConfig, ServiceConfig, SloConfig,
};
pub use crate::{probe_fn, HealthProbe};
pub use crate::{CircuitBreakerConfig, CircuitState};
pub use crate::{FallbackChain, Served};

#[cfg(test)]
mod tests {
    // Compile-time check that the prelude surface stays importable.
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn prelude_compiles() {
        let _ = ExportFormat::Json;
        let _ = EventKind::All;
    }
}
