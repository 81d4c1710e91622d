//! Observability for the reliability fabric.
//!
//! Components publish [`FabricEvent`]s onto the [`EventBus`]; subscribers are
//! invoked in registration order on a dedicated dispatch task, and
//! `tower::Service` sinks can be attached for async forwarding. Listener
//! failures are logged and swallowed.

pub mod bus;
pub mod events;
pub mod sinks;

pub use bus::{EventBus, Subscription};
pub use events::{EventKind, FabricEvent};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
