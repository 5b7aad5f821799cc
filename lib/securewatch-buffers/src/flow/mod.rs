//! Flow control and resilience: the circuit breaker guarding downstream
//! handoff, the backpressure monitor observing the pipeline, the adaptive
//! batch sizer, and the admission gate they feed.

mod backpressure;
mod batch;
mod circuit_breaker;
mod rate_limit;

pub use backpressure::{BackpressureMonitor, BackpressureSnapshot};
pub use batch::AdaptiveBatchSizer;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use rate_limit::{FlowControlGate, PriorityCounters};
