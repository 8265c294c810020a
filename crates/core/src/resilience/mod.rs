//! Outbound call protection: circuit breaking, retry with backoff, response validation
//! and substitute data when a dependency is down.

pub mod circuit_breaker;
pub mod client;
pub mod fallback;
pub mod retry;
pub mod transport;
pub mod validator;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, Clock, ManualClock,
    SystemClock,
};
pub use client::{
    default_endpoints, ApiCallStats, ApiEndpoint, ApiHealth, ApiOperation, ApiStatus, CallResult,
    DataSource, HealthProbe, ResilienceError, ResilienceSettings, ResilientClient,
};
pub use fallback::FallbackProvider;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use transport::{
    Method, ScriptedTransport, Transport, TransportError, TransportRequest, TransportResponse,
};
pub use validator::{DataValidator, ValidationReport};
