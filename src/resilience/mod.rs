pub mod backoff;
pub mod circuit_breaker;
pub mod retry;

pub use backoff::BackoffSchedule;
pub use circuit_breaker::{CircuitBreaker, CircuitOpenError, CircuitState};
pub use retry::retry;
