pub mod circuit_breaker;
pub mod layer;
pub mod rate_limiter;
pub mod retry;
pub mod types;


pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, TrippingPredicate};
pub use layer::{DEFAULT_PROFILE, ProfileRuntime, ResilienceLayer, SESSION_PROFILE, STEP_PROFILE};
pub use rate_limiter::{RateLimiter, RateLimiterStatus};
pub use retry::{backoff_delay, retry};
pub use types::*;
