use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Failure taxonomy shared by every outbound call wrapped by the resilience layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResilienceError {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("rate limit exceeded: {max_requests} requests per {window:?}")]
    RateLimitExceeded { max_requests: usize, window: Duration },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ResilienceError>,
    },
}

impl ResilienceError {
    /// Default classification used by retry loops and the adaptive scheduler.
    ///
    /// An open circuit is a fail-fast signal and is not retried; an exhausted
    /// retry budget is terminal by definition.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::Transient(_)
            | ResilienceError::Timeout(_)
            | ResilienceError::RateLimitExceeded { .. } => true,
            ResilienceError::CircuitOpen
            | ResilienceError::Permanent(_)
            | ResilienceError::RetryExhausted { .. } => false,
        }
    }

    /// Default classification for errors that count against a circuit breaker.
    pub fn is_tripping(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::Timeout(_)
        )
    }

    /// The innermost cause, unwrapping any `RetryExhausted` layers.
    pub fn root_cause(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResilienceError::CircuitOpen => "CircuitOpen",
            ResilienceError::RateLimitExceeded { .. } => "RateLimitExceeded",
            ResilienceError::Timeout(_) => "Timeout",
            ResilienceError::Transient(_) => "Transient",
            ResilienceError::Permanent(_) => "Permanent",
            ResilienceError::RetryExhausted { .. } => "RetryExhausted",
        }
    }
}

/// Exponential backoff parameters for [`crate::resilience::retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Un-jittered delay slept after the zero-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            // f64 rounding can land just above what a Duration holds
            Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
        } else if capped.is_finite() {
            Duration::ZERO
        } else {
            self.max_delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Everything needed to wrap one class of outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceProfile {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: Option<RateLimitConfig>,
    pub timeout: Duration,
}

impl Default for ResilienceProfile {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: Some(RateLimitConfig::default()),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Running error counters for one profile.
#[derive(Debug, Clone, Default)]
pub struct ErrorStatistics {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_errors: u64,
    pub last_error_time: Option<chrono::DateTime<chrono::Utc>>,
    pub error_types: HashMap<String, u32>,
}
