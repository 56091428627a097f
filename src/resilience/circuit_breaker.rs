use crate::resilience::types::{CircuitBreakerConfig, ResilienceError};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type TrippingPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

impl CircuitBreakerState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open { .. } => "open",
            CircuitBreakerState::HalfOpen { .. } => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
}

/// Closed → Open → HalfOpen → Closed breaker around a single class of call.
///
/// The state lock is never held while the wrapped operation runs, so unrelated
/// calls are not serialized behind a slow one.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    is_tripping: TrippingPredicate,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Marks the half-open probe as finished if the call is dropped before it
/// reports an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            if let CircuitBreakerState::HalfOpen { .. } = inner.state {
                inner.state = CircuitBreakerState::HalfOpen {
                    probe_in_flight: false,
                };
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_predicate(name, config, Arc::new(ResilienceError::is_tripping))
    }

    pub fn with_predicate(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        is_tripping: TrippingPredicate,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
            })),
            is_tripping,
        }
    }

    /// Run `op` under breaker protection.
    ///
    /// While open, fails fast with [`ResilienceError::CircuitOpen`] without
    /// invoking `op`. Once the cooldown since the last failure has elapsed a
    /// single probe is let through; every other caller keeps failing fast
    /// until the probe reports.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let is_probe = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(),
            Err(error) if (self.is_tripping)(error) => self.record_failure(),
            Err(_) => self.record_neutral(is_probe),
        }

        result
    }

    fn admit(&self) -> Result<bool, ResilienceError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitBreakerState::Closed => Ok(false),
            CircuitBreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.cooldown {
                    info!("Circuit breaker '{}' half-open, letting one probe through", self.name);
                    inner.state = CircuitBreakerState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(true)
                } else {
                    debug!("Circuit breaker '{}' is open, failing fast", self.name);
                    Err(ResilienceError::CircuitOpen)
                }
            }
            CircuitBreakerState::HalfOpen {
                probe_in_flight: true,
            } => Err(ResilienceError::CircuitOpen),
            CircuitBreakerState::HalfOpen {
                probe_in_flight: false,
            } => {
                inner.state = CircuitBreakerState::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(true)
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitBreakerState::HalfOpen { .. } => {
                info!("Circuit breaker '{}' closed after successful probe", self.name);
                inner.state = CircuitBreakerState::Closed;
                inner.failure_count = 0;
            }
            CircuitBreakerState::Closed => inner.failure_count = 0,
            // A call admitted before the trip does not vouch for recovery.
            CircuitBreakerState::Open { .. } => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        let now = Instant::now();

        match inner.state {
            CircuitBreakerState::HalfOpen { .. } => {
                warn!("Circuit breaker '{}' probe failed, reopening", self.name);
                inner.state = CircuitBreakerState::Open { opened_at: now };
            }
            CircuitBreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker '{}' opened after {} failures",
                        self.name, inner.failure_count
                    );
                    inner.state = CircuitBreakerState::Open { opened_at: now };
                }
            }
            CircuitBreakerState::Open { .. } => {
                inner.state = CircuitBreakerState::Open { opened_at: now };
            }
        }
    }

    fn record_neutral(&self, was_probe: bool) {
        if !was_probe {
            return;
        }
        let mut inner = self.lock();
        if let CircuitBreakerState::HalfOpen { .. } = inner.state {
            inner.state = CircuitBreakerState::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.state = CircuitBreakerState::Open {
            opened_at: Instant::now(),
        };
    }

    pub fn force_close(&self) {
        let mut inner = self.lock();
        inner.state = CircuitBreakerState::Closed;
        inner.failure_count = 0;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
