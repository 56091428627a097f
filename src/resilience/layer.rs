use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::retry::retry;
use crate::resilience::types::{ErrorStatistics, ResilienceError, ResilienceProfile};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_PROFILE: &str = "default";
pub const SESSION_PROFILE: &str = "session";
pub const STEP_PROFILE: &str = "step";

/// Shared runtime state for one named profile: one breaker and one limiter
/// reused by every call site configured with that profile.
#[derive(Debug)]
pub struct ProfileRuntime {
    name: String,
    profile: ResilienceProfile,
    breaker: CircuitBreaker,
    limiter: Option<RateLimiter>,
    stats: Mutex<ErrorStatistics>,
}

impl ProfileRuntime {
    pub fn new(name: impl Into<String>, profile: ResilienceProfile) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), profile.breaker.clone()),
            limiter: profile.rate_limit.clone().map(RateLimiter::new),
            stats: Mutex::new(ErrorStatistics::default()),
            name,
            profile,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &ResilienceProfile {
        &self.profile
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    /// Retry around breaker around rate limiter around a timed-out `op`.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        retry(&self.profile.retry, ResilienceError::is_retryable, || {
            let attempt = op();
            async move {
                let result = self.breaker.call(|| self.guarded(attempt)).await;
                self.record(&result).await;
                result
            }
        })
        .await
    }

    async fn guarded<T, Fut>(&self, attempt: Fut) -> Result<T, ResilienceError>
    where
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        if let Some(limiter) = &self.limiter {
            limiter.wait_until_allowed().await;
        }

        match tokio::time::timeout(self.profile.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    "Profile '{}' call timed out after {:?}",
                    self.name, self.profile.timeout
                );
                Err(ResilienceError::Timeout(self.profile.timeout))
            }
        }
    }

    async fn record<T>(&self, result: &Result<T, ResilienceError>) {
        let mut stats = self.stats.lock().await;
        stats.total_calls += 1;
        match result {
            Ok(_) => {
                stats.consecutive_successes += 1;
                stats.consecutive_failures = 0;
            }
            Err(error) => {
                stats.consecutive_failures += 1;
                stats.consecutive_successes = 0;
                stats.total_errors += 1;
                stats.last_error_time = Some(Utc::now());
                *stats.error_types.entry(error.kind().to_string()).or_insert(0) += 1;
            }
        }
    }

    pub async fn statistics(&self) -> ErrorStatistics {
        self.stats.lock().await.clone()
    }

    /// Whether this runtime carries no state a fresh one would lack.
    pub async fn is_pristine(&self) -> bool {
        if self.breaker.state() != CircuitBreakerState::Closed || self.breaker.failure_count() > 0 {
            return false;
        }
        match &self.limiter {
            Some(limiter) => limiter.status().await.in_window == 0,
            None => true,
        }
    }
}

/// Named resilience profiles shared by every outbound call in the engine.
///
/// Unknown profile names fall back to [`DEFAULT_PROFILE`].
///
/// Keyed runtimes give each key (a principal, usually) its own breaker and
/// limiter built from the named profile, so one key's failures never open the
/// circuit for another. Clones share the keyed runtimes.
#[derive(Debug, Clone)]
pub struct ResilienceLayer {
    profiles: HashMap<String, Arc<ProfileRuntime>>,
    keyed: Arc<DashMap<(String, String), Arc<ProfileRuntime>>>,
}

impl ResilienceLayer {
    pub fn new(default_profile: ResilienceProfile) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            DEFAULT_PROFILE.to_string(),
            Arc::new(ProfileRuntime::new(DEFAULT_PROFILE, default_profile)),
        );
        Self {
            profiles,
            keyed: Arc::new(DashMap::new()),
        }
    }

    pub fn with_profile(mut self, name: impl Into<String>, profile: ResilienceProfile) -> Self {
        let name = name.into();
        self.profiles
            .insert(name.clone(), Arc::new(ProfileRuntime::new(name, profile)));
        self
    }

    pub fn profile(&self, name: &str) -> Arc<ProfileRuntime> {
        match self.profiles.get(name) {
            Some(runtime) => Arc::clone(runtime),
            None => {
                debug!("Unknown resilience profile '{}', using default", name);
                Arc::clone(&self.profiles[DEFAULT_PROFILE])
            }
        }
    }

    /// Runtime of profile `name` dedicated to `key`, created on first use.
    pub fn keyed_profile(&self, name: &str, key: &str) -> Arc<ProfileRuntime> {
        let entry = self
            .keyed
            .entry((name.to_string(), key.to_string()))
            .or_insert_with(|| {
                let template = self.profile(name);
                debug!("Creating '{}' runtime for key {}", template.name(), key);
                Arc::new(ProfileRuntime::new(
                    format!("{}:{}", template.name(), key),
                    template.profile().clone(),
                ))
            });
        Arc::clone(entry.value())
    }

    pub fn keyed_count(&self) -> usize {
        self.keyed.len()
    }

    /// Drop keyed runtimes nobody holds whose breaker and limiter are back at
    /// their initial state. Returns how many were dropped.
    pub async fn prune_keyed(&self) -> usize {
        let candidates: Vec<((String, String), Arc<ProfileRuntime>)> = self
            .keyed
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut pruned = 0;
        for (key, runtime) in candidates {
            if !runtime.is_pristine().await {
                continue;
            }
            drop(runtime);
            // only the map's own reference may remain
            if self
                .keyed
                .remove_if(&key, |_, runtime| Arc::strong_count(runtime) == 1)
                .is_some()
            {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {} idle keyed resilience runtimes", pruned);
        }
        pruned
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute<T, F, Fut>(&self, profile: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.profile(profile).execute(op).await
    }

    /// Like [`ResilienceLayer::execute`] but through the runtime for `key`.
    pub async fn execute_keyed<T, F, Fut>(
        &self,
        profile: &str,
        key: &str,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.keyed_profile(profile, key).execute(op).await
    }
}

impl Default for ResilienceLayer {
    fn default() -> Self {
        Self::new(ResilienceProfile::default())
    }
}
