use crate::resilience::types::{RateLimitConfig, ResilienceError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sliding-window rate limiter shared by every caller of one profile.
///
/// Admission timestamps are kept in arrival order; on each check the ones older
/// than the window are dropped and a call is admitted only while fewer than
/// `max_requests` remain.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<VecDeque<Instant>>>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStatus {
    pub max_requests: usize,
    pub window: Duration,
    pub in_window: usize,
    pub available: usize,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(VecDeque::with_capacity(config.max_requests))),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit the call if the window has room, recording it on admission.
    pub async fn is_allowed(&self) -> bool {
        let mut timestamps = self.state.lock().await;
        let now = Instant::now();
        self.purge(&mut timestamps, now);

        if timestamps.len() < self.config.max_requests {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Like [`RateLimiter::is_allowed`] but reports a refusal as an error.
    pub async fn try_acquire(&self) -> Result<(), ResilienceError> {
        if self.is_allowed().await {
            Ok(())
        } else {
            Err(ResilienceError::RateLimitExceeded {
                max_requests: self.config.max_requests,
                window: self.config.window,
            })
        }
    }

    /// Poll until a slot frees up, then take it.
    pub async fn wait_until_allowed(&self) {
        loop {
            let wait = {
                let mut timestamps = self.state.lock().await;
                let now = Instant::now();
                self.purge(&mut timestamps, now);

                if timestamps.len() < self.config.max_requests {
                    timestamps.push_back(now);
                    return;
                }

                timestamps
                    .front()
                    .map(|oldest| (*oldest + self.config.window).saturating_duration_since(now))
                    .unwrap_or(POLL_INTERVAL)
            };

            let sleep_for = wait.clamp(Duration::from_millis(1), POLL_INTERVAL);
            debug!("Rate limit reached, waiting {:?}", sleep_for);
            tokio::time::sleep(sleep_for).await;
        }
    }

    pub async fn status(&self) -> RateLimiterStatus {
        let mut timestamps = self.state.lock().await;
        self.purge(&mut timestamps, Instant::now());
        RateLimiterStatus {
            max_requests: self.config.max_requests,
            window: self.config.window,
            in_window: timestamps.len(),
            available: self.config.max_requests.saturating_sub(timestamps.len()),
        }
    }

    fn purge(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
