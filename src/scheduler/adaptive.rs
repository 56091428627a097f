use crate::resilience::ResilienceError;
use crate::scheduler::clock::{Clock, SystemClock};
use crate::scheduler::window::{ScheduleWindow, default_windows};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub windows: Vec<ScheduleWindow>,
    /// Interval between attempts inside a window
    pub short_cadence_minutes: u32,
    /// Interval between attempts outside every window
    pub long_cadence_minutes: u32,
    pub max_total_attempts: u32,
    /// When false, a run makes exactly one attempt
    pub auto_retry: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            short_cadence_minutes: 1,
            long_cadence_minutes: 31,
            max_total_attempts: 100,
            auto_retry: true,
        }
    }
}

/// How a scheduled run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed with a retryable error
    Exhausted {
        attempts: u32,
        last_error: ResilienceError,
    },
    /// A non-retryable error stopped the run
    Aborted {
        attempts: u32,
        error: ResilienceError,
    },
    Cancelled { attempts: u32 },
}

impl<T> ScheduleOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            ScheduleOutcome::Succeeded { attempts, .. }
            | ScheduleOutcome::Exhausted { attempts, .. }
            | ScheduleOutcome::Aborted { attempts, .. }
            | ScheduleOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScheduleOutcome::Succeeded { .. })
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            ScheduleOutcome::Succeeded { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Where "now" sits relative to the configured windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub now: DateTime<FixedOffset>,
    pub active_window: Option<ScheduleWindow>,
    pub next_window: Option<ScheduleWindow>,
    /// Zero while inside a window
    pub minutes_until_next: i64,
    pub cadence: Duration,
}

impl WindowStatus {
    pub fn in_window(&self) -> bool {
        self.active_window.is_some()
    }
}

impl fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.active_window, &self.next_window) {
            (Some(window), _) => write!(f, "inside window {}", window)?,
            (None, Some(window)) => {
                let hours = self.minutes_until_next / 60;
                let minutes = self.minutes_until_next % 60;
                if hours > 0 {
                    write!(f, "next window {} in {}h {}m", window, hours, minutes)?;
                } else {
                    write!(f, "next window {} in {}m", window, minutes)?;
                }
            }
            (None, None) => write!(f, "no schedule windows configured")?,
        }
        write!(f, " (cadence {}m)", self.cadence.as_secs() / 60)
    }
}

/// Bounded retry loop whose interval depends on the time of day.
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn with_system_clock(config: SchedulerConfig, offset: FixedOffset) -> Self {
        Self::new(config, Arc::new(SystemClock::new(offset)))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.clock.now()
    }

    pub fn active_window(&self) -> Option<ScheduleWindow> {
        let time = self.clock.now().time();
        self.config
            .windows
            .iter()
            .copied()
            .find(|window| window.contains(time))
    }

    pub fn is_in_window(&self) -> bool {
        self.active_window().is_some()
    }

    /// Short cadence inside any window, long cadence otherwise. Evaluated
    /// against the clock on every call.
    pub fn current_cadence(&self) -> Duration {
        let minutes = if self.is_in_window() {
            self.config.short_cadence_minutes
        } else {
            self.config.long_cadence_minutes
        };
        Duration::from_secs(u64::from(minutes) * 60)
    }

    /// Zero while inside a window.
    pub fn minutes_until_next_window(&self) -> i64 {
        self.next_window().map(|(_, minutes)| minutes).unwrap_or(0)
    }

    fn next_window(&self) -> Option<(ScheduleWindow, i64)> {
        let time = self.clock.now().time();
        if self.config.windows.iter().any(|window| window.contains(time)) {
            return None;
        }
        self.config
            .windows
            .iter()
            .map(|window| (*window, window.minutes_until_start(time)))
            .min_by_key(|(_, minutes)| *minutes)
    }

    pub fn window_status(&self) -> WindowStatus {
        let next = self.next_window();
        WindowStatus {
            now: self.clock.now(),
            active_window: self.active_window(),
            next_window: next.map(|(window, _)| window),
            minutes_until_next: next.map(|(_, minutes)| minutes).unwrap_or(0),
            cadence: self.current_cadence(),
        }
    }

    /// Keep calling `op` until it succeeds, fails permanently, runs out of
    /// attempts or `is_cancelled` reports true.
    ///
    /// Cancellation is checked before every attempt and before every sleep.
    pub async fn run_until_success<T, F, Fut, R, C>(
        &self,
        op: F,
        max_attempts: u32,
        is_retryable: R,
        is_cancelled: C,
    ) -> ScheduleOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        R: Fn(&ResilienceError) -> bool,
        C: Fn() -> bool,
    {
        self.run_loop(op, max_attempts, is_retryable, is_cancelled, None)
            .await
    }

    /// [`AdaptiveScheduler::run_until_success`] with the configured attempt
    /// budget and default classification. A cancelled `token` also cuts the
    /// current cadence sleep short.
    pub async fn run_with_token<T, F, Fut>(&self, op: F, token: &CancellationToken) -> ScheduleOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.run_loop(
            op,
            self.config.max_total_attempts,
            ResilienceError::is_retryable,
            || token.is_cancelled(),
            Some(token),
        )
        .await
    }

    async fn run_loop<T, F, Fut, R, C>(
        &self,
        mut op: F,
        max_attempts: u32,
        is_retryable: R,
        is_cancelled: C,
        interrupt: Option<&CancellationToken>,
    ) -> ScheduleOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        R: Fn(&ResilienceError) -> bool,
        C: Fn() -> bool,
    {
        let budget = if self.config.auto_retry {
            max_attempts.max(1)
        } else {
            1
        };
        let mut attempts = 0;

        loop {
            if is_cancelled() {
                info!("Scheduled run cancelled after {} attempts", attempts);
                return ScheduleOutcome::Cancelled { attempts };
            }

            attempts += 1;
            let error = match op().await {
                Ok(value) => {
                    info!("Scheduled run succeeded on attempt {}", attempts);
                    return ScheduleOutcome::Succeeded { value, attempts };
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                warn!("Scheduled run aborted on attempt {}: {}", attempts, error);
                return ScheduleOutcome::Aborted { attempts, error };
            }
            if attempts >= budget {
                warn!(
                    "Scheduled run exhausted {} attempts, last error: {}",
                    attempts, error
                );
                return ScheduleOutcome::Exhausted {
                    attempts,
                    last_error: error,
                };
            }

            if is_cancelled() {
                info!("Scheduled run cancelled after {} attempts", attempts);
                return ScheduleOutcome::Cancelled { attempts };
            }

            let cadence = self.current_cadence();
            debug!(
                "Attempt {}/{} failed ({}), next attempt in {:?} ({})",
                attempts,
                budget,
                error,
                cadence,
                if self.is_in_window() { "in window" } else { "outside windows" }
            );

            match interrupt {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(cadence) => {}
                    }
                }
                None => tokio::time::sleep(cadence).await,
            }
        }
    }
}
