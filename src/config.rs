//! Engine configuration
//!
//! One TOML document with four sections. Every duration is stored as an
//! integer with its unit in the key name. Named resilience profiles override
//! the base resilience settings per call site.

use crate::automation::SessionOptions;
use crate::env;
use crate::resilience::{
    CircuitBreakerConfig, DEFAULT_PROFILE, RateLimitConfig, ResilienceLayer, ResilienceProfile,
    RetryPolicy, SESSION_PROFILE, STEP_PROFILE,
};
use crate::scheduler::{ScheduleWindow, SchedulerConfig, WindowParseError, default_windows, parse_windows};
use crate::session::SessionPoolConfig;
use crate::task::{ExecutionMode, OrchestratorConfig};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Window(#[from] WindowParseError),
    #[error("invalid value '{value}' for {name}")]
    EnvVar { name: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-profile overrides; unset fields inherit the base settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_ms: Option<u64>,
    pub jitter: Option<bool>,
    pub failure_threshold: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub rate_limited: Option<bool>,
    pub rate_limit_max: Option<usize>,
    pub rate_limit_window_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    pub rate_limited: bool,
    pub rate_limit_max: usize,
    pub rate_limit_window_seconds: u64,
    /// Timeout of a single wrapped call
    pub step_timeout_seconds: u64,
    pub profiles: BTreeMap<String, ProfileOverrides>,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
            failure_threshold: 5,
            cooldown_seconds: 60,
            rate_limited: true,
            rate_limit_max: 10,
            rate_limit_window_seconds: 60,
            step_timeout_seconds: 30,
            profiles: BTreeMap::new(),
        }
    }
}

impl ResilienceSettings {
    /// The base settings with the named profile's overrides applied.
    pub fn profile(&self, name: &str) -> ResilienceProfile {
        let overrides = self.profiles.get(name).cloned().unwrap_or_default();

        let rate_limited = overrides.rate_limited.unwrap_or(self.rate_limited);
        ResilienceProfile {
            retry: RetryPolicy {
                max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
                base_delay: Duration::from_millis(overrides.base_delay_ms.unwrap_or(self.base_delay_ms)),
                backoff_factor: overrides.backoff_factor.unwrap_or(self.backoff_factor),
                max_delay: Duration::from_millis(overrides.max_delay_ms.unwrap_or(self.max_delay_ms)),
                jitter: overrides.jitter.unwrap_or(self.jitter),
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: overrides.failure_threshold.unwrap_or(self.failure_threshold),
                cooldown: Duration::from_secs(overrides.cooldown_seconds.unwrap_or(self.cooldown_seconds)),
            },
            rate_limit: rate_limited.then(|| RateLimitConfig {
                max_requests: overrides.rate_limit_max.unwrap_or(self.rate_limit_max),
                window: Duration::from_secs(
                    overrides
                        .rate_limit_window_seconds
                        .unwrap_or(self.rate_limit_window_seconds),
                ),
            }),
            timeout: Duration::from_secs(overrides.timeout_seconds.unwrap_or(self.step_timeout_seconds)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub idle_reap_timeout_seconds: u64,
    pub reap_interval_seconds: u64,
    pub creation_timeout_seconds: u64,
    pub headless: bool,
    pub debug_mode: bool,
    pub profile: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_reap_timeout_seconds: 300,
            reap_interval_seconds: 60,
            creation_timeout_seconds: 120,
            headless: true,
            debug_mode: false,
            profile: None,
        }
    }
}

impl SessionSettings {
    pub fn pool_config(&self) -> SessionPoolConfig {
        SessionPoolConfig {
            creation_timeout: Duration::from_secs(self.creation_timeout_seconds),
            idle_reap_timeout: Duration::from_secs(self.idle_reap_timeout_seconds),
            reap_interval: Duration::from_secs(self.reap_interval_seconds),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            headless: self.headless,
            debug_mode: self.debug_mode,
            profile: self.profile.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub execution_mode: ExecutionMode,
    pub max_concurrent_subcontexts: usize,
    pub inter_task_delay_ms: u64,
    pub batch_retention_seconds: u64,
    /// Interaction steps run for every task unless a batch overrides them
    pub steps: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            execution_mode: defaults.execution_mode,
            max_concurrent_subcontexts: defaults.max_concurrent_subcontexts,
            inter_task_delay_ms: 2000,
            batch_retention_seconds: 300,
            steps: defaults.default_steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub schedule_windows: Vec<ScheduleWindow>,
    /// Fixed offset of the timezone the windows are expressed in
    pub timezone_offset_minutes: i32,
    pub short_cadence_minutes: u32,
    pub long_cadence_minutes: u32,
    pub max_total_attempts: u32,
    pub auto_retry: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            schedule_windows: default_windows(),
            timezone_offset_minutes: 180,
            short_cadence_minutes: 1,
            long_cadence_minutes: 31,
            max_total_attempts: 100,
            auto_retry: true,
        }
    }
}

impl SchedulerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            windows: self.schedule_windows.clone(),
            short_cadence_minutes: self.short_cadence_minutes,
            long_cadence_minutes: self.long_cadence_minutes,
            max_total_attempts: self.max_total_attempts,
            auto_retry: self.auto_retry,
        }
    }

    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        self.timezone_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "timezone_offset_minutes {} is out of range",
                    self.timezone_offset_minutes
                ))
            })
    }
}

/// Complete configuration for an [`crate::Engine`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub resilience: ResilienceSettings,
    pub session: SessionSettings,
    pub orchestrator: OrchestratorSettings,
    pub scheduler: SchedulerSettings,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        fs::write(path, self.to_toml_string()?).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `SLOTRUNNER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(env::vars::SCHEDULE_WINDOWS) {
            self.scheduler.schedule_windows = parse_windows(&value)?;
        }
        if let Some(value) = lookup(env::vars::SHORT_CADENCE_MINUTES) {
            self.scheduler.short_cadence_minutes = parse_var(env::vars::SHORT_CADENCE_MINUTES, &value)?;
        }
        if let Some(value) = lookup(env::vars::LONG_CADENCE_MINUTES) {
            self.scheduler.long_cadence_minutes = parse_var(env::vars::LONG_CADENCE_MINUTES, &value)?;
        }
        if let Some(value) = lookup(env::vars::MAX_TOTAL_ATTEMPTS) {
            self.scheduler.max_total_attempts = parse_var(env::vars::MAX_TOTAL_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(env::vars::AUTO_RETRY) {
            self.scheduler.auto_retry = parse_bool(env::vars::AUTO_RETRY, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names: Vec<&str> = vec![DEFAULT_PROFILE, SESSION_PROFILE, STEP_PROFILE];
        names.extend(self.resilience.profiles.keys().map(String::as_str));

        for name in names {
            let profile = self.resilience.profile(name);
            if profile.retry.max_attempts == 0 {
                return Err(invalid(format!("profile '{}': max_attempts must be at least 1", name)));
            }
            let factor = profile.retry.backoff_factor;
            if factor < 1.0 || !factor.is_finite() {
                return Err(invalid(format!(
                    "profile '{}': backoff_factor must be a finite number >= 1.0",
                    name
                )));
            }
            if profile.breaker.failure_threshold == 0 {
                return Err(invalid(format!("profile '{}': failure_threshold must be at least 1", name)));
            }
            if profile.timeout.is_zero() {
                return Err(invalid(format!("profile '{}': timeout must be non-zero", name)));
            }
            if let Some(limit) = &profile.rate_limit
                && (limit.max_requests == 0 || limit.window.is_zero())
            {
                return Err(invalid(format!(
                    "profile '{}': rate limit needs a non-zero request count and window",
                    name
                )));
            }
        }

        if self.session.reap_interval_seconds == 0 || self.session.creation_timeout_seconds == 0 {
            return Err(invalid("session intervals must be non-zero"));
        }
        if self.orchestrator.max_concurrent_subcontexts == 0 {
            return Err(invalid("max_concurrent_subcontexts must be at least 1"));
        }
        if self.scheduler.schedule_windows.is_empty() {
            return Err(invalid("at least one schedule window is required"));
        }
        if self.scheduler.short_cadence_minutes == 0 || self.scheduler.long_cadence_minutes == 0 {
            return Err(invalid("cadences must be at least one minute"));
        }
        if self.scheduler.max_total_attempts == 0 {
            return Err(invalid("max_total_attempts must be at least 1"));
        }
        self.scheduler.offset()?;

        debug!("Configuration validated");
        Ok(())
    }

    /// Build the shared resilience layer with every configured profile.
    ///
    /// Session acquisition includes a backend `create`, so the session
    /// profile's timeout defaults to the creation timeout.
    pub fn resilience_layer(&self) -> ResilienceLayer {
        let mut layer = ResilienceLayer::new(self.resilience.profile(DEFAULT_PROFILE));

        let mut session = self.resilience.profile(SESSION_PROFILE);
        let session_timeout_overridden = self
            .resilience
            .profiles
            .get(SESSION_PROFILE)
            .is_some_and(|overrides| overrides.timeout_seconds.is_some());
        if !session_timeout_overridden {
            session.timeout = Duration::from_secs(self.session.creation_timeout_seconds);
        }
        layer = layer
            .with_profile(SESSION_PROFILE, session)
            .with_profile(STEP_PROFILE, self.resilience.profile(STEP_PROFILE));

        for name in self.resilience.profiles.keys() {
            if name != SESSION_PROFILE && name != STEP_PROFILE {
                layer = layer.with_profile(name.clone(), self.resilience.profile(name));
            }
        }
        layer
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            execution_mode: self.orchestrator.execution_mode,
            max_concurrent_subcontexts: self.orchestrator.max_concurrent_subcontexts,
            inter_task_delay: Duration::from_millis(self.orchestrator.inter_task_delay_ms),
            batch_retention: Duration::from_secs(self.orchestrator.batch_retention_seconds),
            release_timeout: self.resilience.profile(STEP_PROFILE).timeout,
            session_options: self.session.session_options(),
            default_steps: self.orchestrator.steps.clone(),
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::EnvVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvVar {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
