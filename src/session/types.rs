use crate::automation::{PrincipalId, SessionId, SessionOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a principal's session as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// At least one lease is outstanding
    Active,
    /// Tracked by the pool but nobody is using it
    Idle,
    /// Torn down; never handed out again
    Closed,
}

/// Point-in-time snapshot of one pooled session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub principal: PrincipalId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub idle_for: Duration,
    pub leases: usize,
    pub options: SessionOptions,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("failed to create session for principal {principal}: {reason}")]
    Creation {
        principal: PrincipalId,
        reason: String,
    },
    #[error("no live session for principal {0}")]
    Unavailable(PrincipalId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPoolConfig {
    /// Upper bound on a single backend `create` call
    pub creation_timeout: Duration,
    pub idle_reap_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            creation_timeout: Duration::from_secs(120),
            idle_reap_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
        }
    }
}
