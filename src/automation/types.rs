use crate::resilience::ResilienceError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External identity that exclusively owns one automation session.
pub type PrincipalId = i64;

/// Unique identifier for a live automation session
pub type SessionId = Uuid;

/// Unique identifier for a sub-context derived from a session
pub type SubContextId = Uuid;

/// Failures reported by the external automation resource.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AutomationError {
    #[error("automation resource unavailable: {0}")]
    Unavailable(String),
    #[error("transient automation failure: {0}")]
    Transient(String),
    #[error("interaction rejected: {0}")]
    Rejected(String),
    #[error("sub-context {0} already released")]
    Released(SubContextId),
}

impl From<AutomationError> for ResilienceError {
    fn from(error: AutomationError) -> Self {
        match error {
            AutomationError::Unavailable(_) | AutomationError::Transient(_) => {
                ResilienceError::Transient(error.to_string())
            }
            AutomationError::Rejected(_) | AutomationError::Released(_) => {
                ResilienceError::Permanent(error.to_string())
            }
        }
    }
}

/// Options used when a session has to be created for a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub headless: bool,
    pub debug_mode: bool,
    pub profile: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            headless: true,
            debug_mode: false,
            profile: None,
        }
    }
}

/// One interaction step performed against a sub-context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub step: String,
    pub item_label: String,
    pub item: serde_json::Value,
    pub params: serde_json::Value,
    pub previous: Option<serde_json::Value>,
}
