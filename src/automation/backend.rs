//! Narrow interfaces to the external automation resource.
//!
//! The engine never talks to the target directly: it creates and destroys
//! sessions through an [`AutomationBackend`], derives isolated
//! [`SubContext`]s from a session, and performs opaque interaction steps
//! against them.

use crate::automation::types::*;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Create a new long-lived session for `principal`. May be slow and may fail.
    async fn create(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<Arc<dyn AutomationSession>, AutomationError>;

    /// Tear a session down. Implementations should tolerate repeated calls.
    async fn destroy(&self, session: Arc<dyn AutomationSession>) -> Result<(), AutomationError>;

    fn name(&self) -> &'static str {
        "automation"
    }
}

#[async_trait]
pub trait AutomationSession: Send + Sync + fmt::Debug {
    fn id(&self) -> SessionId;

    fn principal(&self) -> PrincipalId;

    async fn is_healthy(&self) -> bool;

    async fn derive_subcontext(&self) -> Result<Arc<dyn SubContext>, AutomationError>;
}

#[async_trait]
pub trait SubContext: Send + Sync + fmt::Debug {
    fn id(&self) -> SubContextId;

    async fn perform(&self, request: &StepRequest) -> Result<serde_json::Value, AutomationError>;

    async fn release(&self) -> Result<(), AutomationError>;
}

pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// A sub-context that is released at most once, whoever asks first.
///
/// Both the task that owns it and a concurrent batch cancellation may try to
/// release the same sub-context; only the first call reaches the backend.
#[derive(Debug)]
pub struct LeasedSubContext {
    inner: Arc<dyn SubContext>,
    released: AtomicBool,
    release_timeout: Duration,
}

impl LeasedSubContext {
    pub fn new(inner: Arc<dyn SubContext>) -> Self {
        Self {
            inner,
            released: AtomicBool::new(false),
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    /// Bound on the backend release call.
    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn id(&self) -> SubContextId {
        self.inner.id()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn perform(
        &self,
        request: &StepRequest,
    ) -> Result<serde_json::Value, AutomationError> {
        if self.is_released() {
            return Err(AutomationError::Released(self.id()));
        }
        self.inner.perform(request).await
    }

    /// Returns whether this call performed the release.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        match tokio::time::timeout(self.release_timeout, self.inner.release()).await {
            Ok(Ok(())) => debug!("Released sub-context {}", self.id()),
            Ok(Err(e)) => warn!("Failed to release sub-context {}: {}", self.id(), e),
            Err(_) => warn!(
                "Releasing sub-context {} timed out after {:?}",
                self.id(),
                self.release_timeout
            ),
        }
        true
    }
}
