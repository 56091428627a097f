//! In-process automation backend driven by a script.
//!
//! Used by the CLI demo and the test suite. It models latency, scripted
//! failures per item and live-resource accounting, nothing about any real
//! target UI.

use crate::automation::backend::{AutomationBackend, AutomationSession, SubContext};
use crate::automation::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Scripted behaviour for one work item, keyed by item label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemScript {
    /// Number of transient failures before the scripted step succeeds
    pub transient_failures: u32,
    /// Reject the item outright on the scripted step
    pub reject: bool,
    /// Step the script applies to; the first step when unset
    pub step: Option<String>,
    /// Extra latency for this item's steps
    pub extra_latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationScript {
    pub step_latency_ms: u64,
    pub creation_latency_ms: u64,
    /// The first N session creations fail
    pub creation_failures: u32,
    /// Every creation after this many successful ones fails
    pub creation_limit: Option<usize>,
    pub items: HashMap<String, ItemScript>,
}

impl SimulationScript {
    pub fn with_item(mut self, label: impl Into<String>, script: ItemScript) -> Self {
        self.items.insert(label.into(), script);
        self
    }
}

#[derive(Debug, Default)]
struct SimState {
    creations: AtomicU32,
    sessions_created: AtomicUsize,
    sessions_destroyed: AtomicUsize,
    subcontexts_created: AtomicUsize,
    subcontexts_released: AtomicUsize,
    live_subcontexts: AtomicUsize,
    attempts: Mutex<HashMap<String, u32>>,
    step_attempts: Mutex<HashMap<(String, String), u32>>,
    sessions: Mutex<HashMap<SessionId, LiveSession>>,
}

#[derive(Debug)]
struct LiveSession {
    principal: PrincipalId,
    healthy: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    script: Arc<SimulationScript>,
    state: Arc<SimState>,
}

impl SimulatedBackend {
    pub fn new(script: SimulationScript) -> Self {
        Self {
            script: Arc::new(script),
            state: Arc::new(SimState::default()),
        }
    }

    pub fn sessions_created(&self) -> usize {
        self.state.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.state.sessions_destroyed.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.state.sessions).len()
    }

    pub fn subcontexts_created(&self) -> usize {
        self.state.subcontexts_created.load(Ordering::SeqCst)
    }

    pub fn subcontexts_released(&self) -> usize {
        self.state.subcontexts_released.load(Ordering::SeqCst)
    }

    pub fn live_subcontexts(&self) -> usize {
        self.state.live_subcontexts.load(Ordering::SeqCst)
    }

    /// Number of times any step was performed for `item_label`.
    pub fn attempts(&self, item_label: &str) -> u32 {
        lock(&self.state.attempts)
            .get(item_label)
            .copied()
            .unwrap_or(0)
    }

    /// Mark every live session of `principal` as crashed.
    pub fn crash_sessions_of(&self, principal: PrincipalId) -> usize {
        let sessions = lock(&self.state.sessions);
        let mut crashed = 0;
        for live in sessions.values().filter(|s| s.principal == principal) {
            live.healthy.store(false, Ordering::SeqCst);
            crashed += 1;
        }
        crashed
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(SimulationScript::default())
    }
}

#[async_trait]
impl AutomationBackend for SimulatedBackend {
    async fn create(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<Arc<dyn AutomationSession>, AutomationError> {
        if self.script.creation_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.creation_latency_ms)).await;
        }

        let attempt = self.state.creations.fetch_add(1, Ordering::SeqCst);
        if attempt < self.script.creation_failures {
            return Err(AutomationError::Unavailable(format!(
                "scripted creation failure {} for principal {}",
                attempt + 1,
                principal
            )));
        }

        if let Some(limit) = self.script.creation_limit
            && self.sessions_created() >= limit
        {
            return Err(AutomationError::Unavailable(format!(
                "session limit of {} reached for principal {}",
                limit, principal
            )));
        }

        let healthy = Arc::new(AtomicBool::new(true));
        let session = Arc::new(SimulatedSession {
            id: Uuid::new_v4(),
            principal,
            headless: options.headless,
            healthy: Arc::clone(&healthy),
            script: Arc::clone(&self.script),
            state: Arc::clone(&self.state),
        });
        lock(&self.state.sessions).insert(session.id, LiveSession { principal, healthy });
        self.state.sessions_created.fetch_add(1, Ordering::SeqCst);

        info!(
            "Simulated session {} created for principal {} (headless: {})",
            session.id, principal, options.headless
        );
        Ok(session)
    }

    async fn destroy(&self, session: Arc<dyn AutomationSession>) -> Result<(), AutomationError> {
        if lock(&self.state.sessions).remove(&session.id()).is_some() {
            self.state.sessions_destroyed.fetch_add(1, Ordering::SeqCst);
            debug!("Simulated session {} destroyed", session.id());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

pub struct SimulatedSession {
    id: SessionId,
    principal: PrincipalId,
    headless: bool,
    healthy: Arc<AtomicBool>,
    script: Arc<SimulationScript>,
    state: Arc<SimState>,
}

impl fmt::Debug for SimulatedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedSession")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("headless", &self.headless)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl SimulatedSession {
    pub fn is_headless(&self) -> bool {
        self.headless
    }
}

#[async_trait]
impl AutomationSession for SimulatedSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn principal(&self) -> PrincipalId {
        self.principal
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && lock(&self.state.sessions).contains_key(&self.id)
    }

    async fn derive_subcontext(&self) -> Result<Arc<dyn SubContext>, AutomationError> {
        if !self.is_healthy().await {
            return Err(AutomationError::Unavailable(format!(
                "session {} is no longer usable",
                self.id
            )));
        }

        self.state.subcontexts_created.fetch_add(1, Ordering::SeqCst);
        self.state.live_subcontexts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedSubContext {
            id: Uuid::new_v4(),
            session_id: self.id,
            released: AtomicBool::new(false),
            script: Arc::clone(&self.script),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct SimulatedSubContext {
    id: SubContextId,
    session_id: SessionId,
    released: AtomicBool,
    script: Arc<SimulationScript>,
    state: Arc<SimState>,
}

impl fmt::Debug for SimulatedSubContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedSubContext")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("released", &self.released)
            .finish()
    }
}

#[async_trait]
impl SubContext for SimulatedSubContext {
    fn id(&self) -> SubContextId {
        self.id
    }

    async fn perform(&self, request: &StepRequest) -> Result<serde_json::Value, AutomationError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AutomationError::Released(self.id));
        }

        let item_script = self.script.items.get(&request.item_label);
        let latency = self.script.step_latency_ms
            + item_script.map(|s| s.extra_latency_ms).unwrap_or(0);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        // a cancellation may have released us while the step was in flight
        if self.released.load(Ordering::SeqCst) {
            return Err(AutomationError::Released(self.id));
        }

        *lock(&self.state.attempts)
            .entry(request.item_label.clone())
            .or_insert(0) += 1;
        let attempt = {
            let mut step_attempts = lock(&self.state.step_attempts);
            let counter = step_attempts
                .entry((request.item_label.clone(), request.step.clone()))
                .or_insert(0);
            *counter += 1;
            *counter
        };

        if let Some(script) = item_script {
            let scripted_step = match &script.step {
                Some(step) => step == &request.step,
                None => request.previous.is_none(),
            };
            if scripted_step {
                if script.reject {
                    return Err(AutomationError::Rejected(format!(
                        "{} refused at step '{}'",
                        request.item_label, request.step
                    )));
                }
                if attempt <= script.transient_failures {
                    return Err(AutomationError::Transient(format!(
                        "{} step '{}' failed (attempt {})",
                        request.item_label, request.step, attempt
                    )));
                }
            }
        }

        Ok(json!({
            "step": request.step,
            "item": request.item_label,
            "session": self.session_id.to_string(),
            "subcontext": self.id.to_string(),
            "attempt": attempt,
        }))
    }

    async fn release(&self) -> Result<(), AutomationError> {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.state.live_subcontexts.fetch_sub(1, Ordering::SeqCst);
            self.state.subcontexts_released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
