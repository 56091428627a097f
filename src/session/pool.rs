use crate::automation::{AutomationBackend, AutomationSession, PrincipalId, SessionOptions};
use crate::session::types::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Usage counters shared between a pool entry and its outstanding leases.
#[derive(Debug)]
struct SessionUsage {
    leases: AtomicUsize,
    last_used: StdMutex<Instant>,
}

impl SessionUsage {
    fn new() -> Self {
        Self {
            leases: AtomicUsize::new(0),
            last_used: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self
            .last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct SessionEntry {
    session: Arc<dyn AutomationSession>,
    options: SessionOptions,
    created_at: DateTime<Utc>,
    usage: Arc<SessionUsage>,
}

/// Marks a pooled session as in use until dropped.
///
/// The idle reaper never closes a session with an outstanding lease.
#[derive(Debug)]
pub struct SessionLease {
    principal: PrincipalId,
    session: Arc<dyn AutomationSession>,
    usage: Arc<SessionUsage>,
}

impl SessionLease {
    pub fn principal(&self) -> PrincipalId {
        self.principal
    }

    pub fn session(&self) -> &Arc<dyn AutomationSession> {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.usage.leases.fetch_sub(1, Ordering::SeqCst);
        self.usage.touch();
    }
}

type GateMap = StdMutex<HashMap<PrincipalId, Arc<Mutex<()>>>>;

/// A claim on one principal's creation gate.
///
/// The gate is dropped from the map when the last ticket for it goes away,
/// so the map only holds principals with a call in flight.
struct GateTicket<'a> {
    gates: &'a GateMap,
    principal: PrincipalId,
    gate: Arc<Mutex<()>>,
}

impl GateTicket<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        let mut gates = lock_gates(self.gates);
        // the map's reference plus ours
        if gates
            .get(&self.principal)
            .is_some_and(|gate| Arc::ptr_eq(gate, &self.gate) && Arc::strong_count(gate) == 2)
        {
            gates.remove(&self.principal);
        }
    }
}

fn lock_gates(gates: &GateMap) -> std::sync::MutexGuard<'_, HashMap<PrincipalId, Arc<Mutex<()>>>> {
    gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the principal → session mapping.
///
/// Lookups and map mutations go through a short-lived map lock. Creation for
/// one principal is serialized by a per-principal gate so that concurrent
/// callers never produce two live sessions, while the map lock itself is
/// never held across a backend call.
///
/// Every backend call is bounded by the creation timeout, so a hung backend
/// cannot hold a gate forever.
pub struct SessionPool {
    backend: Arc<dyn AutomationBackend>,
    config: SessionPoolConfig,
    entries: Mutex<HashMap<PrincipalId, SessionEntry>>,
    gates: GateMap,
}

impl SessionPool {
    pub fn new(backend: Arc<dyn AutomationBackend>, config: SessionPoolConfig) -> Self {
        Self {
            backend,
            config,
            entries: Mutex::new(HashMap::new()),
            gates: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    /// Return the live session for `principal`, creating one if needed.
    ///
    /// An unhealthy session is dropped from the map and destroyed before a
    /// replacement is created. On creation failure the pool holds no entry for
    /// the principal.
    pub async fn get_session(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<Arc<dyn AutomationSession>, SessionError> {
        let gate = self.gate(principal);
        let _guard = gate.lock().await;
        let (session, _) = self.acquire_locked(principal, options).await?;
        Ok(session)
    }

    /// Like [`SessionPool::get_session`] but marks the session in use until
    /// the returned lease is dropped.
    pub async fn lease(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<SessionLease, SessionError> {
        let gate = self.gate(principal);
        let _guard = gate.lock().await;
        let (session, usage) = self.acquire_locked(principal, options).await?;
        usage.leases.fetch_add(1, Ordering::SeqCst);
        usage.touch();

        Ok(SessionLease {
            principal,
            session,
            usage,
        })
    }

    async fn acquire_locked(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<(Arc<dyn AutomationSession>, Arc<SessionUsage>), SessionError> {
        let existing = {
            let entries = self.entries.lock().await;
            entries
                .get(&principal)
                .map(|entry| (Arc::clone(&entry.session), Arc::clone(&entry.usage)))
        };

        if let Some((session, usage)) = existing {
            if self.check_health(&session).await {
                debug!("Reusing session {} for principal {}", session.id(), principal);
                usage.touch();
                return Ok((session, usage));
            }

            warn!(
                "Session {} for principal {} is stale, replacing it",
                session.id(),
                principal
            );
            // a close racing us through another path may already have taken it
            self.remove_if_same(principal, &session).await;
            self.destroy(session).await;
        }

        self.create_locked(principal, options).await
    }

    async fn create_locked(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<(Arc<dyn AutomationSession>, Arc<SessionUsage>), SessionError> {
        info!("Creating session for principal {}", principal);

        let created =
            tokio::time::timeout(self.config.creation_timeout, self.backend.create(principal, options))
                .await;

        let session = match created {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!("Session creation failed for principal {}: {}", principal, e);
                self.entries.lock().await.remove(&principal);
                return Err(SessionError::Creation {
                    principal,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                error!(
                    "Session creation for principal {} timed out after {:?}",
                    principal, self.config.creation_timeout
                );
                self.entries.lock().await.remove(&principal);
                return Err(SessionError::Creation {
                    principal,
                    reason: format!("timed out after {:?}", self.config.creation_timeout),
                });
            }
        };

        let usage = Arc::new(SessionUsage::new());
        // nothing else inserts while we hold the gate, but a replaced entry
        // must still be torn down rather than leaked
        let replaced = self.entries.lock().await.insert(
            principal,
            SessionEntry {
                session: Arc::clone(&session),
                options: options.clone(),
                created_at: Utc::now(),
                usage: Arc::clone(&usage),
            },
        );
        if let Some(stale) = replaced {
            self.destroy(stale.session).await;
        }

        info!("Session {} ready for principal {}", session.id(), principal);
        Ok((session, usage))
    }

    /// Tear down the principal's session. Returns whether one was closed.
    pub async fn close_session(&self, principal: PrincipalId) -> bool {
        let gate = self.gate(principal);
        let _guard = gate.lock().await;

        let removed = self.entries.lock().await.remove(&principal);
        match removed {
            Some(entry) => {
                info!("Closing session {} for principal {}", entry.session.id(), principal);
                self.destroy(entry.session).await;
                true
            }
            None => false,
        }
    }

    /// Close every tracked session. Returns how many were closed.
    pub async fn force_close_all(&self) -> usize {
        let drained: Vec<(PrincipalId, SessionEntry)> =
            self.entries.lock().await.drain().collect();
        let count = drained.len();

        for (principal, entry) in drained {
            debug!("Force-closing session {} for principal {}", entry.session.id(), principal);
            self.destroy(entry.session).await;
        }

        if count > 0 {
            info!("Force-closed {} sessions", count);
        }
        count
    }

    pub async fn is_active(&self, principal: PrincipalId) -> bool {
        let session = {
            let entries = self.entries.lock().await;
            entries.get(&principal).map(|entry| Arc::clone(&entry.session))
        };
        match session {
            Some(session) => self.check_health(&session).await,
            None => false,
        }
    }

    pub async fn is_any_active(&self) -> bool {
        let sessions: Vec<Arc<dyn AutomationSession>> = {
            let entries = self.entries.lock().await;
            entries.values().map(|entry| Arc::clone(&entry.session)).collect()
        };
        for session in sessions {
            if self.check_health(&session).await {
                return true;
            }
        }
        false
    }

    /// Close sessions with no outstanding lease that have been unused for at
    /// least `timeout`. Returns the reaped principals.
    pub async fn reap_idle(&self, timeout: Duration) -> Vec<PrincipalId> {
        let candidates: Vec<PrincipalId> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.usage.leases() == 0 && entry.usage.idle_for() >= timeout)
                .map(|(principal, _)| *principal)
                .collect()
        };

        let mut reaped = Vec::new();
        for principal in candidates {
            // re-check under the gate: a lease may have been taken since the scan
            let gate = self.gate(principal);
            let _guard = gate.lock().await;

            let removed = {
                let mut entries = self.entries.lock().await;
                let still_idle = entries.get(&principal).is_some_and(|entry| {
                    entry.usage.leases() == 0 && entry.usage.idle_for() >= timeout
                });
                if still_idle {
                    entries.remove(&principal)
                } else {
                    None
                }
            };

            if let Some(entry) = removed {
                info!(
                    "Reaping idle session {} for principal {} (idle {:?})",
                    entry.session.id(),
                    principal,
                    entry.usage.idle_for()
                );
                self.destroy(entry.session).await;
                reaped.push(principal);
            }
        }
        reaped
    }

    pub async fn session_info(&self, principal: PrincipalId) -> Option<SessionInfo> {
        let entries = self.entries.lock().await;
        entries.get(&principal).map(|entry| {
            let leases = entry.usage.leases();
            SessionInfo {
                session_id: entry.session.id(),
                principal,
                state: if leases > 0 {
                    SessionState::Active
                } else {
                    SessionState::Idle
                },
                created_at: entry.created_at,
                idle_for: entry.usage.idle_for(),
                leases,
                options: entry.options.clone(),
            }
        })
    }

    pub async fn active_principals(&self) -> Vec<PrincipalId> {
        let mut principals: Vec<PrincipalId> =
            self.entries.lock().await.keys().copied().collect();
        principals.sort_unstable();
        principals
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Health probe bounded by the creation timeout; a probe that never
    /// answers counts as unhealthy.
    pub async fn check_health(&self, session: &Arc<dyn AutomationSession>) -> bool {
        match tokio::time::timeout(self.config.creation_timeout, session.is_healthy()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                warn!(
                    "Health check of session {} timed out after {:?}",
                    session.id(),
                    self.config.creation_timeout
                );
                false
            }
        }
    }

    fn gate(&self, principal: PrincipalId) -> GateTicket<'_> {
        let gate = Arc::clone(lock_gates(&self.gates).entry(principal).or_default());
        GateTicket {
            gates: &self.gates,
            principal,
            gate,
        }
    }

    #[cfg(test)]
    pub(crate) fn gate_count(&self) -> usize {
        lock_gates(&self.gates).len()
    }

    async fn remove_if_same(&self, principal: PrincipalId, session: &Arc<dyn AutomationSession>) {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&principal)
            .is_some_and(|entry| entry.session.id() == session.id())
        {
            entries.remove(&principal);
        }
    }

    async fn destroy(&self, session: Arc<dyn AutomationSession>) {
        let session_id = session.id();
        match tokio::time::timeout(self.config.creation_timeout, self.backend.destroy(session)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to destroy session {}: {}", session_id, e),
            Err(_) => warn!(
                "Destroying session {} timed out after {:?}, dropping it",
                session_id, self.config.creation_timeout
            ),
        }
    }
}
