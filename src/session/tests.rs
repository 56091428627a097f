use super::*;
use crate::automation::{
    AutomationBackend, AutomationError, AutomationSession, PrincipalId, SessionId,
    SessionOptions, SimulatedBackend, SimulationScript, SubContext,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

fn pool_with(backend: &SimulatedBackend) -> SessionPool {
    SessionPool::new(Arc::new(backend.clone()), SessionPoolConfig::default())
}

#[tokio::test]
async fn test_get_session_reuses_live_session() {
    let backend = SimulatedBackend::default();
    let pool = pool_with(&backend);
    let options = SessionOptions::default();

    let first = pool.get_session(42, &options).await.unwrap();
    let second = pool.get_session(42, &options).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(backend.sessions_created(), 1);
    assert!(pool.is_active(42).await);
    assert!(!pool.is_active(7).await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_session() {
    let backend = SimulatedBackend::new(SimulationScript {
        creation_latency_ms: 500,
        ..Default::default()
    });
    let pool = Arc::new(pool_with(&backend));

    let callers = (0..8).map(|_| {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get_session(42, &SessionOptions::default()).await })
    });
    let sessions: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let first_id = sessions[0].id();
    assert!(sessions.iter().all(|s| s.id() == first_id));
    assert_eq!(backend.sessions_created(), 1);
    assert_eq!(backend.live_sessions(), 1);
}

#[tokio::test]
async fn test_stale_session_is_replaced() {
    let backend = SimulatedBackend::default();
    let pool = pool_with(&backend);
    let options = SessionOptions::default();

    let original = pool.get_session(42, &options).await.unwrap();
    assert_eq!(backend.crash_sessions_of(42), 1);
    assert!(!pool.is_active(42).await);

    let replacement = pool.get_session(42, &options).await.unwrap();
    assert_ne!(original.id(), replacement.id());
    assert_eq!(backend.sessions_created(), 2);
    assert_eq!(backend.sessions_destroyed(), 1);
    assert_eq!(backend.live_sessions(), 1);
}

#[tokio::test]
async fn test_creation_failure_leaves_no_entry() {
    let backend = SimulatedBackend::new(SimulationScript {
        creation_failures: 1,
        ..Default::default()
    });
    let pool = pool_with(&backend);
    let options = SessionOptions::default();

    let result = pool.get_session(42, &options).await;
    assert!(matches!(
        result,
        Err(SessionError::Creation { principal: 42, .. })
    ));
    assert!(pool.session_info(42).await.is_none());
    assert!(pool.is_empty().await);

    assert!(pool.get_session(42, &options).await.is_ok());
    assert_eq!(pool.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_creation_timeout_is_a_creation_error() {
    let backend = SimulatedBackend::new(SimulationScript {
        creation_latency_ms: 10_000,
        ..Default::default()
    });
    let pool = SessionPool::new(
        Arc::new(backend.clone()),
        SessionPoolConfig {
            creation_timeout: Duration::from_secs(1),
            ..Default::default()
        },
    );

    let error = pool
        .get_session(42, &SessionOptions::default())
        .await
        .unwrap_err();
    assert!(error.to_string().contains("timed out"));
    assert!(pool.is_empty().await);
    assert_eq!(backend.live_sessions(), 0);
}

#[tokio::test]
async fn test_close_session_is_idempotent() {
    let backend = SimulatedBackend::default();
    let pool = pool_with(&backend);

    pool.get_session(42, &SessionOptions::default()).await.unwrap();

    assert!(pool.close_session(42).await);
    assert!(!pool.close_session(42).await);
    assert!(!pool.close_session(99).await);
    assert_eq!(backend.sessions_destroyed(), 1);
    assert!(!pool.is_any_active().await);
}

#[tokio::test]
async fn test_force_close_all() {
    let backend = SimulatedBackend::default();
    let pool = pool_with(&backend);
    let options = SessionOptions::default();

    for principal in [3, 1, 2] {
        pool.get_session(principal, &options).await.unwrap();
    }
    assert_eq!(pool.active_principals().await, vec![1, 2, 3]);
    assert!(pool.is_any_active().await);

    assert_eq!(pool.force_close_all().await, 3);
    assert_eq!(backend.live_sessions(), 0);
    assert!(pool.active_principals().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reap_idle_skips_leased_sessions() {
    let backend = SimulatedBackend::default();
    let pool = pool_with(&backend);
    let options = SessionOptions::default();
    let timeout = Duration::from_secs(300);

    let lease = pool.lease(1, &options).await.unwrap();
    pool.get_session(2, &options).await.unwrap();

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(pool.reap_idle(timeout).await, vec![2]);
    assert!(pool.is_active(1).await);

    // dropping the lease counts as a use
    drop(lease);
    assert!(pool.reap_idle(timeout).await.is_empty());

    tokio::time::advance(Duration::from_secs(300)).await;
    assert_eq!(pool.reap_idle(timeout).await, vec![1]);
    assert_eq!(backend.live_sessions(), 0);
}

#[tokio::test]
async fn test_session_info_reflects_leases() {
    let backend = SimulatedBackend::default();
    let pool = pool_with(&backend);
    let options = SessionOptions {
        headless: false,
        ..Default::default()
    };

    let lease = pool.lease(42, &options).await.unwrap();
    assert_eq!(lease.principal(), 42);

    let info = pool.session_info(42).await.unwrap();
    assert_eq!(info.state, SessionState::Active);
    assert_eq!(info.leases, 1);
    assert_eq!(info.session_id, lease.session().id());
    assert!(!info.options.headless);

    drop(lease);
    let info = pool.session_info(42).await.unwrap();
    assert_eq!(info.state, SessionState::Idle);
    assert_eq!(info.leases, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_closes_idle_sessions_until_cancelled() {
    let backend = SimulatedBackend::default();
    let pool = Arc::new(pool_with(&backend));
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();

    pool.get_session(42, &SessionOptions::default()).await.unwrap();
    SessionReaper::spawn(
        Arc::clone(&pool),
        Duration::from_secs(60),
        Duration::from_secs(120),
        &tracker,
        cancel.clone(),
    );

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(pool.is_active(42).await);

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(!pool.is_active(42).await);
    assert_eq!(backend.sessions_destroyed(), 1);

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

/// Backend whose health probes and teardowns never answer.
struct StuckBackend {
    inner: SimulatedBackend,
}

#[derive(Debug)]
struct StuckSession {
    inner: Arc<dyn AutomationSession>,
}

#[async_trait]
impl AutomationSession for StuckSession {
    fn id(&self) -> SessionId {
        self.inner.id()
    }

    fn principal(&self) -> PrincipalId {
        self.inner.principal()
    }

    async fn is_healthy(&self) -> bool {
        std::future::pending().await
    }

    async fn derive_subcontext(&self) -> Result<Arc<dyn SubContext>, AutomationError> {
        self.inner.derive_subcontext().await
    }
}

#[async_trait]
impl AutomationBackend for StuckBackend {
    async fn create(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<Arc<dyn AutomationSession>, AutomationError> {
        let inner = self.inner.create(principal, options).await?;
        Ok(Arc::new(StuckSession { inner }))
    }

    async fn destroy(&self, _session: Arc<dyn AutomationSession>) -> Result<(), AutomationError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_gates_do_not_outlive_their_callers() {
    let backend = SimulatedBackend::default();
    let pool = pool_with(&backend);
    let options = SessionOptions::default();

    for principal in 0..200 {
        pool.get_session(principal, &options).await.unwrap();
        drop(pool.lease(principal, &options).await.unwrap());
        assert!(pool.close_session(principal).await);
    }
    assert!(pool.is_empty().await);
    assert_eq!(pool.gate_count(), 0);

    pool.get_session(7, &options).await.unwrap();
    assert_eq!(pool.reap_idle(Duration::ZERO).await, vec![7]);
    assert_eq!(pool.gate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_creation_releases_its_gate() {
    let backend = SimulatedBackend::new(SimulationScript {
        creation_latency_ms: 5_000,
        ..Default::default()
    });
    let pool = Arc::new(pool_with(&backend));

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get_session(1, &SessionOptions::default()).await })
    };
    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        pool.get_session(1, &SessionOptions::default()),
    )
    .await;
    assert!(abandoned.is_err());

    assert!(waiter.await.unwrap().is_ok());
    assert_eq!(pool.gate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_backend_calls_are_bounded() {
    let inner = SimulatedBackend::default();
    let pool = SessionPool::new(
        Arc::new(StuckBackend {
            inner: inner.clone(),
        }),
        SessionPoolConfig {
            creation_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    );
    let options = SessionOptions::default();

    let first = pool.get_session(42, &options).await.unwrap();
    assert!(!pool.check_health(&first).await);

    let started = Instant::now();
    let second = pool.get_session(42, &options).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(inner.sessions_created(), 2);
    // one health probe and one teardown, each cut off at the timeout
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(4), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);

    assert!(pool.close_session(42).await);
    assert_eq!(pool.force_close_all().await, 0);
    assert_eq!(pool.gate_count(), 0);
}
