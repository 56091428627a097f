use super::*;
use crate::automation::{
    AutomationBackend, AutomationError, AutomationSession, ItemScript, PrincipalId, SessionId,
    SessionOptions, SimulatedBackend, SimulationScript, StepRequest, SubContext, SubContextId,
};
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerState, ResilienceLayer, ResilienceProfile, RetryPolicy,
    SESSION_PROFILE, STEP_PROFILE,
};
use crate::session::{SessionError, SessionPool, SessionPoolConfig};
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use uuid::Uuid;

fn test_layer() -> ResilienceLayer {
    let profile = ResilienceProfile {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: false,
        },
        breaker: CircuitBreakerConfig {
            failure_threshold: 50,
            cooldown: Duration::from_secs(60),
        },
        rate_limit: None,
        timeout: Duration::from_secs(5),
    };
    ResilienceLayer::new(profile.clone())
        .with_profile(SESSION_PROFILE, profile.clone())
        .with_profile(STEP_PROFILE, profile)
}

fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig {
        inter_task_delay: Duration::ZERO,
        batch_retention: Duration::from_secs(10),
        ..Default::default()
    }
}

fn orchestrator(backend: &SimulatedBackend, config: OrchestratorConfig) -> TaskOrchestrator {
    let pool = Arc::new(SessionPool::new(
        Arc::new(backend.clone()),
        SessionPoolConfig::default(),
    ));
    TaskOrchestrator::new(pool, test_layer(), config)
}

fn items(labels: &[&str]) -> Vec<WorkItem> {
    labels.iter().map(|label| WorkItem::labelled(*label)).collect()
}

fn single_step() -> BatchParams {
    BatchParams {
        steps: vec!["book".to_string()],
        ..Default::default()
    }
}

fn drain(rx: &mut UnboundedReceiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn on_event(&self, _event: OrchestratorEvent) -> anyhow::Result<()> {
        Err(anyhow!("delivery failed"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_completes_all_items_in_order() {
    let backend = SimulatedBackend::default();
    let orchestrator = orchestrator(&backend, quick_config());
    let (sink, mut rx) = ChannelEventSink::channel();

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B", "C"]), BatchParams::default(), Arc::new(sink))
        .await
        .unwrap();
    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();

    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.completed, 3);
    assert_eq!(snapshot.batch.failed, 0);
    assert!(snapshot.batch.is_settled());
    for task in &snapshot.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.steps.len(), 3);
        assert!(task.subcontext.is_none());
        assert_eq!(task.result.as_ref().unwrap()["step"], "confirm");
    }

    assert_eq!(backend.sessions_created(), 1);
    assert_eq!(backend.subcontexts_created(), 3);
    assert_eq!(backend.subcontexts_released(), 3);
    assert_eq!(backend.live_subcontexts(), 0);

    let events = drain(&mut rx);
    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Started,
            EventKind::Started,
            EventKind::TaskOk,
            EventKind::Started,
            EventKind::TaskOk,
            EventKind::Started,
            EventKind::TaskOk,
            EventKind::BatchSummary,
        ]
    );
    assert!(events[0].task_id.is_none());
    assert_eq!(events[2].task_id, Some(snapshot.tasks[0].id));
    assert_eq!(events[6].task_id, Some(snapshot.tasks[2].id));

    let summary = &events[7].text;
    assert!(summary.contains("completed=3, failed=0"));
    assert!(summary.contains("completed items: A, B, C"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_item_does_not_abort_batch() {
    let backend = SimulatedBackend::new(SimulationScript::default().with_item(
        "B",
        ItemScript {
            reject: true,
            ..Default::default()
        },
    ));
    let orchestrator = orchestrator(&backend, quick_config());
    let (sink, mut rx) = ChannelEventSink::channel();

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B", "C"]), BatchParams::default(), Arc::new(sink))
        .await
        .unwrap();
    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();

    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.completed, 2);
    assert_eq!(snapshot.batch.failed, 1);

    let failed = snapshot.task_by_label("B").unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.step, "navigate");
    assert_eq!(error.kind, "Permanent");
    assert_eq!(error.attempts, 1);
    assert_eq!(backend.live_subcontexts(), 0);

    let events = drain(&mut rx);
    let fail = events
        .iter()
        .find(|event| event.kind == EventKind::TaskFail)
        .unwrap();
    assert_eq!(fail.task_id, Some(failed.id));
    assert!(fail.text.contains("B failed"));
    assert!(events.last().unwrap().text.contains("completed items: A, C"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_item_failure_is_retried() {
    let backend = SimulatedBackend::new(SimulationScript::default().with_item(
        "B",
        ItemScript {
            transient_failures: 2,
            ..Default::default()
        },
    ));
    let orchestrator = orchestrator(&backend, quick_config());

    let batch_id = orchestrator
        .start_batch(
            42,
            items(&["A", "B", "C"]),
            single_step(),
            Arc::new(TracingEventSink),
        )
        .await
        .unwrap();
    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();

    let task = snapshot.task_by_label("B").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(
        task.steps,
        vec![StepRecord {
            step: "book".to_string(),
            attempts: 3,
            succeeded: true,
        }]
    );
    assert_eq!(backend.attempts("B"), 3);
    assert_eq!(snapshot.batch.completed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_marks_task_failed() {
    let backend = SimulatedBackend::new(SimulationScript::default().with_item(
        "B",
        ItemScript {
            transient_failures: 10,
            ..Default::default()
        },
    ));
    let orchestrator = orchestrator(&backend, quick_config());

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B"]), BatchParams::default(), Arc::new(TracingEventSink))
        .await
        .unwrap();
    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();

    let task = snapshot.task_by_label("B").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.as_ref().unwrap();
    assert_eq!(error.kind, "Transient");
    assert_eq!(error.attempts, 3);
    assert!(error.cause.contains("retry exhausted"));
    assert_eq!(snapshot.batch.completed + snapshot.batch.failed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_session_creation_failure_rejects_batch() {
    let backend = SimulatedBackend::new(SimulationScript {
        creation_failures: 10,
        ..Default::default()
    });
    let orchestrator = orchestrator(&backend, quick_config());

    let result = orchestrator
        .start_batch(42, items(&["A", "B"]), BatchParams::default(), Arc::new(TracingEventSink))
        .await;

    assert!(matches!(
        result,
        Err(OrchestratorError::SessionCreation(SessionError::Creation {
            principal: 42,
            ..
        }))
    ));
    assert_eq!(orchestrator.batch_count(), 0);
    assert_eq!(backend.subcontexts_created(), 0);
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let backend = SimulatedBackend::default();
    let orchestrator = orchestrator(&backend, quick_config());

    let result = orchestrator
        .start_batch(42, Vec::new(), BatchParams::default(), Arc::new(TracingEventSink))
        .await;

    assert_eq!(result, Err(OrchestratorError::EmptyBatch));
    assert_eq!(backend.sessions_created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_pending_tasks_and_settles_running_one() {
    let backend = SimulatedBackend::new(SimulationScript {
        step_latency_ms: 1000,
        ..Default::default()
    });
    let orchestrator = orchestrator(&backend, quick_config());
    let (sink, mut rx) = ChannelEventSink::channel();

    let batch_id = orchestrator
        .start_batch(
            42,
            items(&["A", "B", "C", "D", "E"]),
            single_step(),
            Arc::new(sink),
        )
        .await
        .unwrap();

    // A finishes at 1s, B is mid-step at 1.5s
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(orchestrator.cancel_batch(batch_id).await, Ok(true));
    assert_eq!(
        orchestrator.get_status(batch_id).await.unwrap().batch.status,
        BatchStatus::Cancelled
    );

    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();
    assert_eq!(snapshot.batch.status, BatchStatus::Cancelled);
    assert!(snapshot.batch.is_settled());
    assert_eq!(snapshot.batch.completed, 1);
    assert_eq!(snapshot.batch.cancelled, 4);

    assert_eq!(snapshot.tasks[0].status, TaskStatus::Completed);
    let running = &snapshot.tasks[1];
    assert_eq!(running.status, TaskStatus::Cancelled);
    assert_eq!(running.error.as_ref().unwrap().kind, "Cancelled");
    assert!(running.started_at.is_some());
    for task in &snapshot.tasks[2..] {
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
    }

    assert_eq!(backend.subcontexts_created(), 2);
    assert_eq!(backend.live_subcontexts(), 0);
    assert_eq!(orchestrator.cancel_batch(batch_id).await, Ok(false));

    let events = drain(&mut rx);
    let started: Vec<_> = events
        .iter()
        .filter(|event| event.kind == EventKind::Started && event.task_id.is_some())
        .collect();
    assert_eq!(started.len(), 2);
    assert_eq!(events.last().unwrap().kind, EventKind::BatchSummary);
}

#[tokio::test]
async fn test_unknown_batch_is_reported() {
    let backend = SimulatedBackend::default();
    let orchestrator = orchestrator(&backend, quick_config());
    let missing = uuid::Uuid::new_v4();

    assert_eq!(
        orchestrator.cancel_batch(missing).await,
        Err(OrchestratorError::BatchNotFound(missing))
    );
    assert!(orchestrator.get_status(missing).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_mode_caps_simultaneous_subcontexts() {
    let backend = SimulatedBackend::new(SimulationScript {
        step_latency_ms: 1000,
        ..Default::default()
    });
    let orchestrator = orchestrator(
        &backend,
        OrchestratorConfig {
            max_concurrent_subcontexts: 2,
            ..quick_config()
        },
    );
    let params = BatchParams {
        execution_mode: Some(ExecutionMode::Concurrent),
        ..single_step()
    };

    let started = Instant::now();
    let batch_id = orchestrator
        .start_batch(
            42,
            items(&["A", "B", "C", "D", "E", "F"]),
            params,
            Arc::new(TracingEventSink),
        )
        .await
        .unwrap();
    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(snapshot.batch.completed, 6);
    assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3500), "elapsed {:?}", elapsed);
    assert_eq!(backend.live_subcontexts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_session_is_reacquired_between_tasks() {
    let backend = SimulatedBackend::new(SimulationScript {
        step_latency_ms: 1000,
        ..Default::default()
    });
    let orchestrator = orchestrator(&backend, quick_config());

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B"]), single_step(), Arc::new(TracingEventSink))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.crash_sessions_of(42), 1);

    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();
    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.completed, 2);
    assert_eq!(backend.sessions_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unrecoverable_session_loss_fails_batch() {
    let backend = SimulatedBackend::new(SimulationScript {
        step_latency_ms: 1000,
        creation_limit: Some(1),
        ..Default::default()
    });
    let orchestrator = orchestrator(&backend, quick_config());
    let (sink, mut rx) = ChannelEventSink::channel();

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B", "C"]), single_step(), Arc::new(sink))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    backend.crash_sessions_of(42);

    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();
    assert_eq!(snapshot.batch.status, BatchStatus::Failed);
    assert_eq!(snapshot.batch.completed, 1);
    assert_eq!(snapshot.batch.failed, 2);
    assert!(snapshot.batch.is_settled());
    for task in &snapshot.tasks[1..] {
        assert_eq!(task.error.as_ref().unwrap().kind, "SessionUnavailable");
    }

    let summary = drain(&mut rx).pop().unwrap();
    assert_eq!(summary.kind, EventKind::BatchSummary);
    assert!(summary.text.contains("session lost"));
}

#[tokio::test(start_paused = true)]
async fn test_active_batches_and_retention() {
    let backend = SimulatedBackend::new(SimulationScript {
        step_latency_ms: 1000,
        ..Default::default()
    });
    let orchestrator = orchestrator(&backend, quick_config());

    let batch_id = orchestrator
        .start_batch(42, items(&["A"]), single_step(), Arc::new(TracingEventSink))
        .await
        .unwrap();

    let active = orchestrator.list_active_batches(42).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, batch_id);
    assert!(orchestrator.list_active_batches(7).await.is_empty());

    orchestrator.wait_for_batch(batch_id).await.unwrap();
    assert!(orchestrator.list_active_batches(42).await.is_empty());
    assert!(orchestrator.get_status(batch_id).await.is_ok());

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        orchestrator.get_status(batch_id).await.unwrap_err(),
        OrchestratorError::BatchNotFound(batch_id)
    );
    assert_eq!(orchestrator.batch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_batches_and_rejects_new_ones() {
    let backend = SimulatedBackend::new(SimulationScript {
        step_latency_ms: 1000,
        ..Default::default()
    });
    let orchestrator = orchestrator(&backend, quick_config());

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B", "C"]), single_step(), Arc::new(TracingEventSink))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    orchestrator.shutdown().await;

    let snapshot = orchestrator.get_status(batch_id).await.unwrap();
    assert_eq!(snapshot.batch.status, BatchStatus::Cancelled);
    assert!(snapshot.batch.is_settled());
    assert_eq!(backend.live_subcontexts(), 0);

    let result = orchestrator
        .start_batch(42, items(&["D"]), single_step(), Arc::new(TracingEventSink))
        .await;
    assert_eq!(result, Err(OrchestratorError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn test_failing_sink_does_not_affect_execution() {
    let backend = SimulatedBackend::default();
    let orchestrator = orchestrator(&backend, quick_config());

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B"]), BatchParams::default(), Arc::new(FailingSink))
        .await
        .unwrap();
    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();

    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.completed, 2);
}

#[test]
fn test_status_terminality() {
    assert!(!TaskStatus::Pending.is_terminal());
    assert!(!TaskStatus::Running.is_terminal());
    assert!(TaskStatus::Cancelled.is_terminal());
    assert!(!BatchStatus::InProgress.is_terminal());
    assert!(BatchStatus::Failed.is_terminal());

    let mut batch = Batch::new(1, 3);
    batch.count(TaskStatus::Completed);
    batch.count(TaskStatus::Failed);
    assert!(!batch.is_settled());
    batch.count(TaskStatus::Cancelled);
    assert!(batch.is_settled());
}

/// Refuses session creation for one principal and delegates the rest.
struct RefusingBackend {
    inner: SimulatedBackend,
    refused: PrincipalId,
}

#[async_trait]
impl AutomationBackend for RefusingBackend {
    async fn create(
        &self,
        principal: PrincipalId,
        options: &SessionOptions,
    ) -> Result<Arc<dyn AutomationSession>, AutomationError> {
        if principal == self.refused {
            return Err(AutomationError::Unavailable(format!("no browser for {}", principal)));
        }
        self.inner.create(principal, options).await
    }

    async fn destroy(&self, session: Arc<dyn AutomationSession>) -> Result<(), AutomationError> {
        self.inner.destroy(session).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_principal_does_not_trip_others() {
    let session_profile = ResilienceProfile {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: false,
        },
        breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(600),
        },
        rate_limit: None,
        timeout: Duration::from_secs(5),
    };
    let inner = SimulatedBackend::default();
    let pool = Arc::new(SessionPool::new(
        Arc::new(RefusingBackend {
            inner: inner.clone(),
            refused: 1,
        }),
        SessionPoolConfig::default(),
    ));
    let orchestrator = TaskOrchestrator::new(
        pool,
        test_layer().with_profile(SESSION_PROFILE, session_profile),
        quick_config(),
    );

    for _ in 0..2 {
        let result = orchestrator
            .start_batch(1, items(&["A"]), single_step(), Arc::new(TracingEventSink))
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::SessionCreation(SessionError::Creation { principal: 1, .. }))
        ));
    }
    let resilience = orchestrator.resilience();
    assert!(matches!(
        resilience.keyed_profile(SESSION_PROFILE, "1").breaker().state(),
        CircuitBreakerState::Open { .. }
    ));

    let batch_id = orchestrator
        .start_batch(2, items(&["A", "B"]), single_step(), Arc::new(TracingEventSink))
        .await
        .unwrap();
    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();
    assert_eq!(snapshot.batch.status, BatchStatus::Completed);
    assert_eq!(snapshot.batch.completed, 2);
    assert_eq!(inner.sessions_created(), 1);

    // the healthy principal's runtime is pruned once its batch is done
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(resilience.keyed_count(), 1);
    assert_eq!(
        resilience.profile(SESSION_PROFILE).breaker().state(),
        CircuitBreakerState::Closed
    );
}

/// Steps take a second and are refused, whether or not the sub-context was
/// released meanwhile.
struct SlowRefusalBackend;

#[derive(Debug)]
struct SlowRefusalSession {
    id: SessionId,
    principal: PrincipalId,
}

#[derive(Debug)]
struct SlowRefusalSubContext {
    id: SubContextId,
}

#[async_trait]
impl AutomationBackend for SlowRefusalBackend {
    async fn create(
        &self,
        principal: PrincipalId,
        _options: &SessionOptions,
    ) -> Result<Arc<dyn AutomationSession>, AutomationError> {
        Ok(Arc::new(SlowRefusalSession {
            id: Uuid::new_v4(),
            principal,
        }))
    }

    async fn destroy(&self, _session: Arc<dyn AutomationSession>) -> Result<(), AutomationError> {
        Ok(())
    }
}

#[async_trait]
impl AutomationSession for SlowRefusalSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn principal(&self) -> PrincipalId {
        self.principal
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn derive_subcontext(&self) -> Result<Arc<dyn SubContext>, AutomationError> {
        Ok(Arc::new(SlowRefusalSubContext { id: Uuid::new_v4() }))
    }
}

#[async_trait]
impl SubContext for SlowRefusalSubContext {
    fn id(&self) -> SubContextId {
        self.id
    }

    async fn perform(&self, request: &StepRequest) -> Result<serde_json::Value, AutomationError> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Err(AutomationError::Rejected(format!("{} is taken", request.item_label)))
    }

    async fn release(&self) -> Result<(), AutomationError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_failure_in_flight_during_cancel_stays_failed() {
    let pool = Arc::new(SessionPool::new(
        Arc::new(SlowRefusalBackend),
        SessionPoolConfig::default(),
    ));
    let orchestrator = TaskOrchestrator::new(pool, test_layer(), quick_config());

    let batch_id = orchestrator
        .start_batch(42, items(&["A", "B"]), single_step(), Arc::new(TracingEventSink))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(orchestrator.cancel_batch(batch_id).await, Ok(true));

    let snapshot = orchestrator.wait_for_batch(batch_id).await.unwrap();
    assert_eq!(snapshot.batch.status, BatchStatus::Cancelled);
    assert!(snapshot.batch.is_settled());
    assert_eq!(snapshot.batch.failed, 1);
    assert_eq!(snapshot.batch.cancelled, 1);

    let a = snapshot.task_by_label("A").unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.error.as_ref().unwrap().kind, "Permanent");
    assert_eq!(snapshot.task_by_label("B").unwrap().status, TaskStatus::Cancelled);
}
