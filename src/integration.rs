//! # Engine facade
//!
//! Wires every subsystem together from one [`EngineConfig`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                        Engine                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │     Task     │  │   Session    │  │  Adaptive   │ │
//! │  │ Orchestrator │─▶│     Pool     │  │  Scheduler  │ │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬──────┘ │
//! │         │     ResilienceLayer      │   JobSupervisor │
//! │         └─────────────────┴─────────────────┘        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! All background work (batch drivers, the idle reaper, scheduled jobs) hangs
//! off one root [`CancellationToken`]; [`Engine::shutdown`] cancels it, joins
//! every loop and force-closes the remaining sessions.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use slotrunner::{Engine, EngineConfig, SimulatedBackend, WorkItem};
//! use slotrunner::task::{BatchParams, TracingEventSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(SimulatedBackend::default());
//!     let engine = Engine::new(EngineConfig::default(), backend).await?;
//!
//!     let batch_id = engine
//!         .start_batch(
//!             42,
//!             vec![WorkItem::labelled("A"), WorkItem::labelled("B")],
//!             BatchParams::default(),
//!             Arc::new(TracingEventSink),
//!         )
//!         .await?;
//!     let snapshot = engine.wait_for_batch(batch_id).await?;
//!     println!("{:?}", snapshot.batch.status);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::automation::{AutomationBackend, PrincipalId};
use crate::config::{ConfigError, EngineConfig};
use crate::resilience::ResilienceError;
use crate::scheduler::{
    AdaptiveScheduler, Clock, JobHandle, JobInfo, JobSupervisor, ScheduleOutcome, SystemClock,
    WindowStatus,
};
use crate::session::{SessionInfo, SessionPool, SessionReaper};
use crate::task::{
    BatchId, BatchParams, BatchSnapshot, EventSink, OrchestratorError, TaskOrchestrator,
    TaskStatus, WorkItem,
};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// The assembled booking engine.
pub struct Engine {
    config: EngineConfig,
    pool: Arc<SessionPool>,
    orchestrator: Arc<TaskOrchestrator>,
    scheduler: Arc<AdaptiveScheduler>,
    jobs: JobSupervisor,
    tracker: TaskTracker,
    root: CancellationToken,
}

impl Engine {
    /// Build an engine whose scheduler reads the system clock in the
    /// configured timezone. Must be called inside a tokio runtime.
    pub async fn new(
        config: EngineConfig,
        backend: Arc<dyn AutomationBackend>,
    ) -> Result<Self, ConfigError> {
        let offset = config.scheduler.offset()?;
        Self::with_clock(config, backend, Arc::new(SystemClock::new(offset))).await
    }

    pub async fn with_clock(
        config: EngineConfig,
        backend: Arc<dyn AutomationBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let root = CancellationToken::new();
        let tracker = TaskTracker::new();
        let resilience = config.resilience_layer();

        let pool_config = config.session.pool_config();
        let pool = Arc::new(SessionPool::new(backend, pool_config.clone()));
        SessionReaper::spawn(
            Arc::clone(&pool),
            pool_config.reap_interval,
            pool_config.idle_reap_timeout,
            &tracker,
            root.child_token(),
        );

        let orchestrator = Arc::new(
            TaskOrchestrator::new(Arc::clone(&pool), resilience, config.orchestrator_config())
                .with_shutdown_token(root.child_token()),
        );
        let scheduler = Arc::new(AdaptiveScheduler::new(
            config.scheduler.scheduler_config(),
            clock,
        ));
        let jobs = JobSupervisor::with_root(root.child_token());

        info!(
            "Engine started ({} schedule windows, {:?} execution)",
            config.scheduler.schedule_windows.len(),
            config.orchestrator.execution_mode
        );

        Ok(Self {
            config,
            pool,
            orchestrator,
            scheduler,
            jobs,
            tracker,
            root,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<AdaptiveScheduler> {
        &self.scheduler
    }

    pub async fn start_batch(
        &self,
        principal: PrincipalId,
        items: Vec<WorkItem>,
        params: BatchParams,
        sink: Arc<dyn EventSink>,
    ) -> Result<BatchId, OrchestratorError> {
        self.orchestrator
            .start_batch(principal, items, params, sink)
            .await
    }

    pub async fn get_status(&self, batch_id: BatchId) -> Result<BatchSnapshot, OrchestratorError> {
        self.orchestrator.get_status(batch_id).await
    }

    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<bool, OrchestratorError> {
        self.orchestrator.cancel_batch(batch_id).await
    }

    pub async fn wait_for_batch(&self, batch_id: BatchId) -> Result<BatchSnapshot, OrchestratorError> {
        self.orchestrator.wait_for_batch(batch_id).await
    }

    pub async fn session_info(&self, principal: PrincipalId) -> Option<SessionInfo> {
        self.pool.session_info(principal).await
    }

    pub fn window_status(&self) -> WindowStatus {
        self.scheduler.window_status()
    }

    /// Run `op` under the adaptive scheduler as a supervised background job.
    pub fn schedule<T, F, Fut>(&self, name: impl Into<String>, op: F) -> JobHandle<ScheduleOutcome<T>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let scheduler = Arc::clone(&self.scheduler);
        self.jobs.spawn(name, move |token| async move {
            scheduler.run_with_token(op, &token).await
        })
    }

    /// Keep submitting a single work item as a one-task batch until it
    /// completes, fails permanently or the scheduler gives up.
    ///
    /// A failed attempt whose task error is `Permanent` aborts the run; every
    /// other failure waits for the next cadence tick.
    pub fn schedule_item(
        &self,
        principal: PrincipalId,
        item: WorkItem,
        params: BatchParams,
        sink: Arc<dyn EventSink>,
    ) -> JobHandle<ScheduleOutcome<BatchSnapshot>> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let name = format!("schedule {} for principal {}", item.label, principal);

        self.schedule(name, move || {
            let orchestrator = Arc::clone(&orchestrator);
            let item = item.clone();
            let params = params.clone();
            let sink = Arc::clone(&sink);
            async move { attempt_item(&orchestrator, principal, item, params, sink).await }
        })
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs.list()
    }

    pub fn cancel_job(&self, id: crate::scheduler::JobId) -> bool {
        self.jobs.cancel(id)
    }

    /// Stop scheduled jobs, batches and the reaper, then close every session.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.jobs.shutdown().await;
        self.orchestrator.shutdown().await;

        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let closed = self.pool.force_close_all().await;
        info!("Engine stopped, {} sessions closed", closed);
    }
}

async fn attempt_item(
    orchestrator: &TaskOrchestrator,
    principal: PrincipalId,
    item: WorkItem,
    params: BatchParams,
    sink: Arc<dyn EventSink>,
) -> Result<BatchSnapshot, ResilienceError> {
    let batch_id = orchestrator
        .start_batch(principal, vec![item], params, sink)
        .await
        .map_err(|error| match error {
            OrchestratorError::ShuttingDown | OrchestratorError::EmptyBatch => {
                ResilienceError::Permanent(error.to_string())
            }
            other => ResilienceError::Transient(other.to_string()),
        })?;
    let snapshot = orchestrator
        .wait_for_batch(batch_id)
        .await
        .map_err(|error| ResilienceError::Transient(error.to_string()))?;

    let Some(task) = snapshot.tasks.first() else {
        return Err(ResilienceError::Permanent(format!(
            "batch {} has no tasks",
            batch_id
        )));
    };
    match (&task.status, &task.error) {
        (TaskStatus::Completed, _) => Ok(snapshot),
        (_, Some(error)) if error.kind == "Permanent" => {
            Err(ResilienceError::Permanent(error.to_string()))
        }
        (_, Some(error)) => Err(ResilienceError::Transient(error.to_string())),
        (status, None) => Err(ResilienceError::Transient(format!(
            "task ended as {:?}",
            status
        ))),
    }
}
