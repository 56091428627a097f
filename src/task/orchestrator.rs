use crate::automation::PrincipalId;
use crate::resilience::ResilienceLayer;
use crate::session::SessionPool;
use crate::task::events::EventSink;
use crate::task::execution::{BatchExecutor, BatchRun, acquire_session};
use crate::task::types::*;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Runs batches of work items against each principal's pooled session.
///
/// Every batch driver and retention timer is spawned on one [`TaskTracker`];
/// [`TaskOrchestrator::shutdown`] cancels all batches and joins them.
pub struct TaskOrchestrator {
    pool: Arc<SessionPool>,
    resilience: ResilienceLayer,
    config: OrchestratorConfig,
    batches: Arc<DashMap<BatchId, Arc<BatchRun>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(
        pool: Arc<SessionPool>,
        resilience: ResilienceLayer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            resilience,
            config,
            batches: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie this orchestrator's lifetime to an outer shutdown token.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a batch and start executing it in the background.
    ///
    /// A live session is obtained before anything is registered; if that
    /// fails the whole batch is rejected and no task runs.
    pub async fn start_batch(
        &self,
        principal: PrincipalId,
        items: Vec<WorkItem>,
        params: BatchParams,
        sink: Arc<dyn EventSink>,
    ) -> Result<BatchId, OrchestratorError> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if items.is_empty() {
            return Err(OrchestratorError::EmptyBatch);
        }

        let lease = acquire_session(
            &self.pool,
            &self.resilience,
            principal,
            &self.config.session_options,
        )
        .await?;

        let steps = if params.steps.is_empty() {
            self.config.default_steps.clone()
        } else {
            params.steps
        };
        let mode = params.execution_mode.unwrap_or(self.config.execution_mode);
        let run = Arc::new(BatchRun::new(
            principal,
            items,
            steps,
            params.params,
            mode,
            sink,
        ));
        let batch_id = run.id;
        self.batches.insert(batch_id, Arc::clone(&run));

        info!(
            "Registered batch {} for principal {} with {} tasks",
            batch_id,
            principal,
            run.state.read().await.tasks.len()
        );

        let executor = BatchExecutor {
            pool: Arc::clone(&self.pool),
            resilience: self.resilience.clone(),
            config: self.config.clone(),
            run,
        };
        let batches = Arc::clone(&self.batches);
        let resilience = self.resilience.clone();
        let retention = self.config.batch_retention;
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            executor.run(lease).await;
            resilience.prune_keyed().await;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(retention) => {}
            }
            if batches.remove(&batch_id).is_some() {
                debug!("Disposed of batch {} after retention", batch_id);
            }
            // second sweep for runtimes whose limiter window was still open at batch end
            resilience.prune_keyed().await;
        });

        Ok(batch_id)
    }

    pub async fn get_status(&self, batch_id: BatchId) -> Result<BatchSnapshot, OrchestratorError> {
        Ok(self.run(batch_id)?.snapshot().await)
    }

    /// Batches of `principal` whose driver is still running.
    pub async fn list_active_batches(&self, principal: PrincipalId) -> Vec<Batch> {
        let runs: Vec<Arc<BatchRun>> = self
            .batches
            .iter()
            .filter(|entry| entry.value().principal == principal && !entry.value().is_finished())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut active = Vec::with_capacity(runs.len());
        for run in runs {
            active.push(run.state.read().await.batch.clone());
        }
        active.sort_by_key(|batch| batch.started_at);
        active
    }

    /// Returns whether this call cancelled the batch.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<bool, OrchestratorError> {
        let run = self.run(batch_id)?;
        Ok(run.cancel().await)
    }

    /// Wait until the batch driver has emitted its summary.
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> Result<BatchSnapshot, OrchestratorError> {
        let run = self.run(batch_id)?;
        run.wait_finished().await;
        Ok(run.snapshot().await)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn resilience(&self) -> &ResilienceLayer {
        &self.resilience
    }

    /// Cancel every batch and wait for all drivers and timers to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let runs: Vec<Arc<BatchRun>> = self
            .batches
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for run in runs {
            run.cancel().await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Task orchestrator stopped");
    }

    fn run(&self, batch_id: BatchId) -> Result<Arc<BatchRun>, OrchestratorError> {
        self.batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(OrchestratorError::BatchNotFound(batch_id))
    }
}
