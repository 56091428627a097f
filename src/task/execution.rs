use crate::automation::{
    AutomationError, AutomationSession, LeasedSubContext, PrincipalId, SessionOptions, StepRequest,
};
use crate::resilience::{ResilienceError, ResilienceLayer, SESSION_PROFILE, STEP_PROFILE};
use crate::session::{SessionError, SessionLease, SessionPool};
use crate::task::events::{EventKind, EventSink, OrchestratorEvent};
use crate::task::types::*;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{RwLock, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error kind recorded for a task interrupted by its batch's cancellation.
pub(crate) const CANCELLED_KIND: &str = "Cancelled";

pub(crate) struct BatchState {
    pub(crate) batch: Batch,
    pub(crate) tasks: Vec<Task>,
}

/// Shared state of one submitted batch.
pub(crate) struct BatchRun {
    pub(crate) id: BatchId,
    pub(crate) principal: PrincipalId,
    pub(crate) steps: Vec<String>,
    pub(crate) params: Value,
    pub(crate) mode: ExecutionMode,
    pub(crate) state: RwLock<BatchState>,
    pub(crate) cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
    running: StdMutex<HashMap<TaskId, Arc<LeasedSubContext>>>,
    done: watch::Sender<bool>,
}

impl BatchRun {
    pub(crate) fn new(
        principal: PrincipalId,
        items: Vec<WorkItem>,
        steps: Vec<String>,
        params: Value,
        mode: ExecutionMode,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let batch = Batch::new(principal, items.len());
        let tasks = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| Task::new(index, item))
            .collect();
        let (done, _) = watch::channel(false);

        Self {
            id: batch.id,
            principal,
            steps,
            params,
            mode,
            state: RwLock::new(BatchState { batch, tasks }),
            cancel: CancellationToken::new(),
            sink,
            running: StdMutex::new(HashMap::new()),
            done,
        }
    }

    pub(crate) async fn snapshot(&self) -> BatchSnapshot {
        let state = self.state.read().await;
        BatchSnapshot {
            batch: state.batch.clone(),
            tasks: state.tasks.clone(),
        }
    }

    /// Whether the driver has emitted the summary and stopped.
    pub(crate) fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) async fn wait_finished(&self) {
        let mut rx = self.done.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|finished| *finished).await;
    }

    /// Stop further task starts and release sub-contexts of running tasks.
    /// Returns false if the batch had already finished or been cancelled.
    pub(crate) async fn cancel(&self) -> bool {
        {
            // flipping the token under the state lock orders it against
            // `run_task`, which checks it under the same lock before starting
            let mut state = self.state.write().await;
            if self.cancel.is_cancelled() || state.batch.status.is_terminal() {
                return false;
            }
            self.cancel.cancel();
            state.batch.status = BatchStatus::Cancelled;

            let now = Utc::now();
            let mut cancelled = 0;
            for task in state
                .tasks
                .iter_mut()
                .filter(|task| task.status == TaskStatus::Pending)
            {
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(now);
                cancelled += 1;
            }
            state.batch.cancelled += cancelled;
        }

        let running: Vec<Arc<LeasedSubContext>> = self.running_subcontexts().values().cloned().collect();
        info!(
            "Cancelled batch {}, releasing {} running sub-contexts",
            self.id,
            running.len()
        );
        for subcontext in running {
            subcontext.release().await;
        }
        true
    }

    async fn track(&self, task_id: TaskId, index: usize, subcontext: &Arc<LeasedSubContext>) {
        self.running_subcontexts()
            .insert(task_id, Arc::clone(subcontext));
        self.state.write().await.tasks[index].subcontext = Some(subcontext.id());

        // insert first, then check: a cancellation that snapshotted `running`
        // before the insert could not see this sub-context, so release it here
        if self.cancel.is_cancelled() {
            subcontext.release().await;
        }
    }

    fn untrack(&self, task_id: TaskId) {
        self.running_subcontexts().remove(&task_id);
    }

    fn running_subcontexts(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Arc<LeasedSubContext>>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn emit(&self, task_id: Option<TaskId>, kind: EventKind, text: String) {
        let event = OrchestratorEvent::new(self.id, task_id, kind, text);
        if let Err(e) = self.sink.on_event(event).await {
            warn!("Event sink failed for batch {}: {}", self.id, e);
        }
    }
}

/// Result of running one task's interaction sequence.
struct TaskReport {
    outcome: Result<Value, TaskExecutionError>,
    steps: Vec<StepRecord>,
    attempts: u32,
}

fn cancelled_error(step: &str, attempts: u32) -> TaskExecutionError {
    TaskExecutionError {
        step: step.to_string(),
        attempts,
        cause: "batch cancelled".to_string(),
        kind: CANCELLED_KIND.to_string(),
    }
}

fn step_error(step: &str, attempts: u32, error: &ResilienceError) -> TaskExecutionError {
    TaskExecutionError {
        step: step.to_string(),
        attempts,
        cause: error.to_string(),
        kind: error.root_cause().kind().to_string(),
    }
}

/// Obtain a leased session through the principal's own session profile
/// runtime, so one principal's failing creations never trip another's breaker.
pub(crate) async fn acquire_session(
    pool: &SessionPool,
    resilience: &ResilienceLayer,
    principal: PrincipalId,
    options: &SessionOptions,
) -> Result<SessionLease, OrchestratorError> {
    resilience
        .execute_keyed(SESSION_PROFILE, &principal.to_string(), || async move {
            pool.lease(principal, options)
                .await
                .map_err(|e| ResilienceError::Transient(e.to_string()))
        })
        .await
        .map_err(|e| {
            OrchestratorError::SessionCreation(SessionError::Creation {
                principal,
                reason: e.to_string(),
            })
        })
}

/// Drives one batch from `InProgress` to its terminal state.
pub(crate) struct BatchExecutor {
    pub(crate) pool: Arc<SessionPool>,
    pub(crate) resilience: ResilienceLayer,
    pub(crate) config: OrchestratorConfig,
    pub(crate) run: Arc<BatchRun>,
}

impl BatchExecutor {
    pub(crate) async fn run(self, lease: SessionLease) {
        let total = {
            let mut state = self.run.state.write().await;
            if state.batch.status == BatchStatus::Starting {
                state.batch.status = BatchStatus::InProgress;
            }
            state.batch.total
        };

        info!(
            "Batch {} in progress: {} items for principal {} ({:?})",
            self.run.id, total, self.run.principal, self.run.mode
        );
        self.run
            .emit(
                None,
                EventKind::Started,
                format!("Starting {} items for principal {}", total, self.run.principal),
            )
            .await;

        let session_lost = match self.run.mode {
            ExecutionMode::Sequential => self.run_sequential(lease, total).await,
            ExecutionMode::Concurrent => self.run_concurrent(lease, total).await,
        };

        self.finalize(session_lost).await;
    }

    /// Returns the reason if the session was lost and could not be replaced.
    async fn run_sequential(&self, mut lease: SessionLease, total: usize) -> Option<String> {
        for index in 0..total {
            if self.run.cancel.is_cancelled() {
                debug!("Batch {} cancelled before task {}", self.run.id, index + 1);
                break;
            }

            if !self.pool.check_health(lease.session()).await {
                warn!(
                    "Session for principal {} lost during batch {}, re-acquiring",
                    self.run.principal, self.run.id
                );
                match acquire_session(
                    &self.pool,
                    &self.resilience,
                    self.run.principal,
                    &self.config.session_options,
                )
                .await
                {
                    Ok(replacement) => lease = replacement,
                    Err(e) => {
                        error!("Batch {} cannot continue: {}", self.run.id, e);
                        return Some(e.to_string());
                    }
                }
            }

            let session = Arc::clone(lease.session());
            self.run_task(index, &session).await;

            if index + 1 < total && !self.config.inter_task_delay.is_zero() {
                tokio::select! {
                    _ = self.run.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.inter_task_delay) => {}
                }
            }
        }
        None
    }

    async fn run_concurrent(&self, lease: SessionLease, total: usize) -> Option<String> {
        let permits = Semaphore::new(self.config.max_concurrent_subcontexts.max(1));
        let session = Arc::clone(lease.session());

        let tasks = (0..total).map(|index| {
            let permits = &permits;
            let session = &session;
            async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                self.run_task(index, session).await;
            }
        });
        futures::future::join_all(tasks).await;

        drop(lease);
        None
    }

    async fn run_task(&self, index: usize, session: &Arc<dyn AutomationSession>) {
        let run = &self.run;
        let (task_id, item, total) = {
            let mut state = run.state.write().await;
            if run.cancel.is_cancelled() {
                return;
            }
            let total = state.batch.total;
            let task = &mut state.tasks[index];
            if task.status != TaskStatus::Pending {
                return;
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            (task.id, task.item.clone(), total)
        };

        info!("Task {}/{} ({}) running", index + 1, total, item.label);
        run.emit(
            Some(task_id),
            EventKind::Started,
            format!("Task {}/{}: {} started", index + 1, total, item.label),
        )
        .await;

        let report = self.execute_task(task_id, index, &item, session).await;
        self.record(index, report).await;
    }

    async fn execute_task(
        &self,
        task_id: TaskId,
        index: usize,
        item: &WorkItem,
        session: &Arc<dyn AutomationSession>,
    ) -> TaskReport {
        let derive_attempts = &AtomicU32::new(0);
        let principal = self.run.principal.to_string();
        let derived = self
            .resilience
            .execute_keyed(SESSION_PROFILE, &principal, || {
                let session = Arc::clone(session);
                async move {
                    derive_attempts.fetch_add(1, Ordering::SeqCst);
                    session
                        .derive_subcontext()
                        .await
                        .map_err(ResilienceError::from)
                }
            })
            .await;

        let subcontext = match derived {
            Ok(subcontext) => Arc::new(
                LeasedSubContext::new(subcontext).with_release_timeout(self.config.release_timeout),
            ),
            Err(e) => {
                return TaskReport {
                    outcome: Err(step_error(
                        "derive_subcontext",
                        derive_attempts.load(Ordering::SeqCst),
                        &e,
                    )),
                    steps: Vec::new(),
                    attempts: 0,
                };
            }
        };

        self.run.track(task_id, index, &subcontext).await;
        let mut steps = Vec::with_capacity(self.run.steps.len());
        let outcome = self.perform_steps(item, &subcontext, &mut steps).await;

        subcontext.release().await;
        self.run.untrack(task_id);

        TaskReport {
            outcome,
            attempts: steps.iter().map(|record| record.attempts).sum(),
            steps,
        }
    }

    async fn perform_steps(
        &self,
        item: &WorkItem,
        subcontext: &Arc<LeasedSubContext>,
        records: &mut Vec<StepRecord>,
    ) -> Result<Value, TaskExecutionError> {
        let mut previous: Option<Value> = None;

        for step in &self.run.steps {
            if self.run.cancel.is_cancelled() {
                return Err(cancelled_error(step, 0));
            }

            let request = StepRequest {
                step: step.clone(),
                item_label: item.label.clone(),
                item: item.payload.clone(),
                params: self.run.params.clone(),
                previous: previous.take(),
            };

            let attempts = &AtomicU32::new(0);
            let released = &AtomicBool::new(false);
            let result = self
                .resilience
                .execute(STEP_PROFILE, || {
                    let subcontext = Arc::clone(subcontext);
                    let request = request.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        subcontext.perform(&request).await.map_err(|e| {
                            if matches!(e, AutomationError::Released(_)) {
                                released.store(true, Ordering::SeqCst);
                            }
                            ResilienceError::from(e)
                        })
                    }
                })
                .await;

            let attempts = attempts.load(Ordering::SeqCst);
            records.push(StepRecord {
                step: step.clone(),
                attempts,
                succeeded: result.is_ok(),
            });

            match result {
                Ok(value) => {
                    debug!("{}: step '{}' done after {} attempts", item.label, step, attempts);
                    previous = Some(value);
                }
                // only a cancellation releases a sub-context under a running step
                Err(_) if released.load(Ordering::SeqCst) => {
                    return Err(cancelled_error(step, attempts));
                }
                Err(e) => return Err(step_error(step, attempts, &e)),
            }
        }

        Ok(previous.unwrap_or(Value::Null))
    }

    async fn record(&self, index: usize, report: TaskReport) {
        let run = &self.run;
        let (task_id, kind, text) = {
            let mut state = run.state.write().await;
            let total = state.batch.total;
            let cancelled = run.cancel.is_cancelled();

            let task = &mut state.tasks[index];
            task.attempts = report.attempts;
            task.steps = report.steps;
            task.subcontext = None;
            task.finished_at = Some(Utc::now());

            let (status, kind, text) = match report.outcome {
                Ok(value) => {
                    task.result = Some(value);
                    (
                        TaskStatus::Completed,
                        EventKind::TaskOk,
                        format!("Task {}/{}: {} completed", index + 1, total, task.item.label),
                    )
                }
                Err(error) if cancelled && error.kind == CANCELLED_KIND => {
                    let text = format!("Task {}/{}: {} cancelled", index + 1, total, task.item.label);
                    task.error = Some(error);
                    (TaskStatus::Cancelled, EventKind::TaskFail, text)
                }
                Err(error) => {
                    let text = format!(
                        "Task {}/{}: {} failed: {}",
                        index + 1,
                        total,
                        task.item.label,
                        error
                    );
                    task.error = Some(error);
                    (TaskStatus::Failed, EventKind::TaskFail, text)
                }
            };
            task.status = status;
            let task_id = task.id;
            state.batch.count(status);
            (task_id, kind, text)
        };

        match kind {
            EventKind::TaskOk => info!("{}", text),
            _ => warn!("{}", text),
        }
        run.emit(Some(task_id), kind, text).await;
    }

    async fn finalize(&self, session_lost: Option<String>) {
        let run = &self.run;
        let summary = {
            let mut state = run.state.write().await;
            let cancelled = run.cancel.is_cancelled();
            let now = Utc::now();

            let leftover_status = match &session_lost {
                Some(_) if !cancelled => TaskStatus::Failed,
                _ => TaskStatus::Cancelled,
            };
            let mut leftovers = 0;
            for task in state
                .tasks
                .iter_mut()
                .filter(|task| task.status == TaskStatus::Pending)
            {
                task.status = leftover_status;
                task.finished_at = Some(now);
                if let (TaskStatus::Failed, Some(reason)) = (leftover_status, &session_lost) {
                    task.error = Some(TaskExecutionError {
                        step: "session".to_string(),
                        attempts: 0,
                        cause: reason.clone(),
                        kind: "SessionUnavailable".to_string(),
                    });
                }
                leftovers += 1;
            }
            for _ in 0..leftovers {
                state.batch.count(leftover_status);
            }

            state.batch.status = if cancelled {
                BatchStatus::Cancelled
            } else if session_lost.is_some() {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            };
            state.batch.finished_at = Some(now);

            let batch = &state.batch;
            let elapsed = (now - batch.started_at).num_milliseconds() as f64 / 1000.0;
            let mut summary = format!(
                "completed={}, failed={}, cancelled={}, total={} in {:.1}s",
                batch.completed, batch.failed, batch.cancelled, batch.total, elapsed
            );
            let completed_labels: Vec<&str> = state
                .tasks
                .iter()
                .filter(|task| task.status == TaskStatus::Completed)
                .map(|task| task.item.label.as_str())
                .collect();
            if !completed_labels.is_empty() {
                summary.push_str(&format!("; completed items: {}", completed_labels.join(", ")));
            }
            if let Some(reason) = &session_lost {
                summary.push_str(&format!("; session lost: {}", reason));
            }

            info!(
                "Batch {} finished with status {:?}: {}",
                run.id, state.batch.status, summary
            );
            summary
        };

        run.emit(None, EventKind::BatchSummary, summary).await;
        run.done.send_replace(true);
    }
}
