use crate::automation::{DEFAULT_RELEASE_TIMEOUT, PrincipalId, SessionOptions, SubContextId};
use crate::session::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Unique identifier for batches
pub type BatchId = Uuid;

/// One work item submitted as part of a batch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkItem {
    /// Human-readable label used in events and summaries
    pub label: String,
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    pub fn new(label: impl Into<String>, payload: Value) -> Self {
        Self {
            label: label.into(),
            payload,
        }
    }

    pub fn labelled(label: impl Into<String>) -> Self {
        Self::new(label, Value::Null)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Starting,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Cancelled | BatchStatus::Failed
        )
    }
}

/// How the tasks of one batch are scheduled against the shared session.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One task at a time, in submission order
    #[default]
    Sequential,
    /// Up to `max_concurrent_subcontexts` tasks at once
    Concurrent,
}

/// Outcome of one step of a task's interaction sequence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepRecord {
    pub step: String,
    pub attempts: u32,
    pub succeeded: bool,
}

/// Per-task failure detail recorded on the task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, thiserror::Error)]
#[error("step '{step}' failed after {attempts} attempts: {cause}")]
pub struct TaskExecutionError {
    pub step: String,
    pub attempts: u32,
    pub cause: String,
    /// Short error kind, e.g. `Transient` or `CircuitOpen`
    pub kind: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    /// Position in the submitted item list
    pub index: usize,
    pub item: WorkItem,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<TaskExecutionError>,
    /// Sub-context assigned while the task is running
    pub subcontext: Option<SubContextId>,
    /// Total step attempts across the whole interaction sequence
    pub attempts: u32,
    pub steps: Vec<StepRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(index: usize, item: WorkItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            item,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            subcontext: None,
            attempts: 0,
            steps: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn runtime(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Batch {
    pub id: BatchId,
    pub principal: PrincipalId,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(principal: PrincipalId, total: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            total,
            completed: 0,
            failed: 0,
            cancelled: 0,
            status: BatchStatus::Starting,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Tasks that have reached a terminal state.
    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn is_settled(&self) -> bool {
        self.settled() == self.total
    }

    pub(crate) fn count(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    }
}

/// Consistent view of a batch and its tasks taken under one lock.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BatchSnapshot {
    pub batch: Batch,
    pub tasks: Vec<Task>,
}

impl BatchSnapshot {
    pub fn task_by_label(&self, label: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.item.label == label)
    }
}

/// Per-batch parameters handed to every step of every task.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BatchParams {
    /// Opaque parameters passed through to each step
    pub params: Value,
    /// Ordered step names; empty means the orchestrator default
    pub steps: Vec<String>,
    pub execution_mode: Option<ExecutionMode>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    pub execution_mode: ExecutionMode,
    pub max_concurrent_subcontexts: usize,
    /// Pause between tasks in sequential mode
    pub inter_task_delay: Duration,
    /// How long a finished batch stays queryable
    pub batch_retention: Duration,
    /// Upper bound on releasing a task's sub-context
    pub release_timeout: Duration,
    pub session_options: SessionOptions,
    pub default_steps: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Sequential,
            max_concurrent_subcontexts: 3,
            inter_task_delay: Duration::from_millis(2000),
            batch_retention: Duration::from_secs(300),
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
            session_options: SessionOptions::default(),
            default_steps: vec![
                "navigate".to_string(),
                "book".to_string(),
                "confirm".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("could not obtain a session: {0}")]
    SessionCreation(#[source] SessionError),
    #[error("no live session for principal {0}")]
    SessionUnavailable(PrincipalId),
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),
    #[error("batch has no work items")]
    EmptyBatch,
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl From<SessionError> for OrchestratorError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Unavailable(principal) => OrchestratorError::SessionUnavailable(principal),
            creation @ SessionError::Creation { .. } => OrchestratorError::SessionCreation(creation),
        }
    }
}
