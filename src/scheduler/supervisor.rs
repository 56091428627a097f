use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique identifier for supervised jobs
pub type JobId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

struct JobEntry {
    name: String,
    started_at: DateTime<Utc>,
    token: CancellationToken,
}

/// Handle to a supervised job's result.
pub struct JobHandle<T> {
    id: JobId,
    handle: JoinHandle<T>,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn join(self) -> Result<T, JoinError> {
        self.handle.await
    }
}

/// Owns long-running background jobs such as scheduled retries.
///
/// Each job gets a child of the supervisor's root token; `shutdown` cancels
/// the root and waits for every job to return.
pub struct JobSupervisor {
    root: CancellationToken,
    tracker: TaskTracker,
    jobs: Arc<DashMap<JobId, JobEntry>>,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self::with_root(CancellationToken::new())
    }

    pub fn with_root(root: CancellationToken) -> Self {
        Self {
            root,
            tracker: TaskTracker::new(),
            jobs: Arc::new(DashMap::new()),
        }
    }

    pub fn spawn<F, Fut, T>(&self, name: impl Into<String>, job: F) -> JobHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = Uuid::new_v4();
        let name = name.into();
        let token = self.root.child_token();
        let future = job(token.clone());

        info!("Starting job {} ({})", name, id);
        self.jobs.insert(
            id,
            JobEntry {
                name,
                started_at: Utc::now(),
                token,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let handle = self.tracker.spawn(async move {
            let output = future.await;
            if let Some((_, entry)) = jobs.remove(&id) {
                debug!("Job {} ({}) finished", entry.name, id);
            }
            output
        });

        JobHandle { id, handle }
    }

    /// Request cancellation of one job. Returns false if it is unknown or
    /// already finished.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.jobs.get(&id) {
            Some(entry) => {
                info!("Cancelling job {} ({})", entry.name, id);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .iter()
            .map(|entry| JobInfo {
                id: *entry.key(),
                name: entry.name.clone(),
                started_at: entry.started_at,
                cancel_requested: entry.token.is_cancelled(),
            })
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    pub fn running(&self) -> usize {
        self.jobs.len()
    }

    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Job supervisor stopped");
    }
}

impl Default for JobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
