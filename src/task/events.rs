use crate::task::types::{BatchId, TaskId};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    TaskOk,
    TaskFail,
    BatchSummary,
}

/// Progress notification emitted by the orchestrator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrchestratorEvent {
    pub batch_id: BatchId,
    /// `None` for batch-level events
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OrchestratorEvent {
    pub fn new(
        batch_id: BatchId,
        task_id: Option<TaskId>,
        kind: EventKind,
        text: impl Into<String>,
    ) -> Self {
        Self {
            batch_id,
            task_id,
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Caller-supplied notification channel.
///
/// The orchestrator only logs a failing sink; delivery problems never affect
/// task execution.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: OrchestratorEvent) -> Result<()>;
}

/// Forwards every event into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn on_event(&self, event: OrchestratorEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("event receiver dropped"))
    }
}

/// Sink that logs events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn on_event(&self, event: OrchestratorEvent) -> Result<()> {
        match event.kind {
            EventKind::Started | EventKind::TaskOk => {
                info!("[{}] {}", event.batch_id, event.text);
            }
            EventKind::TaskFail => {
                warn!("[{}] {}", event.batch_id, event.text);
            }
            EventKind::BatchSummary => {
                info!("[{}] summary: {}", event.batch_id, event.text);
            }
        }
        Ok(())
    }
}
