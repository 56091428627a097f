//! # Slotrunner
//!
//! Resilient orchestration of time-slot bookings performed through
//! long-lived, expensive external automation sessions.
//!
//! ## Architecture Overview
//!
//! - **[`resilience`]**: Retry with backoff, sliding-window rate limiting and
//!   circuit breaking, composed per named profile
//! - **[`automation`]**: The contract of the external automation resource and
//!   an in-process simulated backend
//! - **[`session`]**: One exclusive session per principal, created lazily,
//!   reused, reaped when idle
//! - **[`task`]**: Batches of work items run against isolated sub-contexts
//!   with progress events
//! - **[`scheduler`]**: A bounded retry loop whose cadence follows
//!   time-of-day windows
//! - **[`integration`]**: The [`Engine`] facade wiring everything together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slotrunner::{Engine, EngineConfig, SimulatedBackend, WorkItem};
//! use slotrunner::task::{BatchParams, ChannelEventSink, EventKind};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new(EngineConfig::default(), Arc::new(SimulatedBackend::default())).await?;
//!     let (sink, mut events) = ChannelEventSink::channel();
//!
//!     let batch_id = engine
//!         .start_batch(42, vec![WorkItem::labelled("A")], BatchParams::default(), Arc::new(sink))
//!         .await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}: {}", event.kind, event.text);
//!         if event.kind == EventKind::BatchSummary {
//!             break;
//!         }
//!     }
//!     engine.wait_for_batch(batch_id).await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Retry, rate limiting and circuit breaking around fallible async calls.
pub mod resilience;

/// External automation resource contract and the simulated backend.
pub mod automation;

/// Principal-to-session pool with idle reaping.
pub mod session;

/// Batch orchestration over per-task sub-contexts.
///
/// Tracks task and batch status, emits progress events through a caller
/// supplied sink and supports cancellation at any time.
pub mod task;

/// Time-of-day aware retry scheduling and job supervision.
pub mod scheduler;

/// Engine configuration loaded from TOML and the environment.
pub mod config;

/// High-level engine wiring every subsystem together.
pub mod integration;

/// Environment constants and path utilities.
pub mod env;

pub mod cli;

pub use automation::{AutomationBackend, PrincipalId, SimulatedBackend, SimulationScript};
pub use config::{ConfigError, EngineConfig};
pub use integration::Engine;
pub use resilience::{ResilienceError, ResilienceLayer, ResilienceProfile};
pub use scheduler::{AdaptiveScheduler, ScheduleOutcome, ScheduleWindow};
pub use session::{SessionError, SessionPool};
pub use task::{BatchId, BatchStatus, OrchestratorError, TaskOrchestrator, TaskStatus, WorkItem};
