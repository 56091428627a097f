use crate::session::pool::SessionPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Periodic sweep closing sessions that have been idle for too long.
pub struct SessionReaper;

impl SessionReaper {
    /// Spawn the sweep on `tracker`. It stops once `cancel` fires.
    pub fn spawn(
        pool: Arc<SessionPool>,
        interval: Duration,
        idle_timeout: Duration,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        info!(
            "Starting session reaper (interval {:?}, idle timeout {:?})",
            interval, idle_timeout
        );

        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = pool.reap_idle(idle_timeout).await;
                        if !reaped.is_empty() {
                            info!("Reaped {} idle sessions: {:?}", reaped.len(), reaped);
                        }
                    }
                }
            }
        })
    }
}
