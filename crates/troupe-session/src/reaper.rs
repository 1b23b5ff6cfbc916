//! Idle-session reaper.
//!
//! A background task that wakes every `poll_interval` and evicts sessions
//! that have not received anything for `idle_timeout`. Eviction closes the
//! session, which wakes its receiver task; that task then runs the normal
//! teardown (handler `on_disconnect`, socket close).

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{SessionConfig, SessionRegistry};

/// Spawns the reaper. It runs until `shutdown` is cancelled.
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(
            idle_timeout = ?config.idle_timeout,
            poll_interval = ?config.poll_interval,
            "reaper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.evict_idle(config.idle_timeout);
                    if !evicted.is_empty() {
                        tracing::info!(count = evicted.len(), "evicted idle sessions");
                    }
                }
            }
        }

        tracing::debug!("reaper stopped");
    })
}
