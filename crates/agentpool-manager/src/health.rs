//! Health monitor.
//!
//! Reads worker snapshots through the manager API and asks the manager to
//! replace workers whose heartbeat went stale. It never touches worker
//! state directly.

use std::time::Duration;

use agentpool_core::{WorkerId, WorkerInfo, WorkerStatus};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::PoolManager;

/// Workers whose last heartbeat is older than `misses × interval`.
///
/// Starting workers are covered by the start timeout and stopping or
/// crashed ones are already on their way out, so only live, ready workers
/// are judged.
pub fn find_unresponsive(
    workers: &[WorkerInfo],
    now: DateTime<Utc>,
    interval: Duration,
    misses: u32,
) -> Vec<WorkerId> {
    let limit = interval * misses;
    workers
        .iter()
        .filter(|w| {
            matches!(
                w.status,
                WorkerStatus::Idle | WorkerStatus::Busy | WorkerStatus::Error
            )
        })
        .filter(|w| {
            w.heartbeat_age(now)
                .to_std()
                .map(|age| age > limit)
                .unwrap_or(false)
        })
        .map(|w| w.worker_id)
        .collect()
}

pub struct HealthMonitor {
    manager: PoolManager,
    interval: Duration,
    misses: u32,
}

impl HealthMonitor {
    pub fn new(manager: PoolManager, interval: Duration, misses: u32) -> Self {
        Self {
            manager,
            interval,
            misses,
        }
    }

    /// Run until `cancel` fires or the manager goes away.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            // The first tick completes immediately; skip it.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if !self.check().await {
                            break;
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }

    /// One evaluation round. Returns false once the manager is gone.
    async fn check(&self) -> bool {
        let workers = match self.manager.worker_snapshots().await {
            Ok(workers) => workers,
            Err(_) => return false,
        };

        for worker_id in find_unresponsive(&workers, Utc::now(), self.interval, self.misses) {
            warn!(worker_id = %worker_id, "Worker missed its heartbeats");
            match self.manager.report_unresponsive(worker_id).await {
                Ok(true) => info!(worker_id = %worker_id, "Unresponsive worker replaced"),
                Ok(false) => debug!(worker_id = %worker_id, "Worker already gone"),
                Err(_) => return false,
            }
        }

        self.manager.request_heartbeats().await.is_ok()
    }
}
