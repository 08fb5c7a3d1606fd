//! LISTEN/NOTIFY dispatcher with fallback polling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ActiveJobs;
use crate::executor::JobExecutor;
use crate::jobs::PostgresJobStore;

/// Wake-up channel; must match the `jobs_notify_pending` trigger.
pub const JOBS_CHANNEL: &str = "ghosthands_jobs";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    /// Fallback poll covering missed notifications.
    pub poll_interval: Duration,
    /// Concurrent executions per worker. One by convention: a worker owns
    /// a single browser session.
    pub max_concurrent: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            poll_interval: Duration::from_secs(5),
            max_concurrent: 1,
        }
    }
}

impl DispatcherConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

pub struct NotifyDispatcher {
    store: PostgresJobStore,
    executor: Arc<JobExecutor>,
    config: DispatcherConfig,
    active: Arc<ActiveJobs>,
    /// Single-slot debounce: concurrent wake-ups collapse into one pickup.
    pickup_slot: Arc<Semaphore>,
    wake: Arc<tokio::sync::Notify>,
}

impl NotifyDispatcher {
    pub fn new(
        store: PostgresJobStore,
        executor: Arc<JobExecutor>,
        config: DispatcherConfig,
        active: Arc<ActiveJobs>,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            active,
            pickup_slot: Arc::new(Semaphore::new(1)),
            wake: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.count()
    }

    /// Listen on the wake-up channel and poll as a fallback until
    /// `shutdown` fires. Active executions keep running; `force_abort`
    /// interrupts them (second-signal shutdown).
    pub async fn run(
        &self,
        pool: PgPool,
        shutdown: CancellationToken,
        force_abort: CancellationToken,
    ) -> Result<()> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(JOBS_CHANNEL).await?;

        info!(
            worker_id = %self.config.worker_id,
            channel = JOBS_CHANNEL,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher starting"
        );

        // Catch anything enqueued before we subscribed.
        self.try_pickup(&force_abort).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                notification = listener.recv() => {
                    match notification {
                        Ok(n) => {
                            debug!(payload = n.payload(), "job wake-up notification");
                            self.try_pickup(&force_abort).await;
                        }
                        Err(e) => {
                            // The listener reconnects internally; a brief
                            // pause avoids a tight error loop.
                            warn!(error = %e, "notification listener error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.try_pickup(&force_abort).await;
                }
                _ = self.wake.notified() => {
                    self.try_pickup(&force_abort).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
        Ok(())
    }

    /// One pickup attempt: claim while capacity allows. The semaphore
    /// guarantees a single in-flight pickup per worker regardless of how
    /// many signals coincide.
    async fn try_pickup(&self, force_abort: &CancellationToken) {
        let Ok(_permit) = self.pickup_slot.clone().try_acquire_owned() else {
            return;
        };

        while self.active.count() < self.config.max_concurrent {
            match self.store.claim_next(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, job_type = %job.job_type, "claimed job");
                    let job_id = job.id;
                    self.active.begin(job_id);

                    let executor = self.executor.clone();
                    let active = self.active.clone();
                    let wake = self.wake.clone();
                    let force_abort = force_abort.clone();
                    tokio::spawn(async move {
                        executor.execute(job, &force_abort).await;
                        active.end(job_id);
                        // Freed capacity: look for the next job right away.
                        wake.notify_one();
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "claim attempt failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_single_task() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = DispatcherConfig::with_worker_id("gh-worker-7");
        assert_eq!(config.worker_id, "gh-worker-7");
        assert_eq!(config.max_concurrent, 1);
    }
}
