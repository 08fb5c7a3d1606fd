//! Worker process lifecycle.
//!
//! Registration, liveness heartbeats, the recovery sweep, periodic
//! maintenance, and the two-phase shutdown protocol:
//!
//! 1. First SIGTERM/SIGINT: stop claiming, let active jobs drain within a
//!    bounded grace window, deregister, complete the lifecycle hook.
//! 2. Second signal (or grace expiry): force-release claimed jobs back to
//!    `pending` and exit immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::registry::{WorkerRegistry, WorkerStatus};
use crate::dispatch::ActiveJobs;
use crate::jobs::PostgresJobStore;
use crate::rate_limit::{MemoryRateStore, RateStore};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_id: String,
    /// Heartbeat age past which claimed jobs are considered orphaned.
    pub stuck_job_threshold: Duration,
    /// How long active jobs may drain after the first shutdown signal.
    pub drain_grace: Duration,
    /// Optional platform lifecycle hook completed after drain (e.g. an ASG
    /// hook relay).
    pub lifecycle_hook_url: Option<String>,
    /// Deployment metadata stored on the registry row.
    pub deployment: Option<serde_json::Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            stuck_job_threshold: Duration::from_secs(120),
            drain_grace: Duration::from_secs(300),
            lifecycle_hook_url: None,
            deployment: None,
        }
    }
}

pub struct WorkerRuntime {
    store: PostgresJobStore,
    registry: WorkerRegistry,
    active: Arc<ActiveJobs>,
    rate_store: Arc<MemoryRateStore>,
    config: RuntimeConfig,
    draining: AtomicBool,
    /// First-phase token: dispatchers stop claiming when this fires.
    shutdown: CancellationToken,
    /// Second-phase token: running executions abort when this fires.
    force_abort: CancellationToken,
    http_client: reqwest::Client,
    started_at: chrono::DateTime<Utc>,
}

impl WorkerRuntime {
    pub fn new(
        store: PostgresJobStore,
        registry: WorkerRegistry,
        active: Arc<ActiveJobs>,
        rate_store: Arc<MemoryRateStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            registry,
            active,
            rate_store,
            config,
            draining: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            force_abort: CancellationToken::new(),
            http_client: reqwest::Client::new(),
            started_at: Utc::now(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn force_abort_token(&self) -> CancellationToken {
        self.force_abort.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_idle()
    }

    pub fn active_jobs(&self) -> &Arc<ActiveJobs> {
        &self.active
    }

    /// Register in the worker registry. A worker without a registry row is
    /// not allowed to accept jobs, so exhausting the retries is fatal.
    pub async fn register(&self) -> Result<()> {
        for attempt in 1..=3 {
            match self
                .registry
                .upsert(&self.config.worker_id, self.config.deployment.clone())
                .await
            {
                Ok(()) => {
                    info!(worker_id = %self.config.worker_id, "worker registered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "worker registration failed");
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
        bail!("worker registration failed after 3 attempts")
    }

    /// Startup sweep: re-queue jobs orphaned by dead workers and expire
    /// those already past their deadline.
    pub async fn startup_recovery(&self) -> Result<()> {
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.config.stuck_job_threshold)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let recovered = self.store.recover_stale(horizon).await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered stale jobs at startup");
        }
        let expired = self.store.expire_overdue(horizon).await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired overdue jobs at startup");
        }
        Ok(())
    }

    /// Periodic maintenance: the recovery sweep every minute and a
    /// rate-limit key prune every hour.
    pub async fn start_maintenance(&self) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new().await?;

        let store = self.store.clone();
        let threshold = self.config.stuck_job_threshold;
        let sweep = CronJob::new_async("0 * * * * *", move |_uuid, _lock| {
            let store = store.clone();
            Box::pin(async move {
                let horizon =
                    Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
                match store.recover_stale(horizon).await {
                    Ok(recovered) if !recovered.is_empty() => {
                        info!(count = recovered.len(), "recovery sweep re-queued stale jobs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "recovery sweep failed"),
                }
                if let Err(e) = store.expire_overdue(horizon).await {
                    error!(error = %e, "expiry sweep failed");
                }
            })
        })?;
        scheduler.add(sweep).await?;

        let rate_store = self.rate_store.clone();
        let prune = CronJob::new_async("0 0 * * * *", move |_uuid, _lock| {
            let rate_store = rate_store.clone();
            Box::pin(async move {
                let evicted = rate_store.prune(Utc::now()).await;
                if evicted > 0 {
                    info!(evicted, "pruned idle rate-limit keys");
                }
            })
        })?;
        scheduler.add(prune).await?;

        scheduler.start().await?;
        info!("maintenance scheduler started (recovery sweep 1m, rate prune 1h)");
        Ok(scheduler)
    }

    /// Registry heartbeat loop (30s). Runs until force-abort.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = runtime.force_abort.cancelled() => break,
                    _ = interval.tick() => {
                        let status = if runtime.is_draining() {
                            WorkerStatus::Draining
                        } else {
                            WorkerStatus::Active
                        };
                        if let Err(e) = runtime
                            .registry
                            .heartbeat(
                                &runtime.config.worker_id,
                                status,
                                runtime.active.current_job(),
                            )
                            .await
                        {
                            warn!(error = %e, "registry heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting new claims; active jobs keep running.
    pub async fn begin_drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(worker_id = %self.config.worker_id, "drain started");
        self.shutdown.cancel();
        if let Err(e) = self
            .registry
            .heartbeat(
                &self.config.worker_id,
                WorkerStatus::Draining,
                self.active.current_job(),
            )
            .await
        {
            warn!(error = %e, "failed to mark worker draining");
        }
    }

    /// Second-phase shutdown: abort executions and hand claimed rows back.
    async fn force_shutdown(&self) {
        warn!(worker_id = %self.config.worker_id, "force shutdown");
        self.force_abort.cancel();
        match self.store.force_release(&self.config.worker_id).await {
            Ok(released) if released > 0 => {
                info!(released, "released claimed jobs back to the queue");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to force-release claimed jobs"),
        }
    }

    /// Block until the two-phase shutdown completes.
    pub async fn run_until_shutdown(self: Arc<Self>) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        self.begin_drain().await;

        let deadline = Instant::now() + self.config.drain_grace;
        loop {
            if self.active.is_idle() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("drain grace elapsed with jobs still active");
                self.force_shutdown().await;
                break;
            }
            tokio::select! {
                _ = sigterm.recv() => {
                    self.force_shutdown().await;
                    break;
                }
                _ = sigint.recv() => {
                    self.force_shutdown().await;
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }

        if let Err(e) = self.registry.deregister(&self.config.worker_id).await {
            warn!(error = %e, "worker deregistration failed");
        }
        self.complete_lifecycle_hook().await;
        self.force_abort.cancel();

        info!(worker_id = %self.config.worker_id, "worker shut down");
        Ok(())
    }

    /// Tell the platform the instance is safe to terminate.
    async fn complete_lifecycle_hook(&self) {
        let Some(url) = &self.config.lifecycle_hook_url else {
            return;
        };
        let body = serde_json::json!({
            "worker_id": self.config.worker_id,
            "event": "drain_complete",
        });
        match self
            .http_client
            .post(url)
            .timeout(Duration::from_secs(10))
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!("lifecycle hook completed");
            }
            Ok(response) => {
                warn!(http_status = %response.status(), "lifecycle hook rejected");
            }
            Err(e) => warn!(error = %e, "lifecycle hook failed"),
        }
    }

    /// Snapshot for the status endpoint.
    pub fn status_report(&self) -> WorkerStatusReport {
        let pool = self.store.pool();
        WorkerStatusReport {
            worker_id: self.config.worker_id.clone(),
            status: if self.is_draining() {
                WorkerStatus::Draining
            } else {
                WorkerStatus::Active
            },
            active_jobs: self.active.count(),
            current_job_id: self.active.current_job(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            pool: PoolReport {
                size: pool.size(),
                idle: pool.num_idle(),
            },
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct WorkerStatusReport {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub active_jobs: usize,
    pub current_job_id: Option<uuid::Uuid>,
    pub uptime_seconds: i64,
    pub pool: PoolReport,
}

#[derive(Debug, serde::Serialize)]
pub struct PoolReport {
    pub size: u32,
    pub idle: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_liveness_contract() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stuck_job_threshold, Duration::from_secs(120));
        assert_eq!(config.drain_grace, Duration::from_secs(300));
        assert!(config.lifecycle_hook_url.is_none());
    }
}
