//! Per-job execution state machine.
//!
//! One executor call drives a claimed job from `queued` to a terminal
//! state: preflight, the running transition, heartbeats, the handler
//! dispatch under a wall-clock deadline, failure classification, and the
//! unconditional epilogue (usage recording, final callback, progress
//! flush, browser release).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserFactory, BrowserSession};
use crate::callback::{CallbackNotifier, CallbackPayload};
use crate::cost::{
    action_limit_for, resolve_preset, CostControl, CostError, CostSnapshot, CostTracker, UserTier,
};
use crate::handler::{TaskContext, TaskError, TaskOutput};
use crate::hitl::HitlCoordinator;
use crate::jobs::{event_type, ErrorCode, Job, JobStatus, PostgresJobStore, StatusPatch};
use crate::progress::{ProgressSink, ProgressStep, ProgressTracker};
use crate::registry::SharedHandlerRegistry;

/// How often the running job's heartbeat is refreshed (also the cadence of
/// the cooperative cancellation checkpoint).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct JobExecutor {
    store: PostgresJobStore,
    cost_control: CostControl,
    notifier: CallbackNotifier,
    registry: SharedHandlerRegistry,
    browser_factory: Arc<dyn BrowserFactory>,
    progress_sink: Arc<dyn ProgressSink>,
    hitl: Arc<HitlCoordinator>,
    worker_id: String,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: PostgresJobStore,
        cost_control: CostControl,
        notifier: CallbackNotifier,
        registry: SharedHandlerRegistry,
        browser_factory: Arc<dyn BrowserFactory>,
        progress_sink: Arc<dyn ProgressSink>,
        hitl: Arc<HitlCoordinator>,
        worker_id: String,
    ) -> Self {
        Self {
            store,
            cost_control,
            notifier,
            registry,
            browser_factory,
            progress_sink,
            hitl,
            worker_id,
        }
    }

    /// Drive one claimed (`queued`) job to a terminal state or a re-queue.
    ///
    /// `force_abort` is the second-signal shutdown token; the first-signal
    /// drain never interrupts a running execution.
    pub async fn execute(&self, job: Job, force_abort: &CancellationToken) {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        info!(job_id = %job_id, job_type = %job_type, attempt = job.retry_count + 1, "executing job");

        // Preflight: deny before any resource is spent.
        let tier = match self.cost_control.tier_of(job.user_id).await {
            Ok(tier) => tier,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "tier lookup failed, assuming free");
                UserTier::default()
            }
        };
        let preset = resolve_preset(job.metadata.as_ref(), job.input_data.as_ref(), tier);

        match self.cost_control.preflight(job.user_id, preset).await {
            Ok(preflight) if !preflight.allowed => {
                info!(
                    job_id = %job_id,
                    remaining = preflight.remaining_budget_usd,
                    needed = preflight.task_budget_usd,
                    "preflight denied"
                );
                self.fail_terminal(
                    &job,
                    ErrorCode::BudgetExceeded,
                    preflight.reason.as_deref().unwrap_or("monthly budget exhausted"),
                    &CostSnapshot::default(),
                )
                .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // Transient store failure: give the claim back instead of
                // burning a retry.
                warn!(job_id = %job_id, error = %e, "preflight errored, releasing claim");
                self.release_claim(&job).await;
                return;
            }
        }

        // queued -> running. Losing this CAS means cancel or recovery got
        // there first.
        let started = self
            .store
            .transition(
                job_id,
                JobStatus::Queued,
                JobStatus::Running,
                StatusPatch {
                    set_started_now: true,
                    set_heartbeat_now: true,
                    ..Default::default()
                },
            )
            .await;
        match started {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, "job no longer queued, skipping");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to transition to running");
                return;
            }
        }
        self.store
            .record_event(
                job_id,
                event_type::JOB_STARTED,
                Some(serde_json::json!({ "attempt": job.retry_count + 1 })),
                &self.worker_id,
            )
            .await;

        let cost = Arc::new(CostTracker::new(
            job_id,
            preset,
            action_limit_for(&job.job_type),
        ));
        let progress = Arc::new(ProgressTracker::new(job_id, self.progress_sink.clone()));
        progress.set_estimated_total_actions(action_limit_for(&job.job_type));
        progress.set_step(ProgressStep::Initializing).await;

        let session = match self.browser_factory.open(&job).await {
            Ok(session) => session,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "browser session open failed");
                let err = crate::handler::classify_error(&e);
                self.settle(&job, Err(err), &cost, &progress, None).await;
                return;
            }
        };

        // Heartbeat + cooperative cancellation checkpoint.
        let job_cancel = force_abort.child_token();
        let heartbeat = self.spawn_heartbeat(job_id, job_cancel.clone());

        let ctx = TaskContext::new(
            self.worker_id.clone(),
            cost.clone(),
            progress.clone(),
            session.clone(),
            self.hitl.clone(),
            self.store.clone(),
            job_cancel.clone(),
        );

        let outcome = self.run_handler(&ctx, &job, job_cancel.clone()).await;

        job_cancel.cancel();
        let _ = heartbeat.await;

        self.settle(&job, outcome, &cost, &progress, Some(session)).await;
    }

    /// Dispatch to the registered handler under the wall-clock deadline.
    async fn run_handler(
        &self,
        ctx: &TaskContext,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        let handler = self.registry.get(&job.job_type).ok_or_else(|| {
            TaskError::fatal(
                ErrorCode::ValidationError,
                format!("no handler registered for job type {}", job.job_type),
            )
        })?;

        tokio::select! {
            result = handler.execute(ctx, job) => result,
            _ = tokio::time::sleep(job.execution_timeout()) => Err(TaskError::fatal(
                ErrorCode::Timeout,
                format!("execution exceeded {}s", job.timeout_seconds),
            )),
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }

    /// Heartbeat loop: refreshes `last_heartbeat` and watches for external
    /// cancellation; a cancelled row trips the job's cancel token so the
    /// handler unwinds at its next suspension point.
    fn spawn_heartbeat(
        &self,
        job_id: uuid::Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match store.heartbeat(job_id, &worker_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                // Row is no longer ours: cancelled, expired,
                                // or recovered. Stop the handler.
                                match store.status_of(job_id).await {
                                    Ok(Some(status)) if status.is_terminal() || !status.is_claimed() => {
                                        info!(job_id = %job_id, status = status.as_str(), "job taken away, aborting execution");
                                        cancel.cancel();
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }

    /// Apply the handler outcome to the job row, then run the epilogue.
    async fn settle(
        &self,
        job: &Job,
        outcome: Result<TaskOutput, TaskError>,
        cost: &Arc<CostTracker>,
        progress: &Arc<ProgressTracker>,
        session: Option<Arc<dyn BrowserSession>>,
    ) {
        let snapshot = cost.snapshot();

        match outcome {
            Ok(output) => {
                progress.set_step(ProgressStep::Completed).await;
                self.complete(job, output, &snapshot).await;
            }
            Err(TaskError::Cost(CostError::BudgetExceeded { snapshot, .. })) => {
                self.fail_terminal(job, ErrorCode::BudgetExceeded, "task budget exceeded", &snapshot)
                    .await;
            }
            Err(TaskError::Cost(CostError::ActionLimitExceeded { count, limit, .. })) => {
                self.fail_terminal(
                    job,
                    ErrorCode::ActionLimitExceeded,
                    &format!("action limit exceeded: {count} > {limit}"),
                    &snapshot,
                )
                .await;
            }
            Err(TaskError::HumanTimeout { seconds }) => {
                self.fail_terminal(
                    job,
                    ErrorCode::HumanTimeout,
                    &format!("no human resolution within {seconds}s"),
                    &snapshot,
                )
                .await;
            }
            Err(TaskError::Cancelled) => {
                self.settle_cancelled(job, &snapshot).await;
            }
            Err(TaskError::Retryable { message }) => {
                if job.has_retries_left() {
                    self.requeue_for_retry(job, &message, &snapshot).await;
                } else {
                    self.fail_terminal(job, ErrorCode::NetworkError, &message, &snapshot)
                        .await;
                }
            }
            Err(TaskError::Fatal { code, message }) => {
                self.fail_terminal(job, code, &message, &snapshot).await;
            }
        }

        progress.flush().await;
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                warn!(job_id = %job.id, error = %e, "browser session close failed");
            }
        }
    }

    async fn complete(&self, job: &Job, output: TaskOutput, snapshot: &CostSnapshot) {
        let patch = StatusPatch {
            set_completed_now: true,
            clear_worker: true,
            result_data: output.result_data.clone(),
            result_summary: output.result_summary.clone(),
            screenshot_urls: (!output.screenshot_urls.is_empty())
                .then(|| output.screenshot_urls.clone()),
            usage_delta: Some(usage_delta(snapshot)),
            ..Default::default()
        };
        match self
            .store
            .transition(job.id, JobStatus::Running, JobStatus::Completed, patch)
            .await
        {
            Ok(true) => {
                info!(
                    job_id = %job.id,
                    cost_usd = snapshot.total_cost_usd(),
                    actions = snapshot.action_count,
                    "job completed"
                );
                self.store
                    .record_event(
                        job.id,
                        event_type::JOB_COMPLETED,
                        Some(serde_json::json!({
                            "total_cost_usd": snapshot.total_cost_usd(),
                            "action_count": snapshot.action_count,
                        })),
                        &self.worker_id,
                    )
                    .await;

                self.record_cost(job, snapshot).await;

                let mut done = job.clone();
                done.completed_at = Some(Utc::now());
                done.result_summary = output.result_summary;
                done.result_data = output.result_data;
                done.screenshot_urls = output.screenshot_urls;
                self.notifier
                    .notify_job(&done, &CallbackPayload::completed(&done, snapshot))
                    .await;
            }
            Ok(false) => {
                // Cancel won the race at the very end; its actor owns the
                // terminal state, we still owe the usage record.
                warn!(job_id = %job.id, "completion lost the terminal race");
                self.record_cost(job, snapshot).await;
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to mark job completed"),
        }
    }

    /// Terminal failure from whichever non-terminal state the job is in.
    async fn fail_terminal(
        &self,
        job: &Job,
        code: ErrorCode,
        message: &str,
        snapshot: &CostSnapshot,
    ) {
        let patch = || StatusPatch {
            set_completed_now: true,
            clear_worker: true,
            error_code: Some(code.as_str().to_string()),
            error_details: Some(serde_json::json!({
                "message": message,
                "attempt": job.retry_count + 1,
            })),
            usage_delta: Some(usage_delta(snapshot)),
            ..Default::default()
        };

        let mut transitioned = false;
        for from in [JobStatus::Running, JobStatus::Paused, JobStatus::Queued] {
            match self
                .store
                .transition(job.id, from, JobStatus::Failed, patch())
                .await
            {
                Ok(true) => {
                    transitioned = true;
                    break;
                }
                Ok(false) => continue,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to mark job failed");
                    break;
                }
            }
        }

        if transitioned {
            warn!(job_id = %job.id, code = code.as_str(), message, "job failed");
            self.store
                .record_event(
                    job.id,
                    event_type::JOB_FAILED,
                    Some(serde_json::json!({
                        "error_code": code.as_str(),
                        "message": message,
                    })),
                    &self.worker_id,
                )
                .await;
        }

        // Usage is recorded and the callback fires even when the terminal
        // CAS lost to a concurrent cancel.
        self.record_cost(job, snapshot).await;
        let mut failed = job.clone();
        failed.completed_at = Some(Utc::now());
        self.notifier
            .notify_job(
                &failed,
                &CallbackPayload::failed(&failed, code.as_str(), message, snapshot),
            )
            .await;
    }

    /// Transient failure with retries left: back to `pending` with backoff.
    /// No callback — the job is not terminal.
    async fn requeue_for_retry(&self, job: &Job, message: &str, snapshot: &CostSnapshot) {
        let delay = Job::backoff_delay(job.retry_count);
        let scheduled_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let patch = StatusPatch {
            clear_worker: true,
            scheduled_at: Some(scheduled_at),
            increment_retry: true,
            error_details: Some(serde_json::json!({
                "message": message,
                "attempt": job.retry_count + 1,
                "retry_in_seconds": delay.as_secs(),
            })),
            usage_delta: Some(usage_delta(snapshot)),
            ..Default::default()
        };

        match self
            .store
            .transition(job.id, JobStatus::Running, JobStatus::Pending, patch)
            .await
        {
            Ok(true) => {
                info!(
                    job_id = %job.id,
                    retry = job.retry_count + 1,
                    delay_secs = delay.as_secs(),
                    "job re-queued after transient error"
                );
                self.store
                    .record_event(
                        job.id,
                        event_type::JOB_RETRY_SCHEDULED,
                        Some(serde_json::json!({
                            "message": message,
                            "retry_count": job.retry_count + 1,
                            "scheduled_at": scheduled_at.to_rfc3339(),
                        })),
                        &self.worker_id,
                    )
                    .await;
                // Each attempt's consumption is billed when the attempt
                // ends, so retries cannot dodge the meter.
                self.record_cost(job, snapshot).await;
            }
            Ok(false) => {
                warn!(job_id = %job.id, "retry re-queue lost to a concurrent transition");
                self.record_cost(job, snapshot).await;
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to re-queue job"),
        }
    }

    /// The row went `cancelled` under us (or a force-abort fired).
    async fn settle_cancelled(&self, job: &Job, snapshot: &CostSnapshot) {
        match self.store.status_of(job.id).await {
            Ok(Some(JobStatus::Cancelled)) => {
                info!(job_id = %job.id, "job cancelled by external actor");
                self.record_cost(job, snapshot).await;
                let mut cancelled = job.clone();
                cancelled.completed_at = Some(Utc::now());
                self.notifier
                    .notify_job(&cancelled, &CallbackPayload::cancelled(&cancelled, snapshot))
                    .await;
            }
            _ => {
                // Force-abort during shutdown: the runtime hands the row
                // back to the queue, nothing terminal to report.
                info!(job_id = %job.id, "execution aborted for shutdown");
            }
        }
    }

    /// Give a claim back untouched (no retry consumed). Used when
    /// preflight itself errors.
    async fn release_claim(&self, job: &Job) {
        let patch = StatusPatch {
            clear_worker: true,
            scheduled_at: Some(Utc::now() + chrono::Duration::seconds(30)),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .transition(job.id, JobStatus::Queued, JobStatus::Pending, patch)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to release claim");
        }
    }

    async fn record_cost(&self, job: &Job, snapshot: &CostSnapshot) {
        if let Err(e) = self
            .cost_control
            .record_job_cost(job.user_id, job.id, snapshot)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to record job cost");
        }
    }
}

fn usage_delta(snapshot: &CostSnapshot) -> (i32, i64, i64) {
    (
        snapshot.action_count as i32,
        snapshot.total_tokens(),
        snapshot.total_cost_cents(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_delta_maps_snapshot_counters() {
        let snapshot = CostSnapshot {
            input_tokens: 700,
            output_tokens: 300,
            input_cost_usd: 0.04,
            output_cost_usd: 0.02,
            action_count: 12,
            ..Default::default()
        };

        let (actions, tokens, cents) = usage_delta(&snapshot);
        assert_eq!(actions, 12);
        assert_eq!(tokens, 1000);
        assert_eq!(cents, 6);
    }

    #[test]
    fn heartbeat_interval_matches_liveness_contract() {
        // The 120s recovery horizon assumes four missed 30s beats.
        assert_eq!(HEARTBEAT_INTERVAL, Duration::from_secs(30));
    }
}
