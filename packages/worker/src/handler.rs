//! Task handler contract — the core's only extension point.
//!
//! A handler drives the browser automation for one `job_type`. The
//! executor is handler-agnostic: it resolves the handler from the
//! registry, hands it a [`TaskContext`], and classifies whatever comes
//! back.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::browser::BrowserSession;
use crate::cost::{CostError, CostTracker, ExecutionMode};
use crate::hitl::{HitlCoordinator, InteractionRequest, Resolution};
use crate::jobs::{event_type, ErrorCode, Job, PostgresJobStore};
use crate::progress::ProgressTracker;

/// Result payload of a successful handler run.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub result_data: Option<Value>,
    pub result_summary: Option<String>,
    pub screenshot_urls: Vec<String>,
}

/// Handler failure taxonomy. The executor maps each variant onto the job
/// state machine.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Budget or action-limit kill from the cost tracker.
    #[error(transparent)]
    Cost(#[from] CostError),

    /// The HITL pause window elapsed without a resolution.
    #[error("human intervention timed out after {seconds}s")]
    HumanTimeout { seconds: u32 },

    /// Transient failure worth a re-queue (network flake, browser crash).
    #[error("retryable: {message}")]
    Retryable { message: String },

    /// Terminal failure with a classified code.
    #[error("{code}: {message}")]
    Fatal { code: ErrorCode, message: String },

    /// The job was cancelled out from under the handler.
    #[error("job cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        TaskError::Fatal {
            code,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        TaskError::Retryable {
            message: message.into(),
        }
    }
}

/// Classify an arbitrary error by its text, for handlers bubbling up
/// untyped failures from automation internals.
pub fn classify_error(error: &anyhow::Error) -> TaskError {
    let text = error.to_string().to_lowercase();

    if text.contains("captcha") {
        return TaskError::fatal(ErrorCode::CaptchaBlocked, error.to_string());
    }
    if text.contains("element not found") || text.contains("no such element") {
        return TaskError::retryable(error.to_string());
    }
    if text.contains("browser") && (text.contains("crash") || text.contains("disconnected")) {
        return TaskError::retryable(error.to_string());
    }
    if text.contains("timeout") || text.contains("timed out") {
        return TaskError::retryable(error.to_string());
    }
    if text.contains("connection") || text.contains("network") || text.contains("dns") {
        return TaskError::retryable(error.to_string());
    }
    if text.contains("invalid") || text.contains("validation") {
        return TaskError::fatal(ErrorCode::ValidationError, error.to_string());
    }

    TaskError::fatal(ErrorCode::InternalError, error.to_string())
}

/// Everything a handler may touch during execution. Handlers hold no
/// reference back to the executor.
pub struct TaskContext {
    pub worker_id: String,
    pub cost: Arc<CostTracker>,
    pub progress: Arc<ProgressTracker>,
    pub browser: Arc<dyn BrowserSession>,
    pub cancel: CancellationToken,
    hitl: Arc<HitlCoordinator>,
    store: PostgresJobStore,
}

impl TaskContext {
    pub fn new(
        worker_id: String,
        cost: Arc<CostTracker>,
        progress: Arc<ProgressTracker>,
        browser: Arc<dyn BrowserSession>,
        hitl: Arc<HitlCoordinator>,
        store: PostgresJobStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            cost,
            progress,
            browser,
            cancel,
            hitl,
            store,
        }
    }

    /// Append a handler-level audit event (e.g. `manual_found`,
    /// `step_completed`). Failures are logged, never surfaced.
    pub async fn record_event(
        &self,
        job: &Job,
        event_type: &str,
        metadata: Option<serde_json::Value>,
    ) {
        self.store
            .record_event(job.id, event_type, metadata, &self.worker_id)
            .await;
    }

    /// Switch execution strategy and audit the change.
    pub async fn switch_mode(&self, job: &Job, mode: ExecutionMode) {
        self.cost.set_mode(mode);
        self.store
            .record_event(
                job.id,
                event_type::MODE_SWITCHED,
                Some(serde_json::json!({ "mode": mode.as_str() })),
                &self.worker_id,
            )
            .await;
    }

    /// Suspend execution until a human resolves the interaction (or the
    /// pause window times out). On success the job is already back in
    /// `running` and the resolution has been injected into the session.
    pub async fn request_human(
        &self,
        job: &Job,
        request: InteractionRequest,
    ) -> Result<Resolution, TaskError> {
        self.hitl
            .request_human(job, self.browser.as_ref(), request, &self.cancel)
            .await
    }

    /// Cooperative cancellation checkpoint for handler loops.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A pluggable routine keyed by `job_type`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The job type this handler serves (the registry key).
    fn job_type(&self) -> &'static str;

    async fn execute(&self, ctx: &TaskContext, job: &Job) -> Result<TaskOutput, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_classify_as_retryable() {
        let err = anyhow::anyhow!("connection reset by peer");
        assert!(matches!(classify_error(&err), TaskError::Retryable { .. }));
    }

    #[test]
    fn captcha_classifies_as_fatal_captcha_blocked() {
        let err = anyhow::anyhow!("page presented a CAPTCHA challenge");
        match classify_error(&err) {
            TaskError::Fatal { code, .. } => assert_eq!(code, ErrorCode::CaptchaBlocked),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn validation_classifies_as_fatal() {
        let err = anyhow::anyhow!("invalid input_data: missing resume_url");
        match classify_error(&err) {
            TaskError::Fatal { code, .. } => assert_eq!(code, ErrorCode::ValidationError),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn unknown_errors_classify_as_internal() {
        let err = anyhow::anyhow!("something inexplicable");
        match classify_error(&err) {
            TaskError::Fatal { code, .. } => assert_eq!(code, ErrorCode::InternalError),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn cost_errors_convert_transparently() {
        let tracker = CostTracker::new(uuid::Uuid::new_v4(), crate::cost::QualityPreset::Speed, 1);
        tracker.record_action().unwrap();
        let err: TaskError = tracker.record_action().unwrap_err().into();
        assert!(matches!(
            err,
            TaskError::Cost(CostError::ActionLimitExceeded { .. })
        ));
    }
}
