//! Job model for browser-automation work units.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    /// Terminal statuses never transition again and always carry `completed_at`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Expired
        )
    }

    /// Statuses in which a worker owns the row (`worker_id` is non-null).
    pub fn is_claimed(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::Paused
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Expired => "expired",
        }
    }
}

/// Whether a status transition is permitted by the job state machine.
///
/// Conditional updates in the store enforce the same table; anything not
/// listed here is rejected as normal control flow, not an error.
pub fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Pending, Cancelled)
            | (Queued, Running)
            | (Queued, Cancelled)
            | (Queued, Pending)    // recovery / force release
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Paused)
            | (Running, Expired)
            | (Running, Pending)   // retryable error re-queue / recovery
            | (Paused, Running)
            | (Paused, Failed)     // human_timeout
            | (Paused, Cancelled)
            | (Paused, Expired)
    )
}

/// Closed set of error codes surfaced in `error_code` on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CaptchaBlocked,
    Timeout,
    NetworkError,
    BrowserCrashed,
    ElementNotFound,
    BudgetExceeded,
    ActionLimitExceeded,
    ValidationError,
    HumanTimeout,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CaptchaBlocked => "captcha_blocked",
            ErrorCode::Timeout => "timeout",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::BrowserCrashed => "browser_crashed",
            ErrorCode::ElementNotFound => "element_not_found",
            ErrorCode::BudgetExceeded => "budget_exceeded",
            ErrorCode::ActionLimitExceeded => "action_limit_exceeded",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::HumanTimeout => "human_timeout",
            ErrorCode::InternalError => "internal_error",
        }
    }

    /// Transient codes that may succeed if the job is re-queued.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError | ErrorCode::BrowserCrashed | ErrorCode::ElementNotFound
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Core identity
    pub user_id: Uuid,
    pub job_type: String,

    // Task definition
    #[builder(default, setter(strip_option))]
    pub target_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub task_description: Option<String>,
    #[builder(default, setter(strip_option))]
    pub input_data: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub metadata: Option<serde_json::Value>,

    // Scheduling
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default = 600)]
    pub timeout_seconds: i32,

    // Execution state
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat: Option<DateTime<Utc>>,

    // Error tracking
    #[builder(default, setter(strip_option))]
    pub error_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_details: Option<serde_json::Value>,

    // Results
    #[builder(default, setter(strip_option))]
    pub result_data: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub result_summary: Option<String>,
    #[builder(default)]
    pub screenshot_urls: Vec<String>,

    // Accumulated usage (recorded even on failure)
    #[builder(default = 0)]
    pub action_count: i32,
    #[builder(default = 0)]
    pub total_tokens: i64,
    #[builder(default = 0)]
    pub llm_cost_cents: i64,

    // Upstream correlation
    #[builder(default, setter(strip_option))]
    pub callback_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub valet_task_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    // Human-in-the-loop state
    #[builder(default, setter(strip_option))]
    pub interaction_data: Option<serde_json::Value>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Exponential retry backoff: `min(60s, 5 * 2^retry_count)`.
    pub fn backoff_delay(retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 30) as u32;
        let secs = 5u64.saturating_mul(1u64 << exp).min(60);
        Duration::from_secs(secs)
    }

    /// Whether the executor may re-queue this job after a transient error.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Wall-clock ceiling for one execution attempt.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }

    /// The typed error code, if the stored string is one of the closed set.
    pub fn error_code(&self) -> Option<ErrorCode> {
        let raw = self.error_code.as_deref()?;
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .user_id(Uuid::new_v4())
            .job_type("apply")
            .build()
    }

    #[test]
    fn new_job_starts_pending_with_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout_seconds, 600);
        assert!(job.worker_id.is_none());
        assert!(job.screenshot_urls.is_empty());
    }

    #[test]
    fn terminal_statuses_are_exactly_four() {
        let terminal: Vec<_> = [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Expired,
        ]
        .into_iter()
        .filter(JobStatus::is_terminal)
        .collect();
        assert_eq!(
            terminal,
            vec![
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
                JobStatus::Expired
            ]
        );
    }

    #[test]
    fn claimed_statuses_match_worker_ownership_invariant() {
        assert!(JobStatus::Queued.is_claimed());
        assert!(JobStatus::Running.is_claimed());
        assert!(JobStatus::Paused.is_claimed());
        assert!(!JobStatus::Pending.is_claimed());
        assert!(!JobStatus::Completed.is_claimed());
    }

    #[test]
    fn happy_path_transitions_allowed() {
        assert!(transition_allowed(JobStatus::Pending, JobStatus::Queued));
        assert!(transition_allowed(JobStatus::Queued, JobStatus::Running));
        assert!(transition_allowed(JobStatus::Running, JobStatus::Completed));
    }

    #[test]
    fn pause_resume_transitions_allowed() {
        assert!(transition_allowed(JobStatus::Running, JobStatus::Paused));
        assert!(transition_allowed(JobStatus::Paused, JobStatus::Running));
        assert!(transition_allowed(JobStatus::Paused, JobStatus::Failed));
    }

    #[test]
    fn requeue_transitions_allowed() {
        assert!(transition_allowed(JobStatus::Running, JobStatus::Pending));
        assert!(transition_allowed(JobStatus::Queued, JobStatus::Pending));
    }

    #[test]
    fn terminal_statuses_never_transition() {
        for from in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Expired,
        ] {
            for to in [
                JobStatus::Pending,
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Paused,
                JobStatus::Completed,
            ] {
                assert!(!transition_allowed(from, to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn backwards_transitions_rejected() {
        assert!(!transition_allowed(JobStatus::Running, JobStatus::Queued));
        assert!(!transition_allowed(JobStatus::Queued, JobStatus::Paused));
        assert!(!transition_allowed(JobStatus::Pending, JobStatus::Running));
    }

    #[test]
    fn backoff_schedule_doubles_and_caps_at_sixty() {
        assert_eq!(Job::backoff_delay(0), Duration::from_secs(5));
        assert_eq!(Job::backoff_delay(1), Duration::from_secs(10));
        assert_eq!(Job::backoff_delay(2), Duration::from_secs(20));
        assert_eq!(Job::backoff_delay(3), Duration::from_secs(40));
        assert_eq!(Job::backoff_delay(4), Duration::from_secs(60));
        assert_eq!(Job::backoff_delay(5), Duration::from_secs(60));
        assert_eq!(Job::backoff_delay(20), Duration::from_secs(60));
    }

    #[test]
    fn error_code_round_trips_through_row_string() {
        let mut job = sample_job();
        job.error_code = Some("captcha_blocked".to_string());
        assert_eq!(job.error_code(), Some(ErrorCode::CaptchaBlocked));

        job.error_code = Some("not_a_real_code".to_string());
        assert_eq!(job.error_code(), None);
    }

    #[test]
    fn retryable_codes_are_transient_only() {
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(ErrorCode::BrowserCrashed.is_retryable());
        assert!(!ErrorCode::BudgetExceeded.is_retryable());
        assert!(!ErrorCode::CaptchaBlocked.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
    }

    #[test]
    fn display_matches_wire_string() {
        assert_eq!(ErrorCode::HumanTimeout.to_string(), "human_timeout");
        assert_eq!(ErrorCode::ActionLimitExceeded.to_string(), "action_limit_exceeded");
    }
}
