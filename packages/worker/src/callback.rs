//! Outbound HTTP callbacks to the upstream service.
//!
//! Callback delivery is best-effort: failures are logged after the retry
//! budget is exhausted and never affect job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cost::CostSnapshot;
use crate::jobs::Job;

/// Attempt schedule: 1 initial try + 3 retries.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(10),
];

/// Per-attempt request timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Running,
    NeedsHuman,
    Resumed,
    Completed,
    Failed,
    Cancelled,
}

/// Usage summary attached to every terminal callback, zero-valued when
/// nothing was consumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBlock {
    pub total_cost_usd: f64,
    pub action_count: u32,
    pub total_tokens: i64,
}

impl From<&CostSnapshot> for CostBlock {
    fn from(snapshot: &CostSnapshot) -> Self {
        Self {
            total_cost_usd: snapshot.total_cost_usd(),
            action_count: snapshot.action_count,
            total_tokens: snapshot.total_tokens(),
        }
    }
}

/// HITL context attached to `needs_human` callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionBlock {
    #[serde(rename = "type")]
    pub interaction_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valet_task_id: Option<String>,
    pub status: CallbackStatus,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction: Option<InteractionBlock>,
}

impl CallbackPayload {
    fn base(job: &Job, status: CallbackStatus) -> Self {
        Self {
            job_id: job.id,
            valet_task_id: job.valet_task_id.clone(),
            status,
            completed_at: job.completed_at,
            cost: None,
            error_code: None,
            error_message: None,
            execution_mode: None,
            manual: None,
            screenshot_url: None,
            result_summary: None,
            interaction: None,
        }
    }

    pub fn running(job: &Job) -> Self {
        Self::base(job, CallbackStatus::Running)
    }

    /// Terminal success. The cost block is always present.
    pub fn completed(job: &Job, snapshot: &CostSnapshot) -> Self {
        let mut payload = Self::base(job, CallbackStatus::Completed);
        payload.completed_at = job.completed_at.or_else(|| Some(Utc::now()));
        payload.cost = Some(CostBlock::from(snapshot));
        payload.execution_mode = Some(snapshot.mode.as_str().to_string());
        payload.result_summary = job.result_summary.clone();
        payload.manual = job
            .result_data
            .as_ref()
            .and_then(|d| d.get("manual_summary"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        payload.screenshot_url = job.screenshot_urls.first().cloned();
        payload
    }

    /// Terminal failure. The cost block is always present, zero-valued
    /// when nothing was consumed.
    pub fn failed(
        job: &Job,
        error_code: &str,
        error_message: &str,
        snapshot: &CostSnapshot,
    ) -> Self {
        let mut payload = Self::base(job, CallbackStatus::Failed);
        payload.completed_at = job.completed_at.or_else(|| Some(Utc::now()));
        payload.cost = Some(CostBlock::from(snapshot));
        payload.error_code = Some(error_code.to_string());
        payload.error_message = Some(error_message.to_string());
        payload
    }

    pub fn needs_human(job: &Job, interaction: InteractionBlock) -> Self {
        let mut payload = Self::base(job, CallbackStatus::NeedsHuman);
        payload.interaction = Some(interaction);
        payload
    }

    pub fn resumed(job: &Job) -> Self {
        Self::base(job, CallbackStatus::Resumed)
    }

    /// Terminal cancellation. Carries whatever cost was consumed.
    pub fn cancelled(job: &Job, snapshot: &CostSnapshot) -> Self {
        let mut payload = Self::base(job, CallbackStatus::Cancelled);
        payload.completed_at = job.completed_at.or_else(|| Some(Utc::now()));
        payload.cost = Some(CostBlock::from(snapshot));
        payload
    }
}

#[derive(Clone)]
pub struct CallbackNotifier {
    client: reqwest::Client,
}

impl Default for CallbackNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Deliver a callback with retries. Exhausted retries are logged;
    /// nothing propagates to the caller.
    pub async fn notify(&self, url: &str, payload: &CallbackPayload) {
        let attempts = RETRY_DELAYS.len() + 1;
        for attempt in 0..attempts {
            match self
                .client
                .post(url)
                .timeout(ATTEMPT_TIMEOUT)
                .json(payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        job_id = %payload.job_id,
                        status = ?payload.status,
                        attempt = attempt + 1,
                        "callback delivered"
                    );
                    return;
                }
                Ok(response) => {
                    warn!(
                        job_id = %payload.job_id,
                        attempt = attempt + 1,
                        http_status = %response.status(),
                        "callback rejected"
                    );
                }
                Err(e) => {
                    warn!(
                        job_id = %payload.job_id,
                        attempt = attempt + 1,
                        error = %e,
                        "callback request failed"
                    );
                }
            }
            if attempt < RETRY_DELAYS.len() {
                tokio::time::sleep(RETRY_DELAYS[attempt]).await;
            }
        }
        warn!(
            job_id = %payload.job_id,
            status = ?payload.status,
            "callback abandoned after {attempts} attempts"
        );
    }

    /// Fire a callback only when the job has a callback URL.
    pub async fn notify_job(&self, job: &Job, payload: &CallbackPayload) {
        if let Some(url) = &job.callback_url {
            self.notify(url, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .user_id(Uuid::new_v4())
            .job_type("apply")
            .valet_task_id("valet-42")
            .build()
    }

    #[test]
    fn completed_payload_always_has_cost() {
        let job = sample_job();
        let payload = CallbackPayload::completed(&job, &CostSnapshot::default());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["cost"]["total_cost_usd"], 0.0);
        assert_eq!(json["cost"]["action_count"], 0);
        assert_eq!(json["valet_task_id"], "valet-42");
        assert!(!json["completed_at"].is_null());
    }

    #[test]
    fn failed_payload_has_cost_and_error_fields() {
        let job = sample_job();
        let payload = CallbackPayload::failed(
            &job,
            "budget_exceeded",
            "task budget exhausted",
            &CostSnapshot::default(),
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error_code"], "budget_exceeded");
        assert!(json.get("cost").is_some());
    }

    #[test]
    fn needs_human_payload_carries_interaction() {
        let job = sample_job();
        let payload = CallbackPayload::needs_human(
            &job,
            InteractionBlock {
                interaction_type: "captcha".to_string(),
                screenshot_url: Some("https://shots/1.png".to_string()),
                page_url: Some("https://jobs.example/apply".to_string()),
                timeout_seconds: Some(900),
            },
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "needs_human");
        assert_eq!(json["interaction"]["type"], "captcha");
        assert_eq!(json["interaction"]["timeout_seconds"], 900);
        // No cost on non-terminal callbacks.
        assert!(json.get("cost").is_none());
    }

    #[test]
    fn resumed_payload_is_minimal() {
        let job = sample_job();
        let json = serde_json::to_value(CallbackPayload::resumed(&job)).unwrap();
        assert_eq!(json["status"], "resumed");
        assert!(json.get("interaction").is_none());
        assert!(json.get("error_code").is_none());
    }

    #[test]
    fn cost_block_from_snapshot() {
        let tracker = crate::cost::CostTracker::new(
            Uuid::new_v4(),
            crate::cost::QualityPreset::Quality,
            50,
        );
        tracker
            .record_token_usage(100, 40, 0.02, 0.01, crate::cost::TokenRole::Reasoning)
            .unwrap();
        tracker.record_action().unwrap();
        let block = CostBlock::from(&tracker.snapshot());
        assert!((block.total_cost_usd - 0.03).abs() < 1e-9);
        assert_eq!(block.action_count, 1);
        assert_eq!(block.total_tokens, 140);
    }

    #[test]
    fn retry_schedule_matches_contract() {
        assert_eq!(RETRY_DELAYS.len(), 3);
        assert_eq!(RETRY_DELAYS[0], Duration::from_secs(1));
        assert_eq!(RETRY_DELAYS[1], Duration::from_secs(3));
        assert_eq!(RETRY_DELAYS[2], Duration::from_secs(10));
        assert_eq!(ATTEMPT_TIMEOUT, Duration::from_secs(10));
    }

    #[test]
    fn completed_surfaces_manual_summary_and_screenshot() {
        let mut job = sample_job();
        job.result_data = Some(serde_json::json!({ "manual_summary": "2 steps done by hand" }));
        job.screenshot_urls = vec!["https://shots/final.png".to_string()];
        let payload = CallbackPayload::completed(&job, &CostSnapshot::default());
        assert_eq!(payload.manual.as_deref(), Some("2 steps done by hand"));
        assert_eq!(payload.screenshot_url.as_deref(), Some("https://shots/final.png"));
    }
}
