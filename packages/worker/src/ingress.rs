//! Hooks called by the upstream API layer: job creation, cancellation,
//! and HITL resolution submission.

use anyhow::Result;
use crate::rate_limit::RateStore;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::callback::CallbackNotifier;
use crate::cost::CostControl;
use crate::dispatch::{subject_for, QueueMessage};
use crate::hitl::Resolution;
use crate::jobs::{event_type, InsertOutcome, Job, PostgresJobStore};
use std::sync::Arc;

use crate::rate_limit::{MemoryRateStore, RateGate, RateLimitExceeded, RateLimitHeaders};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub user_id: Uuid,
    pub job_type: String,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub valet_task_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Target platform for rate accounting; the API layer's detection
    /// decides this, unknown platforms share a default bucket.
    #[serde(default)]
    pub platform: Option<String>,
}

fn default_max_retries() -> i32 {
    3
}

fn default_timeout_seconds() -> i32 {
    600
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Successful creation, plus the rate headers the API layer should echo.
#[derive(Debug)]
pub struct CreateJobResponse {
    pub outcome: InsertOutcome,
    pub rate_headers: Option<RateLimitHeaders>,
}

pub struct Ingress {
    store: PostgresJobStore,
    cost_control: CostControl,
    gate: RateGate<Arc<MemoryRateStore>>,
    nats: Option<async_nats::Client>,
    notifier: CallbackNotifier,
}

impl Ingress {
    pub fn new(
        store: PostgresJobStore,
        cost_control: CostControl,
        gate: RateGate<Arc<MemoryRateStore>>,
        nats: Option<async_nats::Client>,
    ) -> Self {
        Self {
            store,
            cost_control,
            gate,
            nats,
            notifier: CallbackNotifier::new(),
        }
    }

    pub fn rate_gate(&self) -> &RateGate<Arc<MemoryRateStore>> {
        &self.gate
    }

    /// Create a `pending` job.
    ///
    /// Rate windows are consumed first; a duplicate idempotency key skips
    /// the insert and returns the existing row (the API layer answers 200
    /// with the existing id).
    pub async fn create_job(
        &self,
        request: CreateJobRequest,
    ) -> Result<CreateJobResponse, IngressError> {
        validate(&request)?;

        let tier = self
            .cost_control
            .tier_of(request.user_id)
            .await
            .map_err(IngressError::Internal)?;
        let platform = request.platform.as_deref().unwrap_or("default").to_string();
        let rate_headers = self
            .gate
            .check(
                &request.user_id.to_string(),
                tier,
                &platform,
                chrono::Utc::now(),
            )
            .await?;
        let rate_keys = rate_keys_for(request.user_id, &platform);

        let metadata = fold_tags(request.metadata.clone(), &request.tags);
        let job = Job::builder()
            .user_id(request.user_id)
            .job_type(request.job_type.clone())
            .priority(request.priority)
            .max_retries(request.max_retries.max(0))
            .timeout_seconds(request.timeout_seconds)
            .build();
        let job = Job {
            target_url: request.target_url,
            task_description: request.task_description,
            input_data: request.input_data,
            metadata,
            idempotency_key: request.idempotency_key,
            callback_url: request.callback_url,
            valet_task_id: request.valet_task_id,
            ..job
        };

        let outcome = self.store.insert(job).await.map_err(IngressError::Internal)?;

        match &outcome {
            InsertOutcome::Created(job) => {
                info!(job_id = %job.id, job_type = %job.job_type, "job created");
                self.store
                    .record_event(
                        job.id,
                        event_type::JOB_CREATED,
                        Some(json!({ "job_type": job.job_type, "priority": job.priority })),
                        "ingress",
                    )
                    .await;
                self.publish_queue_message(job).await;
            }
            InsertOutcome::Duplicate(existing) => {
                // The duplicate consumed no quota.
                info!(job_id = %existing.id, "idempotent create hit existing job");
                for key in &rate_keys {
                    self.gate.store().rollback(key).await;
                }
            }
        }

        Ok(CreateJobResponse {
            outcome,
            rate_headers: Some(rate_headers),
        })
    }

    /// Conditional cancel: non-terminal -> `cancelled`.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let cancelled = self.store.cancel(job_id).await?;
        if cancelled {
            info!(job_id = %job_id, "job cancelled");
            // A pending/queued job has no executor to send the terminal
            // callback; cover that path here.
            if let Some(job) = self.store.find_by_id(job_id).await? {
                if job.started_at.is_none() {
                    self.notifier
                        .notify_job(
                            &job,
                            &crate::callback::CallbackPayload::cancelled(
                                &job,
                                &crate::cost::CostSnapshot::default(),
                            ),
                        )
                        .await;
                }
            }
        }
        Ok(cancelled)
    }

    /// Write a HITL resolution. Only valid while the job is `paused`.
    pub async fn submit_resolution(
        &self,
        job_id: Uuid,
        resolution_type: &str,
        resolution_data: Option<serde_json::Value>,
        resolved_by: &str,
    ) -> Result<bool, IngressError> {
        if !Resolution::valid_type(resolution_type) {
            return Err(IngressError::Invalid(format!(
                "unknown resolution type: {resolution_type}"
            )));
        }
        let accepted = self
            .store
            .submit_resolution(job_id, resolution_type, resolution_data, resolved_by)
            .await
            .map_err(IngressError::Internal)?;
        if accepted {
            info!(job_id = %job_id, resolution_type, "resolution submitted");
        }
        Ok(accepted)
    }

    async fn publish_queue_message(&self, job: &Job) {
        let Some(client) = &self.nats else { return };
        let message = QueueMessage {
            job_id: job.id,
            job_type: job.job_type.clone(),
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to encode queue message");
                return;
            }
        };
        if let Err(e) = client
            .publish(subject_for(&job.job_type), payload.into())
            .await
        {
            // The LISTEN/NOTIFY path still picks the job up.
            warn!(job_id = %job.id, error = %e, "failed to publish queue message");
        }
    }

}

fn rate_keys_for(user_id: Uuid, platform: &str) -> Vec<String> {
    vec![
        format!("user:{user_id}:hourly"),
        format!("user:{user_id}:daily"),
        format!("platform:{user_id}:{platform}:hourly"),
        format!("platform:{user_id}:{platform}:daily"),
    ]
}

fn validate(request: &CreateJobRequest) -> Result<(), IngressError> {
    if request.job_type.trim().is_empty() {
        return Err(IngressError::Invalid("job_type must not be empty".into()));
    }
    if request.timeout_seconds <= 0 {
        return Err(IngressError::Invalid(
            "timeout_seconds must be positive".into(),
        ));
    }
    if request.max_retries < 0 {
        return Err(IngressError::Invalid(
            "max_retries must not be negative".into(),
        ));
    }
    if let Some(key) = &request.idempotency_key {
        if key.trim().is_empty() {
            return Err(IngressError::Invalid(
                "idempotency_key must not be blank".into(),
            ));
        }
    }
    Ok(())
}

fn fold_tags(
    metadata: Option<serde_json::Value>,
    tags: &[String],
) -> Option<serde_json::Value> {
    if tags.is_empty() {
        return metadata;
    }
    let mut base = match metadata {
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    base.insert("tags".to_string(), json!(tags));
    Some(serde_json::Value::Object(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> CreateJobRequest {
        CreateJobRequest {
            user_id: Uuid::new_v4(),
            job_type: "apply".to_string(),
            target_url: Some("https://jobs.example/42".to_string()),
            task_description: None,
            input_data: None,
            metadata: None,
            priority: 5,
            max_retries: 3,
            timeout_seconds: 600,
            idempotency_key: None,
            callback_url: None,
            valet_task_id: None,
            tags: vec![],
            platform: None,
        }
    }

    #[test]
    fn empty_job_type_is_invalid() {
        let mut request = sample_request();
        request.job_type = "  ".to_string();
        assert!(matches!(validate(&request), Err(IngressError::Invalid(_))));
    }

    #[test]
    fn non_positive_timeout_is_invalid() {
        let mut request = sample_request();
        request.timeout_seconds = 0;
        assert!(matches!(validate(&request), Err(IngressError::Invalid(_))));
    }

    #[test]
    fn blank_idempotency_key_is_invalid() {
        let mut request = sample_request();
        request.idempotency_key = Some("".to_string());
        assert!(matches!(validate(&request), Err(IngressError::Invalid(_))));
    }

    #[test]
    fn valid_request_passes() {
        assert!(validate(&sample_request()).is_ok());
    }

    #[test]
    fn tags_fold_into_metadata() {
        let folded = fold_tags(
            Some(json!({ "source": "extension" })),
            &["urgent".to_string(), "batch-3".to_string()],
        )
        .unwrap();
        assert_eq!(folded["source"], "extension");
        assert_eq!(folded["tags"][0], "urgent");
    }

    #[test]
    fn no_tags_leaves_metadata_untouched() {
        assert_eq!(fold_tags(None, &[]), None);
        let metadata = json!({ "a": 1 });
        assert_eq!(fold_tags(Some(metadata.clone()), &[]), Some(metadata));
    }
}
