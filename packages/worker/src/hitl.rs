//! Human-in-the-loop pause/resume protocol.
//!
//! When automation hits a wall a human can clear (CAPTCHA, login wall,
//! 2FA), the handler suspends through [`HitlCoordinator::request_human`]:
//! the job row goes `paused` with the interaction context, the upstream
//! service is notified, and the coordinator polls the row until an
//! external actor submits a resolution or the pause window times out.
//! Resolution data is read once and cleared in the same statement so a
//! recovered or retried execution can never replay it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::BrowserSession;
use crate::callback::{CallbackNotifier, CallbackPayload, InteractionBlock};
use crate::handler::{classify_error, TaskError};
use crate::jobs::{event_type, ErrorCode, Job, JobStatus, PostgresJobStore, StatusPatch};

/// Pause window when the handler does not name one.
pub const DEFAULT_PAUSE_TIMEOUT_SECS: u32 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Captcha,
    Login,
    TwoFactor,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Captcha => "captcha",
            InteractionType::Login => "login",
            InteractionType::TwoFactor => "two_factor",
        }
    }
}

/// What the handler needs a human for.
#[derive(Debug, Clone)]
pub struct InteractionRequest {
    pub interaction_type: InteractionType,
    pub screenshot_url: Option<String>,
    pub page_url: Option<String>,
    pub timeout_seconds: Option<u32>,
}

impl InteractionRequest {
    pub fn new(interaction_type: InteractionType) -> Self {
        Self {
            interaction_type,
            screenshot_url: None,
            page_url: None,
            timeout_seconds: None,
        }
    }
}

/// A human's answer, parsed from the cleared `interaction_data` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Fill the visible one-time-code input and submit.
    CodeEntry { code: String },
    /// Fill username/password fields and submit.
    Credentials { username: String, password: String },
    /// Continue without injecting anything.
    Skip,
    /// The human already advanced the page by hand.
    Manual,
}

impl Resolution {
    pub fn type_str(&self) -> &'static str {
        match self {
            Resolution::CodeEntry { .. } => "code_entry",
            Resolution::Credentials { .. } => "credentials",
            Resolution::Skip => "skip",
            Resolution::Manual => "manual",
        }
    }

    pub fn valid_type(raw: &str) -> bool {
        matches!(raw, "code_entry" | "credentials" | "skip" | "manual")
    }

    /// Parse a stored resolution. `data` is the `resolution_data` blob.
    pub fn from_parts(resolution_type: &str, data: Option<&Value>) -> Result<Self, String> {
        match resolution_type {
            "code_entry" => {
                let code = data
                    .and_then(|d| d.get("code"))
                    .and_then(|v| v.as_str())
                    .ok_or("code_entry resolution requires data.code")?;
                Ok(Resolution::CodeEntry {
                    code: code.to_string(),
                })
            }
            "credentials" => {
                let username = data
                    .and_then(|d| d.get("username"))
                    .and_then(|v| v.as_str())
                    .ok_or("credentials resolution requires data.username")?;
                let password = data
                    .and_then(|d| d.get("password"))
                    .and_then(|v| v.as_str())
                    .ok_or("credentials resolution requires data.password")?;
                Ok(Resolution::Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            "skip" => Ok(Resolution::Skip),
            "manual" => Ok(Resolution::Manual),
            other => Err(format!("unknown resolution type: {other}")),
        }
    }
}

fn internal(e: anyhow::Error) -> TaskError {
    TaskError::fatal(ErrorCode::InternalError, e.to_string())
}

pub struct HitlCoordinator {
    store: PostgresJobStore,
    notifier: CallbackNotifier,
    worker_id: String,
    poll_interval: Duration,
}

impl HitlCoordinator {
    pub fn new(store: PostgresJobStore, notifier: CallbackNotifier, worker_id: String) -> Self {
        Self {
            store,
            notifier,
            worker_id,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Pause the job, notify upstream, and wait (bounded) for a human.
    ///
    /// On resolution the answer is injected into the session, the job
    /// transitions back to `running`, and a `resumed` callback fires. On
    /// timeout the caller receives [`TaskError::HumanTimeout`] and the job
    /// is still `paused`; the executor's failure path finishes it.
    pub async fn request_human(
        &self,
        job: &Job,
        session: &dyn BrowserSession,
        request: InteractionRequest,
        cancel: &CancellationToken,
    ) -> Result<Resolution, TaskError> {
        let timeout_seconds = request.timeout_seconds.unwrap_or(DEFAULT_PAUSE_TIMEOUT_SECS);
        let interaction = json!({
            "type": request.interaction_type.as_str(),
            "screenshot_url": request.screenshot_url,
            "page_url": request.page_url,
            "timeout_seconds": timeout_seconds,
            "requested_at": chrono::Utc::now().to_rfc3339(),
        });

        let paused = self
            .store
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::Paused,
                StatusPatch {
                    set_heartbeat_now: true,
                    interaction_data: Some(Some(interaction)),
                    ..Default::default()
                },
            )
            .await
            .map_err(internal)?;
        if !paused {
            // Cancellation won the race.
            return Err(TaskError::Cancelled);
        }

        info!(
            job_id = %job.id,
            interaction = request.interaction_type.as_str(),
            timeout_seconds,
            "paused for human intervention"
        );
        self.store
            .record_event(
                job.id,
                event_type::HUMAN_NEEDED,
                Some(json!({ "type": request.interaction_type.as_str() })),
                &self.worker_id,
            )
            .await;

        if let Err(e) = session.pause().await {
            warn!(job_id = %job.id, error = %e, "failed to pause browser session");
        }

        self.notifier
            .notify_job(
                job,
                &CallbackPayload::needs_human(
                    job,
                    InteractionBlock {
                        interaction_type: request.interaction_type.as_str().to_string(),
                        screenshot_url: request.screenshot_url.clone(),
                        page_url: request.page_url.clone(),
                        timeout_seconds: Some(timeout_seconds),
                    },
                ),
            )
            .await;

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(timeout_seconds as u64);

        loop {
            match self.store.take_resolution(job.id).await {
                Ok(Some(raw)) => return self.resume_with(job, session, raw).await,
                Ok(None) => {}
                // Transient store errors just delay the next poll.
                Err(e) => warn!(job_id = %job.id, error = %e, "resolution poll failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TaskError::HumanTimeout {
                    seconds: timeout_seconds,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn resume_with(
        &self,
        job: &Job,
        session: &dyn BrowserSession,
        raw: Value,
    ) -> Result<Resolution, TaskError> {
        let resolution_type = raw
            .get("resolution_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let resolution = Resolution::from_parts(&resolution_type, raw.get("resolution_data"))
            .map_err(|msg| TaskError::fatal(ErrorCode::ValidationError, msg))?;

        self.store
            .record_event(
                job.id,
                event_type::HUMAN_RESOLVED,
                Some(json!({
                    "resolution_type": resolution_type,
                    "resolved_by": raw.get("resolved_by"),
                })),
                &self.worker_id,
            )
            .await;

        // Inject before un-pausing so the handler resumes on a ready page.
        let injected = match &resolution {
            Resolution::CodeEntry { code } => session.fill_one_time_code(code).await,
            Resolution::Credentials { username, password } => {
                session.fill_credentials(username, password).await
            }
            Resolution::Skip | Resolution::Manual => Ok(()),
        };
        if let Err(e) = injected {
            return Err(classify_error(&e));
        }

        if let Err(e) = session.resume().await {
            warn!(job_id = %job.id, error = %e, "failed to resume browser session");
        }

        let resumed = self
            .store
            .transition(
                job.id,
                JobStatus::Paused,
                JobStatus::Running,
                StatusPatch {
                    set_heartbeat_now: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(internal)?;
        if !resumed {
            return Err(TaskError::Cancelled);
        }

        info!(
            job_id = %job.id,
            resolution = resolution.type_str(),
            "resumed after human resolution"
        );
        self.notifier
            .notify_job(job, &CallbackPayload::resumed(job))
            .await;

        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_entry_requires_a_code() {
        let parsed = Resolution::from_parts("code_entry", Some(&json!({ "code": "123456" })));
        assert_eq!(
            parsed,
            Ok(Resolution::CodeEntry {
                code: "123456".to_string()
            })
        );

        assert!(Resolution::from_parts("code_entry", None).is_err());
        assert!(Resolution::from_parts("code_entry", Some(&json!({}))).is_err());
    }

    #[test]
    fn credentials_require_both_fields() {
        let parsed = Resolution::from_parts(
            "credentials",
            Some(&json!({ "username": "u", "password": "p" })),
        );
        assert_eq!(
            parsed,
            Ok(Resolution::Credentials {
                username: "u".to_string(),
                password: "p".to_string()
            })
        );

        assert!(
            Resolution::from_parts("credentials", Some(&json!({ "username": "u" }))).is_err()
        );
    }

    #[test]
    fn skip_and_manual_take_no_data() {
        assert_eq!(Resolution::from_parts("skip", None), Ok(Resolution::Skip));
        assert_eq!(Resolution::from_parts("manual", None), Ok(Resolution::Manual));
    }

    #[test]
    fn unknown_resolution_type_is_rejected() {
        assert!(Resolution::from_parts("teleport", None).is_err());
        assert!(!Resolution::valid_type("teleport"));
        assert!(Resolution::valid_type("code_entry"));
    }

    #[test]
    fn resolution_type_strings_round_trip() {
        for resolution in [
            Resolution::CodeEntry { code: "1".into() },
            Resolution::Credentials { username: "u".into(), password: "p".into() },
            Resolution::Skip,
            Resolution::Manual,
        ] {
            assert!(Resolution::valid_type(resolution.type_str()));
        }
    }

    #[test]
    fn interaction_types_serialize_snake_case() {
        assert_eq!(InteractionType::Captcha.as_str(), "captcha");
        assert_eq!(InteractionType::TwoFactor.as_str(), "two_factor");
    }
}
