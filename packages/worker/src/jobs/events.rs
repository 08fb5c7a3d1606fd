//! Append-only job audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Event type strings written to the `job_events` table.
pub mod event_type {
    pub const JOB_CREATED: &str = "job_created";
    pub const JOB_STARTED: &str = "job_started";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const PROGRESS_UPDATE: &str = "progress_update";
    pub const COST_RECORDED: &str = "cost_recorded";
    pub const JOB_COMPLETED: &str = "job_completed";
    pub const JOB_FAILED: &str = "job_failed";
    pub const JOB_CANCELLED: &str = "job_cancelled";
    pub const JOB_RECOVERED: &str = "job_recovered";
    pub const JOB_EXPIRED: &str = "job_expired";
    pub const JOB_RETRY_SCHEDULED: &str = "job_retry_scheduled";
    pub const HUMAN_NEEDED: &str = "human_needed";
    pub const HUMAN_RESOLVED: &str = "human_resolved";
    pub const MODE_SWITCHED: &str = "mode_switched";
    pub const MANUAL_FOUND: &str = "manual_found";
}

/// One row of the audit log. Ordering within a job is by `created_at`
/// ascending (the serial id breaks same-timestamp ties).
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobEventRow {
    pub id: i64,
    pub job_id: Uuid,
    pub event_type: String,
    pub metadata: Option<serde_json::Value>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Job lifecycle facts for in-process consumers (logging, metrics taps).
///
/// These mirror the rows written to `job_events` but carry typed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobLifecycleEvent {
    Created {
        job_id: Uuid,
        job_type: String,
        user_id: Uuid,
    },
    Started {
        job_id: Uuid,
        job_type: String,
        worker_id: String,
        attempt: i32,
    },
    Completed {
        job_id: Uuid,
        job_type: String,
        duration_ms: u64,
    },
    Failed {
        job_id: Uuid,
        job_type: String,
        error_code: String,
        will_retry: bool,
    },
    Cancelled {
        job_id: Uuid,
        job_type: String,
    },
    Recovered {
        job_id: Uuid,
        old_worker_id: Option<String>,
        reason: String,
    },
    HumanNeeded {
        job_id: Uuid,
        interaction_type: String,
    },
    HumanResolved {
        job_id: Uuid,
        resolution_type: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_started_serializes() {
        let event = JobLifecycleEvent::Started {
            job_id: Uuid::new_v4(),
            job_type: "apply".to_string(),
            worker_id: "worker-1".to_string(),
            attempt: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Started"));
        assert!(json.contains("apply"));
        assert!(json.contains("worker-1"));
    }

    #[test]
    fn event_failed_serializes() {
        let event = JobLifecycleEvent::Failed {
            job_id: Uuid::new_v4(),
            job_type: "scrape".to_string(),
            error_code: "network_error".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("network_error"));
        assert!(json.contains("will_retry"));
    }

    #[test]
    fn event_recovered_serializes() {
        let event = JobLifecycleEvent::Recovered {
            job_id: Uuid::new_v4(),
            old_worker_id: Some("worker-dead".to_string()),
            reason: "stuck_job_recovery".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("stuck_job_recovery"));
    }

    #[test]
    fn events_roundtrip_serialize() {
        let events = vec![
            JobLifecycleEvent::Created {
                job_id: Uuid::new_v4(),
                job_type: "apply".to_string(),
                user_id: Uuid::new_v4(),
            },
            JobLifecycleEvent::Completed {
                job_id: Uuid::new_v4(),
                job_type: "apply".to_string(),
                duration_ms: 1500,
            },
            JobLifecycleEvent::HumanNeeded {
                job_id: Uuid::new_v4(),
                interaction_type: "captcha".to_string(),
            },
            JobLifecycleEvent::HumanResolved {
                job_id: Uuid::new_v4(),
                resolution_type: "code_entry".to_string(),
            },
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let _: JobLifecycleEvent = serde_json::from_str(&json).unwrap();
        }
    }
}
