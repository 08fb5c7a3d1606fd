//! PostgreSQL-backed job store.
//!
//! All mutation of the job table goes through this type. The claim is a
//! single server-side statement (`FOR UPDATE SKIP LOCKED` inside a CTE) so
//! concurrent workers never observe the same pending row; status changes
//! are conditional updates (CAS on the current status) and a rejected
//! transition is normal control flow.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::events::JobEventRow;
use super::job::{Job, JobStatus};

/// Column list shared by every query returning full job rows.
const JOB_COLUMNS: &str = "id, user_id, job_type, target_url, task_description, input_data, \
     metadata, priority, scheduled_at, timeout_seconds, status, worker_id, retry_count, \
     max_retries, started_at, completed_at, last_heartbeat, error_code, error_details, \
     result_data, result_summary, screenshot_urls, action_count, total_tokens, llm_cost_cents, \
     callback_url, valet_task_id, idempotency_key, interaction_data, created_at, updated_at";

/// Outcome of an insert that may hit the idempotency-key constraint.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// A new row was created.
    Created(Job),
    /// A job with the same idempotency key already exists; no row was written.
    Duplicate(Job),
}

impl InsertOutcome {
    pub fn job(&self) -> &Job {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Field changes applied together with a conditional status transition.
///
/// Usage counters are additive deltas; everything else overwrites only when
/// set. `clear_worker` releases row ownership (terminal transitions and
/// re-queues must do this to keep the worker-ownership invariant).
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub set_started_now: bool,
    pub set_completed_now: bool,
    pub set_heartbeat_now: bool,
    pub clear_worker: bool,
    pub error_code: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub result_data: Option<serde_json::Value>,
    pub result_summary: Option<String>,
    pub screenshot_urls: Option<Vec<String>>,
    /// (action_count, total_tokens, llm_cost_cents) deltas.
    pub usage_delta: Option<(i32, i64, i64)>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub increment_retry: bool,
    /// `Some(value)` overwrites `interaction_data`; `Some(None)` clears it.
    pub interaction_data: Option<Option<serde_json::Value>>,
}

impl StatusPatch {
    pub fn completed_now() -> Self {
        Self {
            set_completed_now: true,
            clear_worker: true,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new `pending` job.
    ///
    /// A unique violation on the idempotency key resolves to the existing
    /// row instead of an error. The `jobs_notify_pending` trigger emits the
    /// dispatcher wake-up inside the same transaction.
    pub async fn insert(&self, job: Job) -> Result<InsertOutcome> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, user_id, job_type, target_url, task_description, input_data, metadata,
                priority, scheduled_at, timeout_seconds, status, worker_id, retry_count,
                max_retries, started_at, completed_at, last_heartbeat, error_code, error_details,
                result_data, result_summary, screenshot_urls, action_count, total_tokens,
                llm_cost_cents, callback_url, valet_task_id, idempotency_key, interaction_data,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19,
                $20, $21, $22, $23, $24,
                $25, $26, $27, $28, $29,
                $30, $31
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, Job>(&sql)
            .bind(job.id)
            .bind(job.user_id)
            .bind(&job.job_type)
            .bind(&job.target_url)
            .bind(&job.task_description)
            .bind(&job.input_data)
            .bind(&job.metadata)
            .bind(job.priority)
            .bind(job.scheduled_at)
            .bind(job.timeout_seconds)
            .bind(job.status)
            .bind(&job.worker_id)
            .bind(job.retry_count)
            .bind(job.max_retries)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.last_heartbeat)
            .bind(&job.error_code)
            .bind(&job.error_details)
            .bind(&job.result_data)
            .bind(&job.result_summary)
            .bind(&job.screenshot_urls)
            .bind(job.action_count)
            .bind(job.total_tokens)
            .bind(job.llm_cost_cents)
            .bind(&job.callback_url)
            .bind(&job.valet_task_id)
            .bind(&job.idempotency_key)
            .bind(&job.interaction_data)
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(row) => Ok(InsertOutcome::Created(row)),
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some("idx_jobs_idempotency_key") =>
            {
                let key = job
                    .idempotency_key
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("idempotency conflict without a key"))?;
                let existing = self
                    .find_by_idempotency_key(key)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("duplicate key {key} but no existing row"))?;
                Ok(InsertOutcome::Duplicate(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim the next eligible pending job for `worker_id`.
    ///
    /// Eligibility: `status = 'pending'` and `scheduled_at` absent or due.
    /// Ordering: `priority DESC, created_at ASC`. The selected row moves to
    /// `queued` with `worker_id` and `last_heartbeat` stamped in the same
    /// statement. Returns `None` when nothing is claimable.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= NOW())
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'queued',
                worker_id = $1,
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Claim one specific job by conditional transition.
    ///
    /// The queue-consumer dispatcher uses this on message delivery: the
    /// queue is at-least-once, so a redelivered id simply finds the row no
    /// longer `pending` and returns `None`.
    pub async fn claim_specific(&self, job_id: Uuid, worker_id: &str) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'queued',
                worker_id = $2,
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'pending'
              AND (scheduled_at IS NULL OR scheduled_at <= NOW())
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Conditional status transition: applies only when the current status
    /// equals `from`. Returns whether the update happened.
    pub async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool> {
        let (set_interaction, interaction_value) = match patch.interaction_data {
            Some(value) => (true, value),
            None => (false, None),
        };
        let (action_delta, token_delta, cents_delta) = patch.usage_delta.unwrap_or((0, 0, 0));

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                started_at = CASE WHEN $4 THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END,
                last_heartbeat = CASE WHEN $6 THEN NOW() ELSE last_heartbeat END,
                worker_id = CASE WHEN $7 THEN NULL ELSE worker_id END,
                error_code = COALESCE($8, error_code),
                error_details = COALESCE($9, error_details),
                result_data = COALESCE($10, result_data),
                result_summary = COALESCE($11, result_summary),
                screenshot_urls = COALESCE($12, screenshot_urls),
                action_count = action_count + $13,
                total_tokens = total_tokens + $14,
                llm_cost_cents = llm_cost_cents + $15,
                scheduled_at = COALESCE($16, scheduled_at),
                retry_count = retry_count + $17,
                interaction_data = CASE WHEN $18 THEN $19 ELSE interaction_data END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job_id)
        .bind(from)
        .bind(to)
        .bind(patch.set_started_now)
        .bind(patch.set_completed_now)
        .bind(patch.set_heartbeat_now)
        .bind(patch.clear_worker)
        .bind(&patch.error_code)
        .bind(&patch.error_details)
        .bind(&patch.result_data)
        .bind(&patch.result_summary)
        .bind(&patch.screenshot_urls)
        .bind(action_delta)
        .bind(token_delta)
        .bind(cents_delta)
        .bind(patch.scheduled_at)
        .bind(if patch.increment_retry { 1i32 } else { 0i32 })
        .bind(set_interaction)
        .bind(interaction_value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Refresh the job heartbeat. Guarded by `worker_id` so a recovered and
    /// re-claimed job ignores the old owner's ticks.
    pub async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND worker_id = $2
              AND status IN ('queued', 'running', 'paused')
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Re-queue jobs whose heartbeat has expired past the liveness horizon.
    ///
    /// Does not touch `retry_count`: recovery is not an execution failure.
    /// Returns the recovered job ids.
    pub async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(
            r#"
            WITH stale AS (
                SELECT id, worker_id
                FROM jobs
                WHERE status IN ('queued', 'running')
                  AND last_heartbeat < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'pending',
                worker_id = NULL,
                last_heartbeat = NULL,
                updated_at = NOW()
            FROM stale s
            WHERE j.id = s.id
            RETURNING j.id, s.worker_id
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = Vec::with_capacity(rows.len());
        for (job_id, old_worker) in rows {
            self.record_event(
                job_id,
                super::events::event_type::JOB_RECOVERED,
                Some(serde_json::json!({
                    "reason": "stuck_job_recovery",
                    "old_worker_id": old_worker,
                })),
                "recovery_sweep",
            )
            .await;
            recovered.push(job_id);
        }

        Ok(recovered)
    }

    /// Expire abandoned jobs that already overran their wall-clock ceiling.
    ///
    /// Covers jobs whose worker died past the deadline: re-queuing them
    /// would only time out again, so they go terminal instead.
    pub async fn expire_overdue(&self, heartbeat_older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = 'expired',
                worker_id = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE status IN ('running', 'paused')
              AND last_heartbeat < $1
              AND started_at IS NOT NULL
              AND started_at + make_interval(secs => timeout_seconds) < NOW()
            RETURNING id
            "#,
        )
        .bind(heartbeat_older_than)
        .fetch_all(&self.pool)
        .await?;

        let expired: Vec<Uuid> = ids.into_iter().map(|(id,)| id).collect();
        for job_id in &expired {
            self.record_event(
                *job_id,
                super::events::event_type::JOB_EXPIRED,
                Some(serde_json::json!({ "reason": "deadline_overrun" })),
                "recovery_sweep",
            )
            .await;
        }

        Ok(expired)
    }

    /// Cross-actor cancellation: non-terminal -> `cancelled`.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                worker_id = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('pending', 'queued', 'running', 'paused')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        let cancelled = result.rows_affected() > 0;
        if cancelled {
            self.record_event(
                job_id,
                super::events::event_type::JOB_CANCELLED,
                None,
                "api",
            )
            .await;
        }
        Ok(cancelled)
    }

    /// Second-signal shutdown path: hand every job this worker still owns
    /// back to the queue.
    pub async fn force_release(&self, worker_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                last_heartbeat = NULL,
                updated_at = NOW()
            WHERE worker_id = $1
              AND status IN ('queued', 'running', 'paused')
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Append a row to the audit log. Errors propagate; most callers want
    /// [`record_event`](Self::record_event) instead.
    pub async fn append_event(
        &self,
        job_id: Uuid,
        event_type: &str,
        metadata: Option<serde_json::Value>,
        actor: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_events (job_id, event_type, metadata, actor)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(event_type)
        .bind(metadata)
        .bind(actor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append an event, logging instead of failing. Event-write failures
    /// must never take down the job they describe.
    pub async fn record_event(
        &self,
        job_id: Uuid,
        event_type: &str,
        metadata: Option<serde_json::Value>,
        actor: &str,
    ) {
        if let Err(e) = self.append_event(job_id, event_type, metadata, actor).await {
            warn!(job_id = %job_id, event_type, error = %e, "failed to append job event");
        }
    }

    /// Merge a HITL resolution into `interaction_data`. Only valid while
    /// the job is `paused`.
    pub async fn submit_resolution(
        &self,
        job_id: Uuid,
        resolution_type: &str,
        resolution_data: Option<serde_json::Value>,
        resolved_by: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET interaction_data = COALESCE(interaction_data, '{}'::jsonb)
                    || jsonb_build_object(
                           'resolution_type', $2::text,
                           'resolution_data', $3::jsonb,
                           'resolved_by', $4::text,
                           'resolved_at', NOW()
                       ),
                updated_at = NOW()
            WHERE id = $1 AND status = 'paused'
            "#,
        )
        .bind(job_id)
        .bind(resolution_type)
        .bind(resolution_data)
        .bind(resolved_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically read and clear a pending resolution (read-once).
    ///
    /// Returns the pre-strip `interaction_data` when a resolution was
    /// present; the stored row keeps the interaction context but loses the
    /// resolution keys, so a second call returns `None`.
    pub async fn take_resolution(&self, job_id: Uuid) -> Result<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r#"
            WITH resolved AS (
                SELECT id, interaction_data
                FROM jobs
                WHERE id = $1
                  AND interaction_data ? 'resolution_type'
                FOR UPDATE
            )
            UPDATE jobs j
            SET interaction_data = j.interaction_data
                    - 'resolution_type' - 'resolution_data' - 'resolved_by' - 'resolved_at',
                updated_at = NOW()
            FROM resolved r
            WHERE j.id = r.id
            RETURNING r.interaction_data
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(data,)| data))
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1 LIMIT 1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Cheap status poll used at cooperative cancellation checkpoints.
    pub async fn status_of(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        let status = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    /// Audit trail for a job, oldest first.
    pub async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<JobEventRow>> {
        let events = sqlx::query_as::<_, JobEventRow>(
            r#"
            SELECT id, job_id, event_type, metadata, actor, created_at
            FROM job_events
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_outcome_helpers() {
        let job = Job::builder()
            .user_id(Uuid::new_v4())
            .job_type("apply")
            .build();

        let created = InsertOutcome::Created(job.clone());
        assert!(created.is_created());
        assert_eq!(created.job().id, job.id);

        let duplicate = InsertOutcome::Duplicate(job.clone());
        assert!(!duplicate.is_created());
        assert_eq!(duplicate.job().id, job.id);
    }

    #[test]
    fn job_columns_match_struct_field_count() {
        // Job has 31 columns; a drifting list shows up as a runtime decode
        // error, so pin it here.
        assert_eq!(JOB_COLUMNS.split(',').count(), 31);
    }

    #[test]
    fn default_patch_changes_nothing_but_status() {
        let patch = StatusPatch::default();
        assert!(!patch.set_started_now);
        assert!(!patch.set_completed_now);
        assert!(!patch.clear_worker);
        assert!(patch.usage_delta.is_none());
        assert!(patch.interaction_data.is_none());
    }

    #[test]
    fn completed_patch_releases_the_worker() {
        let patch = StatusPatch::completed_now();
        assert!(patch.set_completed_now);
        assert!(patch.clear_worker);
    }
}
