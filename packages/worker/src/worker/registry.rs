//! Worker fleet registry rows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "worker_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Active,
    Draining,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Offline => "offline",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRow {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_job_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub deployment: Option<serde_json::Value>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WorkerRegistry {
    pool: PgPool,
}

impl WorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register (or re-register) this worker as active.
    pub async fn upsert(
        &self,
        worker_id: &str,
        deployment: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_registry (worker_id, status, deployment)
            VALUES ($1, 'active', $2)
            ON CONFLICT (worker_id) DO UPDATE
            SET status = 'active',
                deployment = EXCLUDED.deployment,
                current_job_id = NULL,
                last_heartbeat = NOW()
            "#,
        )
        .bind(worker_id)
        .bind(deployment)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Refresh liveness and occupancy.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        current_job_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE worker_registry
            SET status = $2,
                current_job_id = $3,
                last_heartbeat = NOW()
            WHERE worker_id = $1
            "#,
        )
        .bind(worker_id)
        .bind(status)
        .bind(current_job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn deregister(&self, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE worker_registry
            SET status = 'offline',
                current_job_id = NULL,
                last_heartbeat = NOW()
            WHERE worker_id = $1
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find(&self, worker_id: &str) -> Result<Option<WorkerRow>> {
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT worker_id, status, current_job_id, last_heartbeat, deployment, registered_at
            FROM worker_registry
            WHERE worker_id = $1
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_are_snake_case() {
        assert_eq!(WorkerStatus::Active.as_str(), "active");
        assert_eq!(WorkerStatus::Draining.as_str(), "draining");
        assert_eq!(WorkerStatus::Offline.as_str(), "offline");
    }

    #[test]
    fn default_status_is_active() {
        assert_eq!(WorkerStatus::default(), WorkerStatus::Active);
    }
}
