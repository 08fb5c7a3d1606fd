//! Cross-job budget control backed by persistent usage rows.

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::jobs::{event_type, PostgresJobStore};

use super::{CostSnapshot, QualityPreset, UserTier};

/// One billing-period accumulator row. Mutated only via the atomic
/// increment in [`CostControl::record_job_cost`].
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct UserUsage {
    pub user_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub tier: String,
    pub total_cost_usd: f64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub job_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserUsage {
    pub fn tier(&self) -> UserTier {
        UserTier::parse(&self.tier)
    }
}

/// Outcome of the pre-execution budget check.
#[derive(Debug, Clone, Serialize)]
pub struct Preflight {
    pub allowed: bool,
    pub tier: UserTier,
    pub remaining_budget_usd: f64,
    pub task_budget_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Current billing period: calendar month of `now`.
pub fn billing_period(now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
    let today = now.date_naive();
    let start = today.with_day(1).expect("day 1 always valid");
    let next_month = if start.month() == 12 {
        NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
    }
    .expect("first of month always valid");
    let end = next_month.pred_opt().expect("not the epoch");
    (start, end)
}

/// Pure preflight decision; the async path only supplies the inputs.
pub fn preflight_decision(tier: UserTier, current_month_cost: f64, preset: QualityPreset) -> Preflight {
    let remaining = tier.monthly_budget_usd() - current_month_cost;
    let task_budget = preset.task_budget_usd();
    if remaining < task_budget {
        Preflight {
            allowed: false,
            tier,
            remaining_budget_usd: remaining,
            task_budget_usd: task_budget,
            reason: Some(format!(
                "monthly budget exhausted: ${remaining:.2} remaining, task needs ${task_budget:.2}"
            )),
        }
    } else {
        Preflight {
            allowed: true,
            tier,
            remaining_budget_usd: remaining,
            task_budget_usd: task_budget,
            reason: None,
        }
    }
}

#[derive(Clone)]
pub struct CostControl {
    pool: PgPool,
    store: PostgresJobStore,
}

impl CostControl {
    pub fn new(pool: PgPool) -> Self {
        let store = PostgresJobStore::new(pool.clone());
        Self { pool, store }
    }

    /// The user's accumulator row for the current period, if any.
    pub async fn current_usage(&self, user_id: Uuid) -> Result<Option<UserUsage>> {
        let (period_start, _) = billing_period(Utc::now());
        let usage = sqlx::query_as::<_, UserUsage>(
            r#"
            SELECT user_id, period_start, period_end, tier, total_cost_usd,
                   total_input_tokens, total_output_tokens, job_count, updated_at
            FROM user_usage
            WHERE user_id = $1 AND period_start = $2
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(usage)
    }

    /// The user's tier as recorded on the current usage row (free if none).
    pub async fn tier_of(&self, user_id: Uuid) -> Result<UserTier> {
        Ok(self
            .current_usage(user_id)
            .await?
            .map(|u| u.tier())
            .unwrap_or_default())
    }

    /// Deny execution when the remaining monthly budget cannot cover the
    /// task budget implied by the preset.
    pub async fn preflight(&self, user_id: Uuid, preset: QualityPreset) -> Result<Preflight> {
        let usage = self.current_usage(user_id).await?;
        let (tier, current_cost) = usage
            .map(|u| (u.tier(), u.total_cost_usd))
            .unwrap_or((UserTier::default(), 0.0));
        Ok(preflight_decision(tier, current_cost, preset))
    }

    /// Record a finished job's cost against the user's monthly usage.
    ///
    /// One server-side increment keyed on `(user_id, period_start)`; the
    /// call passes deltas so concurrent completions cannot lose updates.
    /// Writes the `cost_recorded` event on success.
    pub async fn record_job_cost(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        snapshot: &CostSnapshot,
    ) -> Result<()> {
        let (period_start, period_end) = billing_period(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO user_usage (
                user_id, period_start, period_end, tier,
                total_cost_usd, total_input_tokens, total_output_tokens, job_count
            )
            VALUES ($1, $2, $3, 'free', $4, $5, $6, 1)
            ON CONFLICT (user_id, period_start) DO UPDATE
            SET total_cost_usd = user_usage.total_cost_usd + EXCLUDED.total_cost_usd,
                total_input_tokens = user_usage.total_input_tokens + EXCLUDED.total_input_tokens,
                total_output_tokens = user_usage.total_output_tokens + EXCLUDED.total_output_tokens,
                job_count = user_usage.job_count + 1,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .bind(period_end)
        .bind(snapshot.total_cost_usd())
        .bind(snapshot.input_tokens)
        .bind(snapshot.output_tokens)
        .execute(&self.pool)
        .await?;

        self.store
            .record_event(
                job_id,
                event_type::COST_RECORDED,
                Some(serde_json::json!({
                    "total_cost_usd": snapshot.total_cost_usd(),
                    "total_tokens": snapshot.total_tokens(),
                    "action_count": snapshot.action_count,
                })),
                "cost_control",
            )
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn billing_period_covers_the_calendar_month() {
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).unwrap();
        let (start, end) = billing_period(now);
        assert_eq!(start, NaiveDate::from_ymd_opt(2026, 7, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 7, 31).unwrap());
    }

    #[test]
    fn billing_period_handles_december() {
        let now = Utc.with_ymd_and_hms(2026, 12, 3, 0, 0, 0).unwrap();
        let (start, end) = billing_period(now);
        assert_eq!(start, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 12, 31).unwrap());
    }

    #[test]
    fn preflight_allows_when_budget_covers_task() {
        let decision = preflight_decision(UserTier::Pro, 9.80, QualityPreset::Balanced);
        assert!(decision.allowed);
        assert!((decision.remaining_budget_usd - 0.20).abs() < 1e-9);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn preflight_denies_when_remaining_below_task_budget() {
        let decision = preflight_decision(UserTier::Free, 0.49, QualityPreset::Speed);
        assert!(!decision.allowed);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn preflight_boundary_exact_remaining_allows() {
        // remaining == task budget is enough: denial requires remaining < budget.
        let decision = preflight_decision(UserTier::Free, 0.48, QualityPreset::Speed);
        assert!(decision.allowed);
    }

    #[test]
    fn exhausted_user_cannot_run_quality_tasks() {
        let decision = preflight_decision(UserTier::Starter, 1.80, QualityPreset::Quality);
        assert!(!decision.allowed);
        assert!((decision.task_budget_usd - 0.30).abs() < 1e-9);
    }
}
