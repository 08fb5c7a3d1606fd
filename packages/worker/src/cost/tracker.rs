//! Per-execution cost accumulator.
//!
//! One tracker lives for the duration of a single job execution. Handlers
//! report token usage and browser actions through it; the tracker enforces
//! the task budget and action ceiling and terminates the run by returning
//! a typed error once either is crossed.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::QualityPreset;

/// Where a token batch's cost is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenRole {
    #[default]
    Reasoning,
    Image,
}

/// Execution strategy the handler is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Scripted platform recipe.
    #[default]
    Cookbook,
    /// Full LLM-driven agent.
    Magnitude,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Cookbook => "cookbook",
            ExecutionMode::Magnitude => "magnitude",
        }
    }
}

#[derive(Debug, Error)]
pub enum CostError {
    #[error("task budget exceeded for job {job_id}")]
    BudgetExceeded {
        job_id: Uuid,
        snapshot: CostSnapshot,
    },
    #[error("action limit exceeded for job {job_id}: {count} > {limit}")]
    ActionLimitExceeded {
        job_id: Uuid,
        count: u32,
        limit: u32,
    },
}

/// Immutable view of the tracker's counters. Repeated calls against the
/// same state yield identical values, including after a budget failure
/// (the snapshot then captures the over-budget totals).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CostSnapshot {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub image_cost_usd: f64,
    pub reasoning_cost_usd: f64,
    pub action_count: u32,
    pub cookbook_steps: u32,
    pub magnitude_steps: u32,
    pub mode: ExecutionMode,
    pub task_budget_usd: f64,
}

impl CostSnapshot {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.input_cost_usd + self.output_cost_usd
    }

    pub fn total_cost_cents(&self) -> i64 {
        (self.total_cost_usd() * 100.0).round() as i64
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    input_tokens: i64,
    output_tokens: i64,
    input_cost_usd: f64,
    output_cost_usd: f64,
    image_cost_usd: f64,
    reasoning_cost_usd: f64,
    action_count: u32,
    cookbook_steps: u32,
    magnitude_steps: u32,
    mode: ExecutionMode,
}

pub struct CostTracker {
    job_id: Uuid,
    task_budget_usd: f64,
    action_limit: u32,
    state: Mutex<TrackerState>,
}

impl CostTracker {
    pub fn new(job_id: Uuid, preset: QualityPreset, action_limit: u32) -> Self {
        Self {
            job_id,
            task_budget_usd: preset.task_budget_usd(),
            action_limit,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn task_budget_usd(&self) -> f64 {
        self.task_budget_usd
    }

    /// Record a token batch. Fails once the cumulative cost exceeds the
    /// task budget; the batch is still accounted so the failure snapshot
    /// reflects the over-budget state.
    pub fn record_token_usage(
        &self,
        input_tokens: i64,
        output_tokens: i64,
        input_cost_usd: f64,
        output_cost_usd: f64,
        role: TokenRole,
    ) -> Result<(), CostError> {
        let mut state = self.state.lock().expect("cost tracker poisoned");
        state.input_tokens += input_tokens;
        state.output_tokens += output_tokens;
        state.input_cost_usd += input_cost_usd;
        state.output_cost_usd += output_cost_usd;

        let batch_cost = input_cost_usd + output_cost_usd;
        match role {
            TokenRole::Image => state.image_cost_usd += batch_cost,
            TokenRole::Reasoning => state.reasoning_cost_usd += batch_cost,
        }

        let total = state.input_cost_usd + state.output_cost_usd;
        if total > self.task_budget_usd {
            let snapshot = Self::snapshot_of(&state, self.task_budget_usd);
            return Err(CostError::BudgetExceeded {
                job_id: self.job_id,
                snapshot,
            });
        }
        Ok(())
    }

    /// Count one browser action against the per-job ceiling.
    pub fn record_action(&self) -> Result<(), CostError> {
        let mut state = self.state.lock().expect("cost tracker poisoned");
        state.action_count += 1;
        if state.action_count > self.action_limit {
            return Err(CostError::ActionLimitExceeded {
                job_id: self.job_id,
                count: state.action_count,
                limit: self.action_limit,
            });
        }
        Ok(())
    }

    pub fn record_mode_step(&self, mode: ExecutionMode) {
        let mut state = self.state.lock().expect("cost tracker poisoned");
        match mode {
            ExecutionMode::Cookbook => state.cookbook_steps += 1,
            ExecutionMode::Magnitude => state.magnitude_steps += 1,
        }
    }

    pub fn set_mode(&self, mode: ExecutionMode) {
        self.state.lock().expect("cost tracker poisoned").mode = mode;
    }

    pub fn mode(&self) -> ExecutionMode {
        self.state.lock().expect("cost tracker poisoned").mode
    }

    pub fn snapshot(&self) -> CostSnapshot {
        let state = self.state.lock().expect("cost tracker poisoned");
        Self::snapshot_of(&state, self.task_budget_usd)
    }

    fn snapshot_of(state: &TrackerState, task_budget_usd: f64) -> CostSnapshot {
        CostSnapshot {
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            input_cost_usd: state.input_cost_usd,
            output_cost_usd: state.output_cost_usd,
            image_cost_usd: state.image_cost_usd,
            reasoning_cost_usd: state.reasoning_cost_usd,
            action_count: state.action_count,
            cookbook_steps: state.cookbook_steps,
            magnitude_steps: state.magnitude_steps,
            mode: state.mode,
            task_budget_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speed_tracker() -> CostTracker {
        CostTracker::new(Uuid::new_v4(), QualityPreset::Speed, 50)
    }

    #[test]
    fn usage_within_budget_is_allowed() {
        let tracker = speed_tracker();
        // Four batches of $0.005 land exactly on the $0.02 budget.
        for _ in 0..4 {
            tracker
                .record_token_usage(100, 50, 0.003, 0.002, TokenRole::Reasoning)
                .unwrap();
        }
        let snapshot = tracker.snapshot();
        assert!((snapshot.total_cost_usd() - 0.02).abs() < 1e-9);
        assert_eq!(snapshot.total_tokens(), 600);
    }

    #[test]
    fn fifth_batch_crosses_the_speed_budget() {
        let tracker = speed_tracker();
        for _ in 0..4 {
            tracker
                .record_token_usage(100, 50, 0.003, 0.002, TokenRole::Reasoning)
                .unwrap();
        }
        let err = tracker
            .record_token_usage(100, 50, 0.003, 0.002, TokenRole::Reasoning)
            .unwrap_err();
        match err {
            CostError::BudgetExceeded { snapshot, .. } => {
                // Snapshot captures the over-budget state.
                assert!(snapshot.total_cost_usd() > 0.02);
                assert_eq!(snapshot.total_tokens(), 750);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn snapshot_is_idempotent_including_after_failure() {
        let tracker = speed_tracker();
        let _ = tracker.record_token_usage(1000, 500, 0.02, 0.01, TokenRole::Reasoning);
        let a = tracker.snapshot();
        let b = tracker.snapshot();
        assert_eq!(a, b);
        assert!(a.total_cost_usd() > 0.02);
    }

    #[test]
    fn action_limit_enforced_past_the_ceiling() {
        let tracker = CostTracker::new(Uuid::new_v4(), QualityPreset::Balanced, 3);
        for _ in 0..3 {
            tracker.record_action().unwrap();
        }
        let err = tracker.record_action().unwrap_err();
        match err {
            CostError::ActionLimitExceeded { count, limit, .. } => {
                assert_eq!(count, 4);
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn image_role_routes_to_image_bucket() {
        let tracker = CostTracker::new(Uuid::new_v4(), QualityPreset::Quality, 50);
        tracker
            .record_token_usage(10, 0, 0.01, 0.0, TokenRole::Image)
            .unwrap();
        tracker
            .record_token_usage(10, 10, 0.02, 0.01, TokenRole::Reasoning)
            .unwrap();
        let snapshot = tracker.snapshot();
        assert!((snapshot.image_cost_usd - 0.01).abs() < 1e-9);
        assert!((snapshot.reasoning_cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn mode_steps_accumulate_per_mode() {
        let tracker = speed_tracker();
        tracker.record_mode_step(ExecutionMode::Cookbook);
        tracker.record_mode_step(ExecutionMode::Cookbook);
        tracker.record_mode_step(ExecutionMode::Magnitude);
        tracker.set_mode(ExecutionMode::Magnitude);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.cookbook_steps, 2);
        assert_eq!(snapshot.magnitude_steps, 1);
        assert_eq!(snapshot.mode, ExecutionMode::Magnitude);
    }

    #[test]
    fn cents_conversion_rounds() {
        let snapshot = CostSnapshot {
            input_cost_usd: 0.016,
            output_cost_usd: 0.007,
            ..Default::default()
        };
        assert_eq!(snapshot.total_cost_cents(), 2);
    }
}
