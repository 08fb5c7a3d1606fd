//! Step-based progress tracking with throttled emission.
//!
//! Progress flows to two places through the [`ProgressSink`] seam: the
//! `job_events` audit log and, when Redis is configured, a capped per-job
//! stream consumed by the upstream UI. Step and action indexes are
//! monotonic; late or out-of-order reports never move progress backwards.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::jobs::{event_type, PostgresJobStore};

/// Ordered lifecycle steps. Progression through this list is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Queued,
    Initializing,
    Navigating,
    AnalyzingPage,
    FillingForm,
    UploadingResume,
    AnsweringQuestions,
    Reviewing,
    Submitting,
    ExtractingResults,
    AwaitingUserReview,
    Completed,
}

pub const STEP_ORDER: [ProgressStep; 12] = [
    ProgressStep::Queued,
    ProgressStep::Initializing,
    ProgressStep::Navigating,
    ProgressStep::AnalyzingPage,
    ProgressStep::FillingForm,
    ProgressStep::UploadingResume,
    ProgressStep::AnsweringQuestions,
    ProgressStep::Reviewing,
    ProgressStep::Submitting,
    ProgressStep::ExtractingResults,
    ProgressStep::AwaitingUserReview,
    ProgressStep::Completed,
];

impl ProgressStep {
    pub fn index(&self) -> usize {
        STEP_ORDER.iter().position(|s| s == self).expect("step in order")
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStep::Queued => "queued",
            ProgressStep::Initializing => "initializing",
            ProgressStep::Navigating => "navigating",
            ProgressStep::AnalyzingPage => "analyzing_page",
            ProgressStep::FillingForm => "filling_form",
            ProgressStep::UploadingResume => "uploading_resume",
            ProgressStep::AnsweringQuestions => "answering_questions",
            ProgressStep::Reviewing => "reviewing",
            ProgressStep::Submitting => "submitting",
            ProgressStep::ExtractingResults => "extracting_results",
            ProgressStep::AwaitingUserReview => "awaiting_user_review",
            ProgressStep::Completed => "completed",
        }
    }
}

/// Map an action variant (plus the agent's latest thought) to a candidate
/// step. Only ever advances the current step.
fn infer_step(variant: &str, thought: Option<&str>) -> Option<ProgressStep> {
    let thought = thought.unwrap_or("").to_lowercase();
    if thought.contains("submit") || variant == "submit" {
        return Some(ProgressStep::Submitting);
    }
    if thought.contains("review") {
        return Some(ProgressStep::Reviewing);
    }
    if thought.contains("question") {
        return Some(ProgressStep::AnsweringQuestions);
    }
    match variant {
        "navigate" | "goto" => Some(ProgressStep::Navigating),
        "extract" | "scrape" => Some(ProgressStep::ExtractingResults),
        "upload" => Some(ProgressStep::UploadingResume),
        "click" | "type" | "fill" | "select" | "check" => Some(ProgressStep::FillingForm),
        "screenshot" | "observe" => Some(ProgressStep::AnalyzingPage),
        _ => None,
    }
}

/// One progress observation, as published to the stream and the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub step: ProgressStep,
    pub step_index: usize,
    pub action_index: u32,
    pub estimated_total_actions: u32,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

/// Where emitted snapshots go.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, snapshot: &ProgressSnapshot) -> anyhow::Result<()>;

    /// Called once on terminal flush (sets stream retention).
    async fn finalize(&self, job_id: Uuid) -> anyhow::Result<()>;
}

/// Production sink: dual-writes the audit log and the Redis stream.
pub struct DualWriteSink {
    store: PostgresJobStore,
    redis: Option<ConnectionManager>,
    stream_max_len: usize,
    stream_ttl_seconds: i64,
}

impl DualWriteSink {
    pub fn new(store: PostgresJobStore, redis: Option<ConnectionManager>) -> Self {
        Self {
            store,
            redis,
            stream_max_len: 1000,
            stream_ttl_seconds: 24 * 60 * 60,
        }
    }

    fn stream_key(job_id: Uuid) -> String {
        format!("ghosthands:progress:{job_id}")
    }
}

#[async_trait]
impl ProgressSink for DualWriteSink {
    async fn emit(&self, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        let payload = serde_json::to_value(snapshot)?;
        self.store
            .record_event(
                snapshot.job_id,
                event_type::PROGRESS_UPDATE,
                Some(payload.clone()),
                "progress_tracker",
            )
            .await;

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let result: redis::RedisResult<String> = redis::cmd("XADD")
                .arg(Self::stream_key(snapshot.job_id))
                .arg("MAXLEN")
                .arg("~")
                .arg(self.stream_max_len)
                .arg("*")
                .arg("data")
                .arg(payload.to_string())
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!(job_id = %snapshot.job_id, error = %e, "progress stream publish failed");
            }
        }
        Ok(())
    }

    async fn finalize(&self, job_id: Uuid) -> anyhow::Result<()> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let result: redis::RedisResult<i64> = redis::cmd("EXPIRE")
                .arg(Self::stream_key(job_id))
                .arg(self.stream_ttl_seconds)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!(job_id = %job_id, error = %e, "progress stream expire failed");
            }
        }
        Ok(())
    }
}

struct ProgressState {
    step: ProgressStep,
    action_index: u32,
    estimated_total_actions: u32,
    thought: Option<String>,
    last_emit: Option<Instant>,
    pending: Option<ProgressSnapshot>,
}

pub struct ProgressTracker {
    job_id: Uuid,
    sink: Arc<dyn ProgressSink>,
    throttle: Duration,
    started_at: DateTime<Utc>,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(job_id: Uuid, sink: Arc<dyn ProgressSink>) -> Self {
        Self::with_throttle(job_id, sink, Duration::from_millis(2000))
    }

    pub fn with_throttle(job_id: Uuid, sink: Arc<dyn ProgressSink>, throttle: Duration) -> Self {
        Self {
            job_id,
            sink,
            throttle,
            started_at: Utc::now(),
            state: Mutex::new(ProgressState {
                step: ProgressStep::Queued,
                action_index: 0,
                estimated_total_actions: 30,
                thought: None,
                last_emit: None,
                pending: None,
            }),
        }
    }

    pub fn set_estimated_total_actions(&self, estimate: u32) {
        let mut state = self.state.lock().expect("progress state poisoned");
        state.estimated_total_actions = estimate.max(1);
    }

    pub fn set_thought(&self, thought: impl Into<String>) {
        let mut state = self.state.lock().expect("progress state poisoned");
        state.thought = Some(thought.into());
    }

    pub fn current_step(&self) -> ProgressStep {
        self.state.lock().expect("progress state poisoned").step
    }

    pub fn action_index(&self) -> u32 {
        self.state.lock().expect("progress state poisoned").action_index
    }

    /// Advance to `step`. Regressions are silently ignored.
    pub async fn set_step(&self, step: ProgressStep) {
        let to_emit = {
            let mut state = self.state.lock().expect("progress state poisoned");
            if step.index() <= state.step.index() {
                return;
            }
            state.step = step;
            self.stage_snapshot(&mut state)
        };
        self.drain(to_emit).await;
    }

    /// An agent action began: bump the action index and let the heuristic
    /// advance the step if it maps further ahead.
    pub fn on_action_started(&self, variant: &str) {
        let mut state = self.state.lock().expect("progress state poisoned");
        state.action_index += 1;
        if let Some(inferred) = infer_step(variant, state.thought.as_deref()) {
            if inferred.index() > state.step.index() {
                state.step = inferred;
            }
        }
    }

    /// An agent action finished: throttled emit.
    pub async fn on_action_done(&self, _variant: &str) {
        let to_emit = {
            let mut state = self.state.lock().expect("progress state poisoned");
            self.stage_snapshot(&mut state)
        };
        self.drain(to_emit).await;
    }

    /// Emit any pending snapshot and finalize the stream. Called on
    /// terminal transition.
    pub async fn flush(&self) {
        let pending = {
            let mut state = self.state.lock().expect("progress state poisoned");
            state.pending.take()
        };
        if let Some(snapshot) = pending {
            if let Err(e) = self.sink.emit(&snapshot).await {
                warn!(job_id = %self.job_id, error = %e, "progress emit failed");
            }
        }
        if let Err(e) = self.sink.finalize(self.job_id).await {
            warn!(job_id = %self.job_id, error = %e, "progress finalize failed");
        }
    }

    /// Build the current snapshot and decide throttling. Returns the
    /// snapshot to emit now, or stashes it as pending.
    fn stage_snapshot(&self, state: &mut ProgressState) -> Option<ProgressSnapshot> {
        let snapshot = self.snapshot_of(state);
        let now = Instant::now();
        let throttled = state
            .last_emit
            .map(|last| now.duration_since(last) < self.throttle)
            .unwrap_or(false);
        if throttled {
            state.pending = Some(snapshot);
            None
        } else {
            state.last_emit = Some(now);
            state.pending = None;
            Some(snapshot)
        }
    }

    async fn drain(&self, to_emit: Option<ProgressSnapshot>) {
        if let Some(snapshot) = to_emit {
            if let Err(e) = self.sink.emit(&snapshot).await {
                warn!(job_id = %self.job_id, error = %e, "progress emit failed");
            }
        }
    }

    fn snapshot_of(&self, state: &ProgressState) -> ProgressSnapshot {
        let percent = progress_percent(
            state.step,
            state.action_index,
            state.estimated_total_actions,
        );
        let eta_seconds = if state.action_index >= 2 && percent > 0 && percent < 100 {
            let elapsed = (Utc::now() - self.started_at).num_seconds().max(0);
            Some(elapsed * (100 - percent as i64) / percent as i64)
        } else {
            None
        };
        ProgressSnapshot {
            job_id: self.job_id,
            step: state.step,
            step_index: state.step.index(),
            action_index: state.action_index,
            estimated_total_actions: state.estimated_total_actions,
            percent,
            eta_seconds,
            thought: state.thought.clone(),
            emitted_at: Utc::now(),
        }
    }
}

/// Blend of step position (60%) and action ratio (40%), capped at 99 until
/// the terminal step.
pub fn progress_percent(step: ProgressStep, action_index: u32, estimated_total: u32) -> u8 {
    if step == ProgressStep::Completed {
        return 100;
    }
    let step_part = step.index() as f64 / (STEP_ORDER.len() - 1) as f64 * 60.0;
    let action_ratio = (action_index as f64 / estimated_total.max(1) as f64).min(1.0);
    let action_part = action_ratio * 40.0;
    ((step_part + action_part).round() as u8).min(99)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        emitted: Mutex<Vec<ProgressSnapshot>>,
        finalized: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn emit(&self, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
            self.emitted.lock().unwrap().push(snapshot.clone());
            Ok(())
        }

        async fn finalize(&self, job_id: Uuid) -> anyhow::Result<()> {
            self.finalized.lock().unwrap().push(job_id);
            Ok(())
        }
    }

    fn tracker_with_sink(throttle_ms: u64) -> (ProgressTracker, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let tracker = ProgressTracker::with_throttle(
            Uuid::new_v4(),
            sink.clone(),
            Duration::from_millis(throttle_ms),
        );
        (tracker, sink)
    }

    #[tokio::test]
    async fn steps_never_regress() {
        let (tracker, _sink) = tracker_with_sink(0);
        tracker.set_step(ProgressStep::FillingForm).await;
        tracker.set_step(ProgressStep::Navigating).await;
        assert_eq!(tracker.current_step(), ProgressStep::FillingForm);
    }

    #[tokio::test]
    async fn action_inference_only_advances() {
        let (tracker, _sink) = tracker_with_sink(0);
        tracker.set_step(ProgressStep::AnsweringQuestions).await;

        // A click would map to filling_form, which is behind.
        tracker.on_action_started("click");
        assert_eq!(tracker.current_step(), ProgressStep::AnsweringQuestions);
        assert_eq!(tracker.action_index(), 1);

        // Submit maps ahead and advances.
        tracker.on_action_started("submit");
        assert_eq!(tracker.current_step(), ProgressStep::Submitting);
    }

    #[tokio::test]
    async fn thought_hint_wins_over_variant() {
        let (tracker, _sink) = tracker_with_sink(0);
        tracker.set_thought("reviewing the application before submit is disabled");
        tracker.on_action_started("click");
        // "submit" in the thought outranks the click variant.
        assert_eq!(tracker.current_step(), ProgressStep::Submitting);
    }

    #[tokio::test(start_paused = true)]
    async fn emissions_are_throttled_and_pending_flushes() {
        let (tracker, sink) = tracker_with_sink(2000);

        tracker.on_action_started("click");
        tracker.on_action_done("click").await;
        assert_eq!(sink.emitted.lock().unwrap().len(), 1);

        // Inside the throttle window: stashed, not emitted.
        tracker.on_action_started("type");
        tracker.on_action_done("type").await;
        assert_eq!(sink.emitted.lock().unwrap().len(), 1);

        tracker.flush().await;
        let emitted = sink.emitted.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].action_index, 2);
        assert_eq!(sink.finalized.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_window_reopens() {
        let (tracker, sink) = tracker_with_sink(2000);
        tracker.on_action_done("click").await;

        tokio::time::advance(std::time::Duration::from_millis(2500)).await;
        tracker.on_action_done("click").await;
        assert_eq!(sink.emitted.lock().unwrap().len(), 2);
    }

    #[test]
    fn percent_blends_step_and_actions() {
        // Step 0, no actions.
        assert_eq!(progress_percent(ProgressStep::Queued, 0, 30), 0);
        // Submitting is index 8 of 11 → 43.6 step points; all actions done
        // adds the full 40.
        let pct = progress_percent(ProgressStep::Submitting, 30, 30);
        assert_eq!(pct, 84);
    }

    #[test]
    fn percent_caps_at_99_before_completion() {
        let pct = progress_percent(ProgressStep::AwaitingUserReview, 1000, 30);
        assert_eq!(pct, 95);
        // Even an absurd action ratio cannot reach 100 without Completed.
        assert!(progress_percent(ProgressStep::ExtractingResults, 10_000, 1) <= 99);
    }

    #[test]
    fn percent_is_100_only_on_completed() {
        assert_eq!(progress_percent(ProgressStep::Completed, 0, 30), 100);
    }

    #[tokio::test]
    async fn snapshots_are_monotonic_in_step_and_action() {
        let (tracker, sink) = tracker_with_sink(0);
        tracker.set_step(ProgressStep::Initializing).await;
        tracker.on_action_started("navigate");
        tracker.on_action_done("navigate").await;
        tracker.set_step(ProgressStep::FillingForm).await;
        tracker.on_action_started("click");
        tracker.on_action_done("click").await;

        let emitted = sink.emitted.lock().unwrap();
        for pair in emitted.windows(2) {
            assert!(pair[1].step_index >= pair[0].step_index);
            assert!(pair[1].action_index >= pair[0].action_index);
        }
    }
}
