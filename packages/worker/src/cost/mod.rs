//! Budget enforcement: per-task accounting and per-user monthly control.

mod control;
mod tracker;

pub use control::{CostControl, Preflight, UserUsage};
pub use tracker::{CostError, CostSnapshot, CostTracker, ExecutionMode, TokenRole};

use serde::{Deserialize, Serialize};

/// Subscription tier. Drives the monthly budget and the default quality
/// preset; enterprise short-circuits rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    #[default]
    Free,
    Starter,
    Pro,
    Premium,
    Enterprise,
}

impl UserTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Starter => "starter",
            UserTier::Pro => "pro",
            UserTier::Premium => "premium",
            UserTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "starter" => UserTier::Starter,
            "pro" => UserTier::Pro,
            "premium" => UserTier::Premium,
            "enterprise" => UserTier::Enterprise,
            _ => UserTier::Free,
        }
    }

    /// Monthly LLM budget in USD.
    pub fn monthly_budget_usd(&self) -> f64 {
        match self {
            UserTier::Free => 0.50,
            UserTier::Starter => 2.00,
            UserTier::Pro => 10.00,
            UserTier::Premium => 10.00,
            UserTier::Enterprise => 100.00,
        }
    }

    /// Default quality preset when neither metadata nor input data names one.
    pub fn default_preset(&self) -> QualityPreset {
        match self {
            UserTier::Free => QualityPreset::Speed,
            UserTier::Starter => QualityPreset::Balanced,
            UserTier::Pro | UserTier::Premium => QualityPreset::Balanced,
            UserTier::Enterprise => QualityPreset::Quality,
        }
    }
}

/// Coarse cost/quality trade-off selecting the per-task LLM budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    Speed,
    #[default]
    Balanced,
    Quality,
}

impl QualityPreset {
    /// Per-task budget in USD.
    pub fn task_budget_usd(&self) -> f64 {
        match self {
            QualityPreset::Speed => 0.02,
            QualityPreset::Balanced => 0.10,
            QualityPreset::Quality => 0.30,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "speed" => Some(QualityPreset::Speed),
            "balanced" => Some(QualityPreset::Balanced),
            "quality" => Some(QualityPreset::Quality),
            _ => None,
        }
    }
}

/// Resolve the effective preset for a job.
///
/// Precedence: explicit `metadata.quality_preset`, then
/// `input_data.quality_preset`, then the tier default.
pub fn resolve_preset(
    metadata: Option<&serde_json::Value>,
    input_data: Option<&serde_json::Value>,
    tier: UserTier,
) -> QualityPreset {
    for source in [metadata, input_data].into_iter().flatten() {
        if let Some(preset) = source
            .get("quality_preset")
            .and_then(|v| v.as_str())
            .and_then(QualityPreset::parse)
        {
            return preset;
        }
    }
    tier.default_preset()
}

/// Per-job-type ceiling on browser actions. Unknown types get the default.
pub fn action_limit_for(job_type: &str) -> u32 {
    match job_type {
        "apply" | "smart_apply" => 75,
        "scrape" => 40,
        "form_fill" => 60,
        _ => 50,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn monthly_budgets_by_tier() {
        assert_eq!(UserTier::Free.monthly_budget_usd(), 0.50);
        assert_eq!(UserTier::Starter.monthly_budget_usd(), 2.00);
        assert_eq!(UserTier::Pro.monthly_budget_usd(), 10.00);
        assert_eq!(UserTier::Premium.monthly_budget_usd(), 10.00);
        assert_eq!(UserTier::Enterprise.monthly_budget_usd(), 100.00);
    }

    #[test]
    fn task_budgets_by_preset() {
        assert_eq!(QualityPreset::Speed.task_budget_usd(), 0.02);
        assert_eq!(QualityPreset::Balanced.task_budget_usd(), 0.10);
        assert_eq!(QualityPreset::Quality.task_budget_usd(), 0.30);
    }

    #[test]
    fn unknown_tier_string_falls_back_to_free() {
        assert_eq!(UserTier::parse("gold"), UserTier::Free);
        assert_eq!(UserTier::parse("enterprise"), UserTier::Enterprise);
    }

    #[test]
    fn preset_resolution_prefers_metadata() {
        let metadata = json!({ "quality_preset": "quality" });
        let input = json!({ "quality_preset": "speed" });
        assert_eq!(
            resolve_preset(Some(&metadata), Some(&input), UserTier::Free),
            QualityPreset::Quality
        );
    }

    #[test]
    fn preset_resolution_falls_through_to_input_data() {
        let input = json!({ "quality_preset": "speed" });
        assert_eq!(
            resolve_preset(None, Some(&input), UserTier::Pro),
            QualityPreset::Speed
        );
    }

    #[test]
    fn preset_resolution_defaults_by_tier() {
        assert_eq!(resolve_preset(None, None, UserTier::Free), QualityPreset::Speed);
        assert_eq!(
            resolve_preset(None, None, UserTier::Pro),
            QualityPreset::Balanced
        );
        assert_eq!(
            resolve_preset(None, None, UserTier::Enterprise),
            QualityPreset::Quality
        );
    }

    #[test]
    fn garbage_preset_values_are_ignored() {
        let metadata = json!({ "quality_preset": "ultra" });
        assert_eq!(
            resolve_preset(Some(&metadata), None, UserTier::Starter),
            QualityPreset::Balanced
        );
    }

    #[test]
    fn action_limits_default_to_fifty() {
        assert_eq!(action_limit_for("apply"), 75);
        assert_eq!(action_limit_for("scrape"), 40);
        assert_eq!(action_limit_for("unknown_type"), 50);
    }
}
