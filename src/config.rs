// =============================================================================
// Rebalancing policy — every tunable knob of the decision pipeline
// =============================================================================
//
// Pure value record shared read-only by every pipeline layer. All fields
// carry `#[serde(default)]` so that adding new knobs never breaks loading an
// older policy file; `validate()` enforces the documented ranges and must be
// called before the policy reaches any manager.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::RebalanceError;
use crate::sizing::{ResidualStrategy, SizingMode};
use crate::types::TransitionSeverity;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_max_total_positions() -> usize {
    10
}

fn default_max_new_positions() -> usize {
    3
}

fn default_min_score_threshold() -> f64 {
    0.6
}

fn default_min_score_new_position() -> f64 {
    0.65
}

fn default_max_single_position_pct() -> f64 {
    0.20
}

fn default_max_single_position() -> f64 {
    0.15
}

fn default_target_total_allocation() -> f64 {
    0.95
}

fn default_min_position_size() -> f64 {
    0.02
}

fn default_max_residual_per_asset() -> f64 {
    0.05
}

fn default_max_positions_per_bucket() -> usize {
    4
}

fn default_max_allocation_per_bucket() -> f64 {
    0.4
}

fn default_min_buckets_represented() -> usize {
    2
}

fn default_grace_period_days() -> i64 {
    5
}

fn default_grace_decay_rate() -> f64 {
    0.8
}

fn default_min_decay_factor() -> f64 {
    0.1
}

fn default_min_holding_period_days() -> i64 {
    3
}

fn default_max_holding_period_days() -> i64 {
    90
}

fn default_regime_override_cooldown_days() -> i64 {
    30
}

fn default_regime_severity_threshold() -> TransitionSeverity {
    TransitionSeverity::High
}

fn default_max_cycles_per_protection_period() -> usize {
    1
}

fn default_whipsaw_protection_days() -> i64 {
    14
}

fn default_min_position_duration_hours() -> i64 {
    4
}

fn default_core_asset_override_threshold() -> f64 {
    0.95
}

fn default_max_core_assets() -> usize {
    3
}

fn default_core_asset_expiry_days() -> i64 {
    90
}

fn default_core_asset_extension_limit() -> u32 {
    2
}

fn default_core_asset_underperformance_threshold() -> f64 {
    0.15
}

fn default_core_asset_underperformance_period() -> i64 {
    30
}

fn default_performance_check_frequency_days() -> i64 {
    7
}

fn default_max_overrides_per_rebalance() -> usize {
    2
}

fn default_regime_context_cache_hours() -> i64 {
    1
}

// =============================================================================
// RebalancePolicy
// =============================================================================

/// Complete policy configuration for the rebalancing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePolicy {
    // ── Portfolio shape ──────────────────────────────────────────────────
    /// Hard cap on portfolio size.
    #[serde(default = "default_max_total_positions")]
    pub max_total_positions: usize,

    /// Cap on newly opened positions per rebalance.
    #[serde(default = "default_max_new_positions")]
    pub max_new_positions: usize,

    /// Incumbents with a combined score below this enter the grace pipeline
    /// (or are closed when grace periods are disabled).
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,

    /// New positions open only at or above this score.
    #[serde(default = "default_min_score_new_position")]
    pub min_score_new_position: f64,

    // ── Position sizing ──────────────────────────────────────────────────
    /// Per-position cap applied by the initial dynamic sizer.
    #[serde(default = "default_max_single_position_pct")]
    pub max_single_position_pct: f64,

    /// Stricter per-position cap applied by the two-stage sizer.
    #[serde(default = "default_max_single_position")]
    pub max_single_position: f64,

    /// Sum of non-cash weights the sizers aim for.
    #[serde(default = "default_target_total_allocation")]
    pub target_total_allocation: f64,

    /// Positions below this are boosted up to it, or dropped when zero.
    #[serde(default = "default_min_position_size")]
    pub min_position_size: f64,

    #[serde(default)]
    pub sizing_mode: SizingMode,

    #[serde(default)]
    pub residual_strategy: ResidualStrategy,

    /// Cap on residual added to any single asset by the top-slice strategy.
    #[serde(default = "default_max_residual_per_asset")]
    pub max_residual_per_asset: f64,

    // ── Bucket diversification ───────────────────────────────────────────
    #[serde(default)]
    pub enable_bucket_diversification: bool,

    #[serde(default = "default_max_positions_per_bucket")]
    pub max_positions_per_bucket: usize,

    #[serde(default = "default_max_allocation_per_bucket")]
    pub max_allocation_per_bucket: f64,

    #[serde(default = "default_min_buckets_represented")]
    pub min_buckets_represented: usize,

    /// Portfolio-priority assets bypass the per-bucket position cap.
    #[serde(default)]
    pub allow_bucket_overflow: bool,

    // ── Grace periods ────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub enable_grace_periods: bool,

    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: i64,

    /// Daily multiplicative decay applied to a position in grace.
    #[serde(default = "default_grace_decay_rate")]
    pub grace_decay_rate: f64,

    /// Floor on the decay factor. Size never falls below
    /// `original_size * min_decay_factor` while in grace.
    #[serde(default = "default_min_decay_factor")]
    pub min_decay_factor: f64,

    // ── Holding periods ──────────────────────────────────────────────────
    #[serde(default = "default_min_holding_period_days")]
    pub min_holding_period_days: i64,

    #[serde(default = "default_max_holding_period_days")]
    pub max_holding_period_days: i64,

    #[serde(default = "default_true")]
    pub enable_regime_overrides: bool,

    #[serde(default = "default_regime_override_cooldown_days")]
    pub regime_override_cooldown_days: i64,

    /// Minimum transition severity that unlocks any protection override.
    #[serde(default = "default_regime_severity_threshold")]
    pub regime_severity_threshold: TransitionSeverity,

    // ── Whipsaw protection ───────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub enable_whipsaw_protection: bool,

    #[serde(default = "default_max_cycles_per_protection_period")]
    pub max_cycles_per_protection_period: usize,

    #[serde(default = "default_whipsaw_protection_days")]
    pub whipsaw_protection_days: i64,

    #[serde(default = "default_min_position_duration_hours")]
    pub min_position_duration_hours: i64,

    /// Gate for the smart-diversification pass. Independent of the bucket
    /// limits gate: with bucket limiting off there is no spill to re-admit,
    /// and overrides still require a successful core designation.
    #[serde(default = "default_true")]
    pub enable_smart_diversification: bool,

    // ── Core assets ──────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub enable_core_asset_management: bool,

    /// Combined score at which a full bucket can be overridden, promoting
    /// the overrider to core.
    #[serde(default = "default_core_asset_override_threshold")]
    pub core_asset_override_threshold: f64,

    #[serde(default = "default_max_core_assets")]
    pub max_core_assets: usize,

    #[serde(default = "default_core_asset_expiry_days")]
    pub core_asset_expiry_days: i64,

    #[serde(default = "default_core_asset_extension_limit")]
    pub core_asset_extension_limit: u32,

    /// Bucket-mean minus asset return beyond which a core asset is revoked.
    #[serde(default = "default_core_asset_underperformance_threshold")]
    pub core_asset_underperformance_threshold: f64,

    /// Lookback window for the underperformance comparison, in days.
    #[serde(default = "default_core_asset_underperformance_period")]
    pub core_asset_underperformance_period: i64,

    /// Performance checks run no more often than this, in days.
    #[serde(default = "default_performance_check_frequency_days")]
    pub performance_check_frequency_days: i64,

    /// Bucket overrides granted per rebalance cycle.
    #[serde(default = "default_max_overrides_per_rebalance")]
    pub max_overrides_per_rebalance: usize,

    // ── Regime context ───────────────────────────────────────────────────
    /// Time-to-live of the cached regime context, in hours.
    #[serde(default = "default_regime_context_cache_hours")]
    pub regime_context_cache_hours: i64,
}

impl Default for RebalancePolicy {
    fn default() -> Self {
        // Round-trip through serde so the field defaults stay the single
        // source of truth.
        serde_json::from_str("{}").expect("empty policy deserializes")
    }
}

impl RebalancePolicy {
    /// Validate every tunable against its documented range.
    ///
    /// Returns a `Configuration` error naming the first offending knob.
    pub fn validate(&self) -> Result<(), RebalanceError> {
        fn range<T: PartialOrd + std::fmt::Display + Copy>(
            name: &str,
            value: T,
            lo: T,
            hi: T,
        ) -> Result<(), RebalanceError> {
            if value < lo || value > hi {
                return Err(RebalanceError::config(format!(
                    "{name} must be {lo}-{hi}, got {value}"
                )));
            }
            Ok(())
        }

        range("max_total_positions", self.max_total_positions, 1, 100)?;
        range("max_new_positions", self.max_new_positions, 0, 50)?;
        range("min_score_threshold", self.min_score_threshold, 0.0, 1.0)?;
        range(
            "min_score_new_position",
            self.min_score_new_position,
            0.0,
            1.0,
        )?;
        range(
            "target_total_allocation",
            self.target_total_allocation,
            0.01,
            1.0,
        )?;
        range(
            "max_single_position_pct",
            self.max_single_position_pct,
            0.01,
            1.0,
        )?;
        range("max_single_position", self.max_single_position, 0.01, 1.0)?;
        range("min_position_size", self.min_position_size, 0.0, 0.5)?;
        range(
            "max_residual_per_asset",
            self.max_residual_per_asset,
            0.0,
            0.5,
        )?;

        range("grace_period_days", self.grace_period_days, 1, 30)?;
        range("grace_decay_rate", self.grace_decay_rate, 0.1, 1.0)?;
        range("min_decay_factor", self.min_decay_factor, 0.01, 0.5)?;

        range(
            "min_holding_period_days",
            self.min_holding_period_days,
            0,
            365,
        )?;
        if self.max_holding_period_days < self.min_holding_period_days
            || self.max_holding_period_days > 365
        {
            return Err(RebalanceError::config(format!(
                "max_holding_period_days must be >= min_holding_period_days and <= 365, got {}",
                self.max_holding_period_days
            )));
        }
        range(
            "regime_override_cooldown_days",
            self.regime_override_cooldown_days,
            1,
            180,
        )?;

        range(
            "max_cycles_per_protection_period",
            self.max_cycles_per_protection_period,
            1,
            10,
        )?;
        range(
            "whipsaw_protection_days",
            self.whipsaw_protection_days,
            1,
            365,
        )?;
        range(
            "min_position_duration_hours",
            self.min_position_duration_hours,
            1,
            168,
        )?;

        range(
            "core_asset_override_threshold",
            self.core_asset_override_threshold,
            0.5,
            1.0,
        )?;
        range("max_core_assets", self.max_core_assets, 1, 20)?;
        range(
            "core_asset_expiry_days",
            self.core_asset_expiry_days,
            1,
            365,
        )?;
        range(
            "core_asset_underperformance_period",
            self.core_asset_underperformance_period,
            1,
            365,
        )?;
        range(
            "performance_check_frequency_days",
            self.performance_check_frequency_days,
            1,
            90,
        )?;

        if self.enable_bucket_diversification {
            range(
                "max_positions_per_bucket",
                self.max_positions_per_bucket,
                1,
                50,
            )?;
            range(
                "max_allocation_per_bucket",
                self.max_allocation_per_bucket,
                0.01,
                1.0,
            )?;
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let policy = RebalancePolicy::default();
        policy.validate().expect("default policy must validate");
        assert_eq!(policy.max_total_positions, 10);
        assert_eq!(policy.grace_period_days, 5);
        assert!((policy.target_total_allocation - 0.95).abs() < 1e-12);
        assert_eq!(policy.sizing_mode, SizingMode::Adaptive);
        assert_eq!(policy.residual_strategy, ResidualStrategy::SafeTopSlice);
        assert!(policy.enable_grace_periods);
        assert!(!policy.enable_bucket_diversification);
        assert!(policy.enable_smart_diversification);
    }

    #[test]
    fn out_of_range_grace_period_rejected() {
        let mut policy = RebalancePolicy::default();
        policy.grace_period_days = 45;
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("grace_period_days"));
    }

    #[test]
    fn max_holding_must_cover_min_holding() {
        let mut policy = RebalancePolicy::default();
        policy.min_holding_period_days = 30;
        policy.max_holding_period_days = 10;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn policy_round_trips_through_json() {
        let policy = RebalancePolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: RebalancePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_total_positions, policy.max_total_positions);
        assert_eq!(back.residual_strategy, policy.residual_strategy);
        assert_eq!(back.regime_severity_threshold, policy.regime_severity_threshold);
    }

    #[test]
    fn unknown_fields_use_defaults() {
        let policy: RebalancePolicy =
            serde_json::from_str(r#"{"max_total_positions": 5}"#).unwrap();
        assert_eq!(policy.max_total_positions, 5);
        assert_eq!(policy.max_new_positions, 3);
    }
}
