// =============================================================================
// Position lifecycle tracker — stage machine for every held position
// =============================================================================
//
// Life-cycle:
//   Active -> Grace -> Warning -> ForcedReview -> Closing
//
// The tracker is reporting-only: it never vetoes a mutation. It maintains a
// per-position state record (stage, health, score trend, peak size) and a
// portfolio-wide summary, driven by the engine after each rebalance.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// State model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Active,
    Grace,
    Warning,
    ForcedReview,
    Closing,
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Grace => write!(f, "grace"),
            Self::Warning => write!(f, "warning"),
            Self::ForcedReview => write!(f, "forced_review"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTrend {
    Improving,
    Declining,
    Stable,
}

/// Consecutive low scores before a position is staged as Warning.
const WARNING_LOW_SCORES: u32 = 2;
/// Consecutive low scores before health turns Critical.
const CRITICAL_LOW_SCORES: u32 = 3;
/// Size drawdown from peak (fraction) at which health turns Critical.
const CRITICAL_DRAWDOWN: f64 = 0.5;
/// Score delta treated as flat when computing the trend.
const TREND_EPSILON: f64 = 0.02;

/// Full state record for one tracked position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub asset: String,
    pub stage: LifecycleStage,
    pub entry_date: DateTime<Utc>,
    pub current_size: f64,
    pub current_score: f64,
    pub days_held: i64,
    pub grace_days_remaining: i64,
    pub last_adjustment: Option<DateTime<Utc>>,
    pub bucket: String,
    pub health: HealthStatus,
    pub original_entry_size: f64,
    pub peak_size: f64,
    pub score_trend: ScoreTrend,
    pub consecutive_low_scores: u32,
    /// Recent scores, newest last, bounded.
    score_history: Vec<f64>,
}

/// Record handed back when a position closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub asset: String,
    pub entry_date: DateTime<Utc>,
    pub close_date: DateTime<Utc>,
    pub days_held: i64,
    pub final_stage: LifecycleStage,
    pub final_health: HealthStatus,
    pub close_reason: String,
}

/// Portfolio-wide stage and health histogram.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleSummary {
    pub total_positions: usize,
    pub by_stage: BTreeMap<String, usize>,
    pub by_health: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

const SCORE_HISTORY_LEN: usize = 10;

#[derive(Default)]
pub struct PositionLifecycleTracker {
    states: BTreeMap<String, PositionState>,
}

impl PositionLifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a freshly opened position.
    pub fn track_entry(
        &mut self,
        asset: &str,
        date: DateTime<Utc>,
        size: f64,
        score: f64,
        bucket: &str,
    ) {
        debug!(asset, size, score, "lifecycle tracking started");
        self.states.insert(
            asset.to_string(),
            PositionState {
                asset: asset.to_string(),
                stage: LifecycleStage::Active,
                entry_date: date,
                current_size: size,
                current_score: score,
                days_held: 0,
                grace_days_remaining: 0,
                last_adjustment: None,
                bucket: bucket.to_string(),
                health: HealthStatus::Healthy,
                original_entry_size: size,
                peak_size: size,
                score_trend: ScoreTrend::Stable,
                consecutive_low_scores: 0,
                score_history: vec![score],
            },
        );
    }

    /// Update a tracked position after a rebalance decision. Returns the
    /// stage transition, if any, as `(from, to)`.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        asset: &str,
        date: DateTime<Utc>,
        score: f64,
        size: f64,
        score_threshold: f64,
        in_grace: bool,
        grace_days_remaining: i64,
        forced_review: bool,
        closing: bool,
    ) -> Option<(LifecycleStage, LifecycleStage)> {
        let state = self.states.get_mut(asset)?;
        let previous_stage = state.stage;

        state.current_score = score;
        state.current_size = size;
        state.days_held = (date - state.entry_date).num_days();
        state.grace_days_remaining = grace_days_remaining;
        state.last_adjustment = Some(date);
        state.peak_size = state.peak_size.max(size);

        state.score_history.push(score);
        if state.score_history.len() > SCORE_HISTORY_LEN {
            state.score_history.remove(0);
        }

        if score < score_threshold {
            state.consecutive_low_scores += 1;
        } else {
            state.consecutive_low_scores = 0;
        }

        state.score_trend = trend(&state.score_history);
        state.stage = if closing {
            LifecycleStage::Closing
        } else if forced_review {
            LifecycleStage::ForcedReview
        } else if in_grace {
            LifecycleStage::Grace
        } else if state.consecutive_low_scores >= WARNING_LOW_SCORES {
            LifecycleStage::Warning
        } else {
            LifecycleStage::Active
        };
        state.health = assess_health(state);

        if previous_stage != state.stage {
            info!(
                asset,
                from = %previous_stage,
                to = %state.stage,
                "lifecycle stage transition"
            );
            return Some((previous_stage, state.stage));
        }
        None
    }

    /// Stop tracking a closed position and summarise its life.
    pub fn record_closure(
        &mut self,
        asset: &str,
        date: DateTime<Utc>,
        reason: &str,
    ) -> Option<PositionSummary> {
        let state = self.states.remove(asset)?;
        let summary = PositionSummary {
            asset: state.asset.clone(),
            entry_date: state.entry_date,
            close_date: date,
            days_held: (date - state.entry_date).num_days(),
            final_stage: state.stage,
            final_health: state.health,
            close_reason: reason.to_string(),
        };
        info!(asset, days_held = summary.days_held, reason, "position closed");
        Some(summary)
    }

    pub fn state(&self, asset: &str) -> Option<&PositionState> {
        self.states.get(asset)
    }

    pub fn is_tracked(&self, asset: &str) -> bool {
        self.states.contains_key(asset)
    }

    pub fn tracked_assets(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    pub fn summary(&self) -> LifecycleSummary {
        let mut summary = LifecycleSummary {
            total_positions: self.states.len(),
            ..Default::default()
        };
        for state in self.states.values() {
            *summary.by_stage.entry(state.stage.to_string()).or_insert(0) += 1;
            *summary
                .by_health
                .entry(format!("{:?}", state.health).to_lowercase())
                .or_insert(0) += 1;
        }
        summary
    }
}

fn trend(history: &[f64]) -> ScoreTrend {
    if history.len() < 3 {
        return ScoreTrend::Stable;
    }
    let recent = &history[history.len() - 3..];
    let delta = recent[2] - recent[0];
    if delta > TREND_EPSILON {
        ScoreTrend::Improving
    } else if delta < -TREND_EPSILON {
        ScoreTrend::Declining
    } else {
        ScoreTrend::Stable
    }
}

fn assess_health(state: &PositionState) -> HealthStatus {
    let drawdown = if state.peak_size > 0.0 {
        1.0 - state.current_size / state.peak_size
    } else {
        0.0
    };
    if state.consecutive_low_scores >= CRITICAL_LOW_SCORES || drawdown > CRITICAL_DRAWDOWN {
        HealthStatus::Critical
    } else if state.consecutive_low_scores > 0 || state.score_trend == ScoreTrend::Declining {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Tests
// =============================================================================
