// =============================================================================
// Grace period manager — decay instead of immediate closure
// =============================================================================
//
// Positions whose score drops below the keep threshold are not closed on the
// spot. They enter a grace period and shrink by a deterministic exponential
// decay until either the score recovers, the grace window expires (forced
// close), or the decay floor is reached.
//
// State machine per asset:
//
//   None  --score < threshold-->  Grace   (grace_start, size unchanged)
//   Grace --score >= threshold--> None    (grace_recovery, size kept)
//   Grace --day < window-------->  Grace  (grace_decay, size = decayed)
//   Grace --day >= window-------> None    (force_close, size = 0)
//
// Decay is a function of elapsed days, not call count: calling twice on the
// same date yields the same size.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Metadata for a position currently in grace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GracePosition {
    pub asset: String,
    pub start_date: DateTime<Utc>,
    pub original_size: f64,
    pub original_score: f64,
    pub current_size: f64,
    /// Size shaved off so far.
    pub decay_applied: f64,
    pub reason: String,
}

/// Outcome of a grace evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraceOutcome {
    /// Score above threshold, position untouched.
    Hold,
    /// Entered grace this evaluation.
    GraceStart,
    /// Still in grace, size decayed.
    GraceDecay,
    /// Score recovered, grace lifted.
    GraceRecovery,
    /// Grace window expired, position must close.
    ForceClose,
}

/// Action to take for a position after grace evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraceAction {
    pub outcome: GraceOutcome,
    pub new_size: f64,
    pub reason: String,
    pub days_in_grace: i64,
}

/// Status snapshot for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraceStatus {
    pub asset: String,
    pub start_date: DateTime<Utc>,
    pub days_in_grace: i64,
    pub days_remaining: i64,
    pub original_size: f64,
    pub current_size: f64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Grace period state for all assets. One entry per asset at most.
pub struct GracePeriodManager {
    grace_period_days: i64,
    decay_rate: f64,
    min_decay_factor: f64,
    positions: BTreeMap<String, GracePosition>,
}

impl GracePeriodManager {
    pub fn new(grace_period_days: i64, decay_rate: f64, min_decay_factor: f64) -> Self {
        Self {
            grace_period_days,
            decay_rate,
            min_decay_factor,
            positions: BTreeMap::new(),
        }
    }

    /// Evaluate one position against the keep threshold.
    pub fn handle_underperformer(
        &mut self,
        asset: &str,
        current_score: f64,
        current_size: f64,
        threshold: f64,
        date: DateTime<Utc>,
    ) -> GraceAction {
        if current_score >= threshold {
            if let Some(grace) = self.positions.remove(asset) {
                let days_in_grace = (date - grace.start_date).num_days();
                info!(asset, days_in_grace, "score recovered, grace lifted");
                return GraceAction {
                    outcome: GraceOutcome::GraceRecovery,
                    // Size stays where decay left it; it is not restored.
                    new_size: current_size,
                    reason: format!(
                        "score recovered above threshold after {days_in_grace} days in grace"
                    ),
                    days_in_grace,
                };
            }
            return GraceAction {
                outcome: GraceOutcome::Hold,
                new_size: current_size,
                reason: format!("score above threshold: {current_score:.3} >= {threshold:.3}"),
                days_in_grace: 0,
            };
        }

        match self.positions.get_mut(asset) {
            None => {
                let reason =
                    format!("score below threshold: {current_score:.3} < {threshold:.3}");
                self.positions.insert(
                    asset.to_string(),
                    GracePosition {
                        asset: asset.to_string(),
                        start_date: date,
                        original_size: current_size,
                        original_score: current_score,
                        current_size,
                        decay_applied: 0.0,
                        reason: reason.clone(),
                    },
                );
                debug!(asset, current_score, "grace period started");
                GraceAction {
                    outcome: GraceOutcome::GraceStart,
                    new_size: current_size,
                    reason: format!("starting grace period: {reason}"),
                    days_in_grace: 0,
                }
            }
            Some(grace) => {
                let days_in_grace = (date - grace.start_date).num_days();
                if days_in_grace >= self.grace_period_days {
                    self.positions.remove(asset);
                    info!(asset, days_in_grace, "grace expired, forcing closure");
                    return GraceAction {
                        outcome: GraceOutcome::ForceClose,
                        new_size: 0.0,
                        reason: format!(
                            "grace period expired after {days_in_grace} days, forcing closure \
                             (score still {current_score:.3})"
                        ),
                        days_in_grace,
                    };
                }

                let new_size =
                    decayed_size(grace.original_size, self.decay_rate, self.min_decay_factor, days_in_grace);
                grace.current_size = new_size;
                grace.decay_applied = grace.original_size - new_size;
                GraceAction {
                    outcome: GraceOutcome::GraceDecay,
                    new_size,
                    reason: format!(
                        "grace day {days_in_grace}/{}: size decaying to {new_size:.4}",
                        self.grace_period_days
                    ),
                    days_in_grace,
                }
            }
        }
    }

    /// Whether the asset is in grace. With a date, an expired grace window
    /// counts as not in grace even before the next evaluation removes it.
    pub fn is_in_grace(&self, asset: &str, date: Option<DateTime<Utc>>) -> bool {
        match (self.positions.get(asset), date) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(grace), Some(date)) => {
                (date - grace.start_date).num_days() < self.grace_period_days
            }
        }
    }

    pub fn grace_position(&self, asset: &str) -> Option<&GracePosition> {
        self.positions.get(asset)
    }

    /// Drop grace tracking for an asset (position closed externally).
    pub fn remove(&mut self, asset: &str) -> Option<GracePosition> {
        self.positions.remove(asset)
    }

    pub fn status(&self, asset: &str, date: DateTime<Utc>) -> Option<GraceStatus> {
        self.positions.get(asset).map(|grace| {
            let days_in_grace = (date - grace.start_date).num_days();
            GraceStatus {
                asset: grace.asset.clone(),
                start_date: grace.start_date,
                days_in_grace,
                days_remaining: (self.grace_period_days - days_in_grace).max(0),
                original_size: grace.original_size,
                current_size: grace.current_size,
            }
        })
    }

    pub fn tracked_assets(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    /// Drop entries whose grace window has fully expired. Incumbents are
    /// always evaluated before this runs, so anything still here past its
    /// window belongs to an asset that already left the portfolio.
    pub fn prune_expired(&mut self, date: DateTime<Utc>) {
        let window = self.grace_period_days;
        self.positions
            .retain(|_, grace| (date - grace.start_date).num_days() < window);
    }
}

/// Deterministic exponential decay with a floor:
/// `original * max(decay_rate^days, min_decay_factor)`.
fn decayed_size(original: f64, decay_rate: f64, min_decay_factor: f64, days: i64) -> f64 {
    let factor = decay_rate.powi(days.max(0) as i32).max(min_decay_factor);
    // Round to avoid drifting float noise across repeated evaluations.
    (original * factor * 1e6).round() / 1e6
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    #[test]
    fn decay_sequence_is_deterministic_in_days() {
        let mut manager = GracePeriodManager::new(5, 0.8, 0.1);

        let start = manager.handle_underperformer("QQQ", 0.55, 0.10, 0.60, day(0));
        assert_eq!(start.outcome, GraceOutcome::GraceStart);
        assert!((start.new_size - 0.10).abs() < 1e-9);

        let expected = [0.08, 0.064, 0.0512, 0.04096];
        for (i, want) in expected.iter().enumerate() {
            let action = manager.handle_underperformer("QQQ", 0.55, 0.10, 0.60, day(i as i64 + 1));
            assert_eq!(action.outcome, GraceOutcome::GraceDecay);
            assert!(
                (action.new_size - want).abs() < 1e-9,
                "day {}: got {}, want {}",
                i + 1,
                action.new_size,
                want
            );
        }

        let closed = manager.handle_underperformer("QQQ", 0.55, 0.10, 0.60, day(5));
        assert_eq!(closed.outcome, GraceOutcome::ForceClose);
        assert!((closed.new_size - 0.0).abs() < 1e-12);
        assert!(!manager.is_in_grace("QQQ", Some(day(5))));
    }

    #[test]
    fn same_day_evaluation_does_not_compound_decay() {
        let mut manager = GracePeriodManager::new(5, 0.8, 0.1);
        manager.handle_underperformer("QQQ", 0.5, 0.10, 0.60, day(0));

        let first = manager.handle_underperformer("QQQ", 0.5, 0.10, 0.60, day(2));
        let second = manager.handle_underperformer("QQQ", 0.5, 0.10, 0.60, day(2));
        assert!((first.new_size - second.new_size).abs() < 1e-12);
        assert!((first.new_size - 0.064).abs() < 1e-9);
    }

    #[test]
    fn decay_floor_holds() {
        let mut manager = GracePeriodManager::new(30, 0.5, 0.1);
        manager.handle_underperformer("QQQ", 0.4, 0.2, 0.6, day(0));

        // 0.5^10 is far below the 0.1 floor.
        let action = manager.handle_underperformer("QQQ", 0.4, 0.2, 0.6, day(10));
        assert_eq!(action.outcome, GraceOutcome::GraceDecay);
        assert!((action.new_size - 0.2 * 0.1).abs() < 1e-9);
    }

    #[test]
    fn recovery_keeps_current_size() {
        let mut manager = GracePeriodManager::new(5, 0.8, 0.1);
        manager.handle_underperformer("QQQ", 0.5, 0.10, 0.60, day(0));
        manager.handle_underperformer("QQQ", 0.5, 0.10, 0.60, day(2));

        let recovered = manager.handle_underperformer("QQQ", 0.7, 0.064, 0.60, day(3));
        assert_eq!(recovered.outcome, GraceOutcome::GraceRecovery);
        // Size is not restored to the pre-grace original.
        assert!((recovered.new_size - 0.064).abs() < 1e-12);
        assert!(!manager.is_in_grace("QQQ", None));

        let hold = manager.handle_underperformer("QQQ", 0.7, 0.064, 0.60, day(4));
        assert_eq!(hold.outcome, GraceOutcome::Hold);
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let mut manager = GracePeriodManager::new(5, 0.8, 0.1);
        manager.handle_underperformer("OLD", 0.5, 0.10, 0.60, day(0));
        manager.handle_underperformer("FRESH", 0.5, 0.10, 0.60, day(3));

        manager.prune_expired(day(5));
        assert!(!manager.is_in_grace("OLD", None));
        assert!(manager.is_in_grace("FRESH", None));
    }

    #[test]
    fn expired_window_reports_not_in_grace_before_evaluation() {
        let mut manager = GracePeriodManager::new(5, 0.8, 0.1);
        manager.handle_underperformer("QQQ", 0.5, 0.10, 0.60, day(0));
        assert!(manager.is_in_grace("QQQ", Some(day(4))));
        assert!(!manager.is_in_grace("QQQ", Some(day(5))));
        // Without a date, registry membership is enough.
        assert!(manager.is_in_grace("QQQ", None));
    }
}
