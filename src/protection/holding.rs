// =============================================================================
// Holding period manager — minimum and maximum position age constraints
// =============================================================================
//
// Positions respect timing constraints:
//   - A close or reduce is denied before `min_holding_days` have passed.
//   - Increases are always permitted.
//   - Past `max_holding_days` the position is flagged for forced review.
//
// A regime transition of sufficient severity can override the minimum, but
// only within two days of meeting it, and at most once per cooldown window
// per asset.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::protection::regime_context::RegimeContext;
use crate::types::TransitionSeverity;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Age and adjustment bookkeeping for one tracked position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionAge {
    pub asset: String,
    pub entry_date: DateTime<Utc>,
    pub entry_size: f64,
    pub entry_reason: String,
    pub last_adjustment_date: Option<DateTime<Utc>>,
    pub adjustment_count: u32,
}

/// Kind of mutation being vetted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentKind {
    Close,
    Reduce,
    Increase,
    Any,
}

impl AdjustmentKind {
    fn shrinks_position(self) -> bool {
        matches!(self, Self::Close | Self::Reduce)
    }
}

/// Verdict of a holding period check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingDecision {
    pub allowed: bool,
    pub reason: String,
    /// True when a regime override unlocked an otherwise denied adjustment.
    pub override_applied: bool,
    /// True when the position has exceeded the maximum holding period.
    pub forced_review: bool,
}

impl HoldingDecision {
    fn allow(reason: String) -> Self {
        Self {
            allowed: true,
            reason,
            override_applied: false,
            forced_review: false,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
            override_applied: false,
            forced_review: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Maximum days short of the minimum holding period at which a regime
/// override may still be granted.
const OVERRIDE_PROXIMITY_DAYS: i64 = 2;

pub struct HoldingPeriodManager {
    min_holding_days: i64,
    max_holding_days: i64,
    enable_regime_overrides: bool,
    regime_override_cooldown_days: i64,
    position_ages: BTreeMap<String, PositionAge>,
    last_regime_override: BTreeMap<String, DateTime<Utc>>,
}

impl HoldingPeriodManager {
    pub fn new(
        min_holding_days: i64,
        max_holding_days: i64,
        enable_regime_overrides: bool,
        regime_override_cooldown_days: i64,
    ) -> Self {
        Self {
            min_holding_days,
            max_holding_days,
            enable_regime_overrides,
            regime_override_cooldown_days,
            position_ages: BTreeMap::new(),
            last_regime_override: BTreeMap::new(),
        }
    }

    /// Check whether a position can be adjusted on `date`.
    ///
    /// Mutates the override registry when a regime override is granted, so
    /// the cooldown starts counting from this date.
    pub fn can_adjust(
        &mut self,
        asset: &str,
        date: DateTime<Utc>,
        regime_context: Option<&RegimeContext>,
        kind: AdjustmentKind,
    ) -> HoldingDecision {
        let Some(age) = self.position_ages.get(asset) else {
            return HoldingDecision::allow("new position, no holding period constraints".into());
        };

        let days_held = (date - age.entry_date).num_days();

        if days_held < self.min_holding_days {
            if kind.shrinks_position() {
                let denial = format!(
                    "min holding period not met: {days_held}/{} days",
                    self.min_holding_days
                );
                if let Some(ctx) = regime_context {
                    if self.enable_regime_overrides && ctx.regime_changed {
                        match self.regime_override_verdict(asset, date, days_held, ctx) {
                            Ok(override_reason) => {
                                self.last_regime_override.insert(asset.to_string(), date);
                                info!(asset, %override_reason, "holding period regime override");
                                return HoldingDecision {
                                    allowed: true,
                                    reason: format!("regime override: {override_reason}"),
                                    override_applied: true,
                                    forced_review: false,
                                };
                            }
                            Err(blocked) => {
                                debug!(asset, %blocked, "regime override unavailable");
                            }
                        }
                    }
                }
                return HoldingDecision::deny(denial);
            }
            if kind == AdjustmentKind::Increase {
                return HoldingDecision::allow(format!(
                    "position increase allowed (held {days_held} days)"
                ));
            }
        }

        if days_held >= self.max_holding_days {
            return HoldingDecision {
                allowed: true,
                reason: format!(
                    "max holding period reached: {days_held} days, forced review required"
                ),
                override_applied: false,
                forced_review: true,
            };
        }

        HoldingDecision::allow(format!(
            "within holding period: {days_held} days (min {}, max {})",
            self.min_holding_days, self.max_holding_days
        ))
    }

    /// Decide whether a regime change justifies overriding the minimum.
    fn regime_override_verdict(
        &self,
        asset: &str,
        date: DateTime<Utc>,
        days_held: i64,
        ctx: &RegimeContext,
    ) -> Result<String, String> {
        // A grant earlier today is the same override, not a new one.
        if let Some(last) = self.last_regime_override.get(asset) {
            let days_since = (date - *last).num_days();
            if days_since > 0 && days_since < self.regime_override_cooldown_days {
                return Err(format!(
                    "override cooldown active: {days_since}/{} days since last override",
                    self.regime_override_cooldown_days
                ));
            }
        }

        let Some(transition) = ctx.recent_transition.as_ref() else {
            return Err("no recent regime transition".into());
        };
        if transition.severity == TransitionSeverity::Normal {
            return Err("transition severity normal, not significant enough".into());
        }

        let days_remaining = self.min_holding_days - days_held;
        if days_remaining > OVERRIDE_PROXIMITY_DAYS {
            return Err(format!(
                "too far from min holding period: {days_remaining} days remaining"
            ));
        }

        Ok(format!(
            "{} -> {} transition (severity: {}) overrides holding period",
            transition.from, transition.to, transition.severity
        ))
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    pub fn record_entry(
        &mut self,
        asset: &str,
        entry_date: DateTime<Utc>,
        entry_size: f64,
        entry_reason: &str,
    ) {
        debug!(asset, entry_size, "position entry recorded");
        self.position_ages.insert(
            asset.to_string(),
            PositionAge {
                asset: asset.to_string(),
                entry_date,
                entry_size,
                entry_reason: entry_reason.to_string(),
                last_adjustment_date: None,
                adjustment_count: 0,
            },
        );
    }

    pub fn record_adjustment(&mut self, asset: &str, date: DateTime<Utc>) {
        if let Some(age) = self.position_ages.get_mut(asset) {
            age.last_adjustment_date = Some(date);
            age.adjustment_count += 1;
        }
    }

    pub fn record_closure(&mut self, asset: &str, date: DateTime<Utc>) -> Option<PositionAge> {
        let age = self.position_ages.remove(asset);
        if let Some(age) = &age {
            debug!(
                asset,
                days_held = (date - age.entry_date).num_days(),
                "position closure recorded"
            );
        }
        age
    }

    pub fn entry_date(&self, asset: &str) -> Option<DateTime<Utc>> {
        self.position_ages.get(asset).map(|age| age.entry_date)
    }

    pub fn position_age(&self, asset: &str) -> Option<&PositionAge> {
        self.position_ages.get(asset)
    }

    pub fn days_held(&self, asset: &str, date: DateTime<Utc>) -> i64 {
        self.position_ages
            .get(asset)
            .map(|age| (date - age.entry_date).num_days())
            .unwrap_or(0)
    }

    pub fn should_force_review(&self, asset: &str, date: DateTime<Utc>) -> bool {
        self.days_held(asset, date) >= self.max_holding_days && self.position_ages.contains_key(asset)
    }

    /// Tracked assets that can take the given adjustment today.
    pub fn eligible_for_adjustment(
        &mut self,
        assets: &[String],
        date: DateTime<Utc>,
        kind: AdjustmentKind,
    ) -> Vec<String> {
        assets
            .iter()
            .filter(|asset| self.can_adjust(asset, date, None, kind).allowed)
            .cloned()
            .collect()
    }

    /// Drop override stamps older than the cooldown window.
    pub fn prune_override_stamps(&mut self, date: DateTime<Utc>) {
        let cooldown = self.regime_override_cooldown_days;
        self.last_regime_override
            .retain(|_, stamp| (date - *stamp).num_days() < cooldown);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::regime_context::RegimeContext;
    use crate::types::{Regime, RegimeState, RegimeTransition, TransitionSeverity};
    use chrono::{Duration, TimeZone};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn ctx_with_severity(severity: TransitionSeverity, date: DateTime<Utc>) -> RegimeContext {
        RegimeContext::for_transition(
            date,
            RegimeState::new(Regime::Deflation, date),
            Some(RegimeTransition {
                from: Regime::Goldilocks,
                to: Regime::Deflation,
                date,
                severity,
                momentum: 0.8,
                confidence: 0.9,
                triggers: vec!["growth".into()],
            }),
            TransitionSeverity::High,
        )
    }

    fn manager() -> HoldingPeriodManager {
        let mut m = HoldingPeriodManager::new(3, 90, true, 30);
        m.record_entry("AAPL", day(0), 0.1, "test entry");
        m
    }

    #[test]
    fn untracked_positions_are_unconstrained() {
        let mut m = HoldingPeriodManager::new(3, 90, true, 30);
        let decision = m.can_adjust("ZZZ", day(0), None, AdjustmentKind::Close);
        assert!(decision.allowed);
    }

    #[test]
    fn close_denied_before_min_holding() {
        let mut m = manager();
        let decision = m.can_adjust("AAPL", day(1), None, AdjustmentKind::Close);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("min holding period"));

        let decision = m.can_adjust("AAPL", day(3), None, AdjustmentKind::Close);
        assert!(decision.allowed);
    }

    #[test]
    fn increase_always_allowed() {
        let mut m = manager();
        let decision = m.can_adjust("AAPL", day(1), None, AdjustmentKind::Increase);
        assert!(decision.allowed);
    }

    #[test]
    fn max_holding_flags_forced_review() {
        let mut m = manager();
        let decision = m.can_adjust("AAPL", day(90), None, AdjustmentKind::Any);
        assert!(decision.allowed);
        assert!(decision.forced_review);
        assert!(m.should_force_review("AAPL", day(90)));
    }

    #[test]
    fn high_severity_transition_overrides_near_minimum() {
        let mut m = manager();
        // Held 2 days, 1 day short of the minimum.
        let ctx = ctx_with_severity(TransitionSeverity::High, day(2));
        let decision = m.can_adjust("AAPL", day(2), Some(&ctx), AdjustmentKind::Close);
        assert!(decision.allowed, "{}", decision.reason);
        assert!(decision.override_applied);
    }

    #[test]
    fn normal_severity_cannot_override() {
        let mut m = manager();
        let ctx = ctx_with_severity(TransitionSeverity::Normal, day(2));
        let decision = m.can_adjust("AAPL", day(2), Some(&ctx), AdjustmentKind::Close);
        assert!(!decision.allowed);
    }

    #[test]
    fn override_denied_far_from_minimum() {
        let mut m = HoldingPeriodManager::new(10, 90, true, 30);
        m.record_entry("AAPL", day(0), 0.1, "test");
        // Held 2 days, 8 days short of a 10 day minimum.
        let ctx = ctx_with_severity(TransitionSeverity::Critical, day(2));
        let decision = m.can_adjust("AAPL", day(2), Some(&ctx), AdjustmentKind::Close);
        assert!(!decision.allowed);
    }

    #[test]
    fn override_cooldown_blocks_second_grant() {
        let mut m = manager();
        let ctx = ctx_with_severity(TransitionSeverity::High, day(2));
        assert!(m.can_adjust("AAPL", day(2), Some(&ctx), AdjustmentKind::Close).allowed);

        // Same-day recheck is the same grant, not a new one.
        let same_day = m.can_adjust("AAPL", day(2), Some(&ctx), AdjustmentKind::Close);
        assert!(same_day.allowed);

        // Re-enter a position and try again inside the cooldown window.
        m.record_entry("AAPL", day(5), 0.1, "re-entry");
        let ctx = ctx_with_severity(TransitionSeverity::High, day(6));
        let decision = m.can_adjust("AAPL", day(6), Some(&ctx), AdjustmentKind::Close);
        assert!(!decision.allowed);
        assert!(!decision.override_applied);
    }

    #[test]
    fn closure_clears_tracking() {
        let mut m = manager();
        m.record_adjustment("AAPL", day(4));
        assert_eq!(m.position_age("AAPL").unwrap().adjustment_count, 1);
        let age = m.record_closure("AAPL", day(5)).unwrap();
        assert_eq!(age.asset, "AAPL");
        assert!(m.entry_date("AAPL").is_none());
    }

    #[test]
    fn stale_override_stamps_are_pruned() {
        let mut m = manager();
        let ctx = ctx_with_severity(TransitionSeverity::High, day(2));
        assert!(m.can_adjust("AAPL", day(2), Some(&ctx), AdjustmentKind::Close).allowed);
        m.prune_override_stamps(day(40));
        assert!(m.last_regime_override.is_empty());
    }
}
