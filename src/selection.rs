// =============================================================================
// Selection service — lifecycle-aware portfolio selection
// =============================================================================
//
// Turns scored assets into the kept selection plus close directives, running
// the lifecycle pre-filters in order:
//
//   1. Grace periods    — incumbents below the keep threshold decay instead
//                         of closing; expired grace forces closure. Core
//                         assets are exempt and simply hold.
//   2. Holding periods  — with grace disabled, a below-threshold close must
//                         clear the minimum holding period (or a regime
//                         override).
//   3. Whipsaw          — new candidates at the cycle limit are blocked.
//
// Grace-decayed and protection-held incumbents carry a pinned weight: they
// bypass the sizers so the decay sequence stays exact.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::RebalancePolicy;
use crate::events::{EventSink, PortfolioEvent};
use crate::protection::core_assets::CoreAssetManager;
use crate::protection::grace::{GraceOutcome, GracePeriodManager};
use crate::protection::holding::{AdjustmentKind, HoldingPeriodManager};
use crate::protection::regime_context::RegimeContext;
use crate::protection::whipsaw::WhipsawProtectionManager;
use crate::scoring::AssetScore;
use crate::sizing::SizedAsset;
use crate::types::{AssetPriority, RebalancingTarget, TargetAction};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Asset that survived selection. A pinned weight bypasses the sizers.
#[derive(Debug, Clone)]
pub struct SelectedAsset {
    pub score: AssetScore,
    pub pinned_weight: Option<f64>,
    pub reason: String,
}

/// Incumbent to be closed, with the close reason.
#[derive(Debug, Clone)]
pub struct CloseDirective {
    pub asset: String,
    pub current_weight: f64,
    pub score: f64,
    pub reason: String,
}

/// Selection outcome: what to keep, what to close.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub kept: Vec<SelectedAsset>,
    pub closes: Vec<CloseDirective>,
}

impl Selection {
    pub fn kept_count(&self) -> usize {
        self.kept.len()
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SelectionService;

impl SelectionService {
    pub fn new() -> Self {
        Self
    }

    /// Apply lifecycle pre-filters and slot limits to the scored universe.
    #[allow(clippy::too_many_arguments)]
    pub fn select(
        &self,
        scored: Vec<AssetScore>,
        policy: &RebalancePolicy,
        current_positions: &HashMap<String, f64>,
        date: DateTime<Utc>,
        ctx: &RegimeContext,
        grace: &mut GracePeriodManager,
        holding: &mut HoldingPeriodManager,
        whipsaw: &WhipsawProtectionManager,
        core: &CoreAssetManager,
        sink: &dyn EventSink,
    ) -> Selection {
        let mut selection = Selection::default();
        let (incumbents, newcomers): (Vec<_>, Vec<_>) = scored
            .into_iter()
            .partition(|s| s.priority == AssetPriority::Portfolio);

        for score in incumbents {
            self.select_incumbent(
                score,
                policy,
                current_positions,
                date,
                ctx,
                grace,
                holding,
                core,
                sink,
                &mut selection,
            );
        }

        self.select_newcomers(newcomers, policy, date, whipsaw, sink, &mut selection);

        info!(
            kept = selection.kept.len(),
            closes = selection.closes.len(),
            "selection complete"
        );
        selection
    }

    #[allow(clippy::too_many_arguments)]
    fn select_incumbent(
        &self,
        score: AssetScore,
        policy: &RebalancePolicy,
        current_positions: &HashMap<String, f64>,
        date: DateTime<Utc>,
        ctx: &RegimeContext,
        grace: &mut GracePeriodManager,
        holding: &mut HoldingPeriodManager,
        core: &CoreAssetManager,
        sink: &dyn EventSink,
        selection: &mut Selection,
    ) {
        let asset = score.asset.clone();
        let current_weight = current_positions
            .get(&asset)
            .copied()
            .unwrap_or(score.previous_allocation);
        let below_threshold = score.combined < policy.min_score_threshold;

        if below_threshold {
            sink.emit(
                PortfolioEvent::new(
                    date,
                    "scoring.threshold_breach",
                    "breach",
                    format!(
                        "incumbent {} scored {:.3} below keep threshold {:.3}",
                        asset, score.combined, policy.min_score_threshold
                    ),
                )
                .asset(&asset)
                .scores(None, Some(score.combined)),
            );
        }

        // Core assets never close on score weakness; they hold at weight.
        if core.should_exempt_from_grace(&asset, date) {
            if below_threshold {
                selection.kept.push(SelectedAsset {
                    reason: format!("core asset immunity holds {asset} despite weak score"),
                    score,
                    pinned_weight: Some(current_weight),
                });
            } else {
                selection.kept.push(SelectedAsset {
                    reason: format!("core asset, score {:.3}", score.combined),
                    score,
                    pinned_weight: None,
                });
            }
            return;
        }

        if policy.enable_grace_periods {
            let action = grace.handle_underperformer(
                &asset,
                score.combined,
                current_weight,
                policy.min_score_threshold,
                date,
            );
            match action.outcome {
                GraceOutcome::Hold => selection.kept.push(SelectedAsset {
                    reason: format!(
                        "portfolio: score {:.3} >= {:.3}",
                        score.combined, policy.min_score_threshold
                    ),
                    score,
                    pinned_weight: None,
                }),
                GraceOutcome::GraceRecovery => {
                    sink.emit(
                        PortfolioEvent::new(
                            date,
                            "protection.grace_end",
                            "recover",
                            action.reason.clone(),
                        )
                        .asset(&asset)
                        .sizes(Some(current_weight), Some(action.new_size)),
                    );
                    selection.kept.push(SelectedAsset {
                        reason: format!("grace recovery: {}", action.reason),
                        score,
                        pinned_weight: None,
                    });
                }
                GraceOutcome::GraceStart => {
                    sink.emit(
                        PortfolioEvent::new(
                            date,
                            "protection.grace_start",
                            "block",
                            action.reason.clone(),
                        )
                        .asset(&asset)
                        .scores(None, Some(score.combined))
                        .sizes(Some(current_weight), Some(action.new_size)),
                    );
                    selection.kept.push(SelectedAsset {
                        reason: action.reason,
                        score,
                        pinned_weight: Some(action.new_size),
                    });
                }
                GraceOutcome::GraceDecay => {
                    sink.emit(
                        PortfolioEvent::new(
                            date,
                            "portfolio.position_decay",
                            "decay",
                            action.reason.clone(),
                        )
                        .asset(&asset)
                        .sizes(Some(current_weight), Some(action.new_size))
                        .meta("days_in_grace", action.days_in_grace),
                    );
                    selection.kept.push(SelectedAsset {
                        reason: action.reason,
                        score,
                        pinned_weight: Some(action.new_size),
                    });
                }
                GraceOutcome::ForceClose => {
                    sink.emit(
                        PortfolioEvent::new(
                            date,
                            "protection.grace_end",
                            "force_close",
                            action.reason.clone(),
                        )
                        .asset(&asset)
                        .sizes(Some(current_weight), Some(0.0)),
                    );
                    selection.closes.push(CloseDirective {
                        asset,
                        current_weight,
                        score: score.combined,
                        reason: action.reason,
                    });
                }
            }
            return;
        }

        // Grace disabled: weak incumbents close, subject to holding periods.
        if !below_threshold {
            selection.kept.push(SelectedAsset {
                reason: format!(
                    "portfolio: score {:.3} >= {:.3}",
                    score.combined, policy.min_score_threshold
                ),
                score,
                pinned_weight: None,
            });
            return;
        }

        let decision = holding.can_adjust(&asset, date, Some(ctx), AdjustmentKind::Close);
        if decision.allowed {
            if decision.override_applied {
                sink.emit(
                    PortfolioEvent::new(
                        date,
                        "protection.override_applied",
                        "override",
                        decision.reason.clone(),
                    )
                    .asset(&asset)
                    .regime(ctx.current_regime.regime)
                    .meta("overridden_system", "holding_period"),
                );
            }
            selection.closes.push(CloseDirective {
                asset,
                current_weight,
                score: score.combined,
                reason: format!(
                    "score {:.3} below {:.3} ({})",
                    score.combined, policy.min_score_threshold, decision.reason
                ),
            });
        } else {
            sink.emit(
                PortfolioEvent::new(
                    date,
                    "protection.holding_period_block",
                    "block",
                    decision.reason.clone(),
                )
                .asset(&asset),
            );
            selection.kept.push(SelectedAsset {
                reason: format!("held by holding period: {}", decision.reason),
                score,
                pinned_weight: Some(current_weight),
            });
        }
    }

    fn select_newcomers(
        &self,
        newcomers: Vec<AssetScore>,
        policy: &RebalancePolicy,
        date: DateTime<Utc>,
        whipsaw: &WhipsawProtectionManager,
        sink: &dyn EventSink,
        selection: &mut Selection,
    ) {
        let open_slots = policy
            .max_total_positions
            .saturating_sub(selection.kept.len())
            .min(policy.max_new_positions);

        let mut qualified: Vec<AssetScore> = Vec::new();
        for score in newcomers {
            if score.combined < policy.min_score_new_position {
                continue;
            }
            if policy.enable_whipsaw_protection {
                let (can_open, reason) = whipsaw.can_open(&score.asset, date);
                if !can_open {
                    debug!(asset = %score.asset, %reason, "newcomer blocked by whipsaw");
                    sink.emit(
                        PortfolioEvent::new(date, "protection.whipsaw_block", "block", reason)
                            .asset(&score.asset)
                            .scores(None, Some(score.combined)),
                    );
                    continue;
                }
            }
            qualified.push(score);
        }

        qualified.sort_by(|a, b| {
            b.combined
                .partial_cmp(&a.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.asset.cmp(&b.asset))
        });

        for score in qualified.into_iter().take(open_slots) {
            selection.kept.push(SelectedAsset {
                reason: format!(
                    "new position: score {:.3} >= {:.3}",
                    score.combined, policy.min_score_new_position
                ),
                score,
                pinned_weight: None,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Target materialisation
// ---------------------------------------------------------------------------

/// Materialise final targets from sized assets plus close directives.
/// Every current position ends up in exactly one target.
pub fn build_targets(
    sized: Vec<SizedAsset>,
    closes: &[CloseDirective],
    current_positions: &HashMap<String, f64>,
) -> Vec<RebalancingTarget> {
    let mut targets: Vec<RebalancingTarget> = Vec::with_capacity(sized.len() + closes.len());

    for asset in sized {
        let current = current_positions
            .get(asset.asset())
            .copied()
            .unwrap_or(0.0);
        let action = RebalancingTarget::classify_action(current, asset.weight);
        let reason = if asset.sizing_reason.is_empty() {
            asset.score.reason.clone()
        } else {
            format!("{} | {}", asset.score.reason, asset.sizing_reason)
        };
        targets.push(RebalancingTarget {
            asset: asset.score.asset.clone(),
            target_weight: asset.weight,
            current_weight: current,
            action,
            priority: asset.score.priority,
            score: asset.score.combined,
            reason,
        });
    }

    for close in closes {
        targets.push(RebalancingTarget {
            asset: close.asset.clone(),
            target_weight: 0.0,
            current_weight: close.current_weight,
            action: TargetAction::Close,
            priority: AssetPriority::Portfolio,
            score: close.score,
            reason: close.reason.clone(),
        });
    }

    // Incumbents that fell out of sizing entirely still need a close target.
    let mut covered: Vec<&str> = targets.iter().map(|t| t.asset.as_str()).collect();
    covered.sort_unstable();
    let mut leftovers: Vec<(&String, &f64)> = current_positions
        .iter()
        .filter(|(asset, weight)| **weight > 0.0 && covered.binary_search(&asset.as_str()).is_err())
        .collect();
    leftovers.sort_by_key(|(asset, _)| asset.as_str());
    for (asset, weight) in leftovers {
        targets.push(RebalancingTarget {
            asset: asset.clone(),
            target_weight: 0.0,
            current_weight: *weight,
            action: TargetAction::Close,
            priority: AssetPriority::Portfolio,
            score: 0.0,
            reason: "asset not selected in rebalancing".to_string(),
        });
    }

    targets
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::BucketManager;
    use crate::events::{MemoryEventSink, NullEventSink};
    use crate::protection::whipsaw::PositionEventKind;
    use crate::sizing::SizeCategory;
    use crate::types::{Regime, RegimeState};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn policy() -> RebalancePolicy {
        RebalancePolicy::default()
    }

    fn ctx(date: DateTime<Utc>) -> RegimeContext {
        RegimeContext::quiet(date, RegimeState::new(Regime::Goldilocks, date))
    }

    struct Managers {
        grace: GracePeriodManager,
        holding: HoldingPeriodManager,
        whipsaw: WhipsawProtectionManager,
        core: CoreAssetManager,
    }

    fn managers() -> Managers {
        Managers {
            grace: GracePeriodManager::new(5, 0.8, 0.1),
            holding: HoldingPeriodManager::new(3, 90, true, 30),
            whipsaw: WhipsawProtectionManager::new(1, 14, 4),
            core: CoreAssetManager::new(true, 3, 90, 2, 0.15, 30, 7),
        }
    }

    fn incumbent(asset: &str, combined: f64, weight: f64) -> AssetScore {
        let mut s = AssetScore::stub(asset, day(0), Regime::Goldilocks, AssetPriority::Portfolio, combined);
        s.previous_allocation = weight;
        s.is_current_position = true;
        s
    }

    fn newcomer(asset: &str, combined: f64) -> AssetScore {
        AssetScore::stub(asset, day(0), Regime::Goldilocks, AssetPriority::Trending, combined)
    }

    #[test]
    fn weak_incumbent_enters_grace_with_pinned_weight() {
        let mut m = managers();
        let positions = HashMap::from([("AAPL".to_string(), 0.10)]);
        let sink = MemoryEventSink::new();

        let selection = SelectionService::new().select(
            vec![incumbent("AAPL", 0.55, 0.10)],
            &policy(),
            &positions,
            day(0),
            &ctx(day(0)),
            &mut m.grace,
            &mut m.holding,
            &m.whipsaw,
            &m.core,
            &sink,
        );

        assert_eq!(selection.kept.len(), 1);
        assert_eq!(selection.kept[0].pinned_weight, Some(0.10));
        assert_eq!(sink.events_of_type("protection.grace_start").len(), 1);
        assert_eq!(sink.events_of_type("scoring.threshold_breach").len(), 1);
    }

    #[test]
    fn whipsaw_blocks_newcomer_at_cycle_limit() {
        let mut m = managers();
        m.whipsaw
            .record_event("SOL", PositionEventKind::Open, day(0), 0.1, "e", None);
        m.whipsaw
            .record_event("SOL", PositionEventKind::Close, day(1), 0.1, "x", None);

        let sink = MemoryEventSink::new();
        let selection = SelectionService::new().select(
            vec![newcomer("SOL", 0.9)],
            &policy(),
            &HashMap::new(),
            day(2),
            &ctx(day(2)),
            &mut m.grace,
            &mut m.holding,
            &m.whipsaw,
            &m.core,
            &sink,
        );

        assert!(selection.kept.is_empty());
        assert_eq!(sink.events_of_type("protection.whipsaw_block").len(), 1);
    }

    #[test]
    fn newcomer_slots_are_limited_and_score_ordered() {
        let mut m = managers();
        let mut p = policy();
        p.max_new_positions = 2;

        let selection = SelectionService::new().select(
            vec![newcomer("A", 0.70), newcomer("B", 0.90), newcomer("C", 0.80)],
            &p,
            &HashMap::new(),
            day(0),
            &ctx(day(0)),
            &mut m.grace,
            &mut m.holding,
            &m.whipsaw,
            &m.core,
            &NullEventSink,
        );

        let kept: Vec<&str> = selection.kept.iter().map(|s| s.score.asset.as_str()).collect();
        assert_eq!(kept, vec!["B", "C"]);
    }

    #[test]
    fn below_new_position_threshold_is_ignored() {
        let mut m = managers();
        let selection = SelectionService::new().select(
            vec![newcomer("A", 0.64)],
            &policy(),
            &HashMap::new(),
            day(0),
            &ctx(day(0)),
            &mut m.grace,
            &mut m.holding,
            &m.whipsaw,
            &m.core,
            &NullEventSink,
        );
        assert!(selection.kept.is_empty());
    }

    #[test]
    fn grace_disabled_weak_incumbent_closes_after_min_holding() {
        let mut m = managers();
        m.holding.record_entry("AAPL", day(0), 0.10, "entry");
        let mut p = policy();
        p.enable_grace_periods = false;

        let positions = HashMap::from([("AAPL".to_string(), 0.10)]);

        // Day 1: holding period blocks the close, position held at weight.
        let sink = MemoryEventSink::new();
        let selection = SelectionService::new().select(
            vec![incumbent("AAPL", 0.5, 0.10)],
            &p,
            &positions,
            day(1),
            &ctx(day(1)),
            &mut m.grace,
            &mut m.holding,
            &m.whipsaw,
            &m.core,
            &sink,
        );
        assert_eq!(selection.kept.len(), 1);
        assert_eq!(selection.kept[0].pinned_weight, Some(0.10));
        assert_eq!(sink.events_of_type("protection.holding_period_block").len(), 1);

        // Day 4: past the minimum, the close goes through.
        let selection = SelectionService::new().select(
            vec![incumbent("AAPL", 0.5, 0.10)],
            &p,
            &positions,
            day(4),
            &ctx(day(4)),
            &mut m.grace,
            &mut m.holding,
            &m.whipsaw,
            &m.core,
            &NullEventSink,
        );
        assert_eq!(selection.closes.len(), 1);
        assert_eq!(selection.closes[0].asset, "AAPL");
    }

    #[test]
    fn core_incumbent_never_closes_on_weak_score() {
        let mut m = managers();
        let buckets = BucketManager::new(BTreeMap::new());
        m.core.mark_as_core("AAPL", day(0), "test", None, &buckets);
        let positions = HashMap::from([("AAPL".to_string(), 0.10)]);

        let selection = SelectionService::new().select(
            vec![incumbent("AAPL", 0.3, 0.10)],
            &policy(),
            &positions,
            day(1),
            &ctx(day(1)),
            &mut m.grace,
            &mut m.holding,
            &m.whipsaw,
            &m.core,
            &NullEventSink,
        );

        assert!(selection.closes.is_empty());
        assert_eq!(selection.kept[0].pinned_weight, Some(0.10));
        // The core asset never entered grace.
        assert!(!m.grace.is_in_grace("AAPL", None));
    }

    #[test]
    fn build_targets_covers_every_incumbent_exactly_once() {
        let positions = HashMap::from([
            ("KEEP".to_string(), 0.10),
            ("CLOSED".to_string(), 0.20),
            ("DROPPED".to_string(), 0.05),
        ]);
        let sized = vec![SizedAsset::new(
            incumbent("KEEP", 0.8, 0.10),
            0.12,
            SizeCategory::Standard,
            "sized".to_string(),
        )];
        let closes = vec![CloseDirective {
            asset: "CLOSED".to_string(),
            current_weight: 0.20,
            score: 0.4,
            reason: "weak".to_string(),
        }];

        let targets = build_targets(sized, &closes, &positions);
        assert_eq!(targets.len(), 3);

        let by_asset: HashMap<&str, &RebalancingTarget> =
            targets.iter().map(|t| (t.asset.as_str(), t)).collect();
        assert_eq!(by_asset["KEEP"].action, TargetAction::Increase);
        assert_eq!(by_asset["CLOSED"].action, TargetAction::Close);
        assert_eq!(by_asset["DROPPED"].action, TargetAction::Close);
        assert!(by_asset["DROPPED"].reason.contains("not selected"));
    }
}
