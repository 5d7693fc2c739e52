// =============================================================================
// Two-stage position sizer — strict caps with residual management
// =============================================================================
//
// Operates on already-sized assets with a possibly stricter cap than the
// first pass:
//
//   Stage 1: cap every position at max_single_position; split the selection
//            into capped and uncapped.
//   Stage 2: scale the uncapped positions so capped + uncapped hits the
//            target; re-cap anything the scaling pushed over.
//   Stage 3: place whatever is still unallocated using the configured
//            residual strategy (top-slice, proportional, or a synthetic
//            cash position).
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scoring::AssetScore;
use crate::sizing::dynamic::{SizeCategory, SizedAsset, ALLOCATION_GRAIN};
use crate::types::AssetPriority;

/// Synthetic asset used by the cash-bucket residual strategy.
pub const CASH_EQUIVALENT: &str = "CASH_EQUIVALENT";

/// Top-scoring uncapped positions considered by the safe top-slice strategy.
const TOP_SLICE_POSITIONS: usize = 3;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualStrategy {
    #[default]
    SafeTopSlice,
    Proportional,
    CashBucket,
}

impl std::fmt::Display for ResidualStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SafeTopSlice => write!(f, "safe_top_slice"),
            Self::Proportional => write!(f, "proportional"),
            Self::CashBucket => write!(f, "cash_bucket"),
        }
    }
}

/// Result of the two-stage pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoStageOutcome {
    pub assets: Vec<SizedAsset>,
    pub stage1_capped: usize,
    pub stage2_capped: usize,
    pub total_allocated: f64,
    pub residual_unallocated: f64,
    pub strategy_applied: Option<ResidualStrategy>,
}

// ---------------------------------------------------------------------------
// Sizer
// ---------------------------------------------------------------------------

pub struct TwoStagePositionSizer {
    max_single_position: f64,
    target_allocation: f64,
    residual_strategy: ResidualStrategy,
    max_residual_per_asset: f64,
}

impl TwoStagePositionSizer {
    pub fn new(
        max_single_position: f64,
        target_allocation: f64,
        residual_strategy: ResidualStrategy,
        max_residual_per_asset: f64,
    ) -> Self {
        Self {
            max_single_position,
            target_allocation,
            residual_strategy,
            max_residual_per_asset,
        }
    }

    pub fn apply(&self, mut assets: Vec<SizedAsset>) -> TwoStageOutcome {
        if assets.is_empty() {
            return TwoStageOutcome {
                assets,
                stage1_capped: 0,
                stage2_capped: 0,
                total_allocated: 0.0,
                residual_unallocated: 0.0,
                strategy_applied: None,
            };
        }

        // Stage 1: individual caps.
        let mut stage1_capped = 0;
        for asset in &mut assets {
            if asset.weight > self.max_single_position {
                asset.weight = self.max_single_position;
                asset.stage1_capped = true;
                stage1_capped += 1;
            }
        }

        // Stage 2: scale the uncapped cohort into the remaining budget.
        let capped_total: f64 = assets
            .iter()
            .filter(|a| a.stage1_capped)
            .map(|a| a.weight)
            .sum();
        let uncapped_total: f64 = assets
            .iter()
            .filter(|a| !a.stage1_capped)
            .map(|a| a.weight)
            .sum();
        let remaining = (self.target_allocation - capped_total).max(0.0);

        let mut stage2_capped = 0;
        if uncapped_total > 0.0 && remaining > 0.0 {
            let scale = remaining / uncapped_total;
            for asset in assets.iter_mut().filter(|a| !a.stage1_capped) {
                let scaled = asset.weight * scale;
                if scaled > self.max_single_position {
                    asset.weight = self.max_single_position;
                    asset.stage2_capped = true;
                    stage2_capped += 1;
                } else {
                    asset.weight = scaled;
                }
            }
        }

        // Stage 3: residual placement.
        let allocated: f64 = assets.iter().map(|a| a.weight).sum();
        let mut residual = (self.target_allocation - allocated).max(0.0);
        let mut strategy_applied = None;

        if residual > ALLOCATION_GRAIN {
            strategy_applied = Some(self.residual_strategy);
            residual = match self.residual_strategy {
                ResidualStrategy::SafeTopSlice => self.top_slice(&mut assets, residual),
                ResidualStrategy::Proportional => self.proportional(&mut assets, residual),
                ResidualStrategy::CashBucket => self.cash_bucket(&mut assets, residual),
            };
        }

        let total_allocated: f64 = assets.iter().map(|a| a.weight).sum();
        debug!(
            total_allocated,
            residual,
            stage1_capped,
            stage2_capped,
            "two-stage sizing complete"
        );

        TwoStageOutcome {
            assets,
            stage1_capped,
            stage2_capped,
            total_allocated,
            residual_unallocated: residual,
            strategy_applied,
        }
    }

    /// Spread residual across the top-scoring uncapped positions, bounded by
    /// the per-asset residual cap and the position cap.
    fn top_slice(&self, assets: &mut Vec<SizedAsset>, residual: f64) -> f64 {
        let mut uncapped: Vec<usize> = assets
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.stage1_capped && !a.stage2_capped && !a.is_cash_residual)
            .map(|(i, _)| i)
            .collect();

        if uncapped.is_empty() {
            // Everything is pinned at the cap; park the residual in cash.
            return self.cash_bucket(assets, residual);
        }

        uncapped.sort_by(|&a, &b| {
            assets[b]
                .score
                .combined
                .partial_cmp(&assets[a].score.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        uncapped.truncate(TOP_SLICE_POSITIONS);

        let per_position = residual / uncapped.len() as f64;
        let mut unplaced = residual;
        for index in uncapped {
            let asset = &mut assets[index];
            let headroom = self.max_single_position - asset.weight;
            let addition = per_position.min(headroom).min(self.max_residual_per_asset);
            if addition > ALLOCATION_GRAIN {
                asset.weight += addition;
                asset.residual_added += addition;
                unplaced -= addition;
            }
        }
        unplaced.max(0.0)
    }

    /// Spread residual proportionally to current weights, respecting caps.
    fn proportional(&self, assets: &mut [SizedAsset], residual: f64) -> f64 {
        let current_total: f64 = assets.iter().map(|a| a.weight).sum();
        if current_total <= 0.0 {
            return residual;
        }

        let mut unplaced = residual;
        for asset in assets.iter_mut() {
            let share = residual * asset.weight / current_total;
            let headroom = self.max_single_position - asset.weight;
            let addition = share.min(headroom);
            if addition > ALLOCATION_GRAIN {
                asset.weight += addition;
                asset.residual_added += addition;
                unplaced -= addition;
            }
        }
        unplaced.max(0.0)
    }

    /// Park the entire residual in a synthetic cash position.
    fn cash_bucket(&self, assets: &mut Vec<SizedAsset>, residual: f64) -> f64 {
        let template = &assets[0].score;
        let cash_score = AssetScore {
            asset: CASH_EQUIVALENT.to_string(),
            date: template.date,
            technical: 0.0,
            fundamental: 0.0,
            combined: 0.0,
            confidence: 1.0,
            regime: template.regime,
            priority: AssetPriority::Regime,
            is_current_position: false,
            previous_allocation: 0.0,
            reason: "cash equivalent for unallocated residual".to_string(),
            missing_data: Vec::new(),
        };
        let mut cash = SizedAsset::new(
            cash_score,
            residual,
            SizeCategory::NoPosition,
            format!("cash bucket residual: {:.1}%", residual * 100.0),
        );
        cash.is_cash_residual = true;
        cash.residual_added = residual;
        assets.push(cash);
        0.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizing::dynamic::SizeCategory;
    use crate::types::Regime;
    use chrono::{TimeZone, Utc};

    fn sized(asset: &str, combined: f64, weight: f64) -> SizedAsset {
        let score = AssetScore::stub(
            asset,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Regime::Goldilocks,
            AssetPriority::Trending,
            combined,
        );
        SizedAsset::new(score, weight, SizeCategory::Standard, String::new())
    }

    #[test]
    fn both_capped_with_cash_bucket_residual() {
        let sizer = TwoStagePositionSizer::new(0.15, 0.95, ResidualStrategy::CashBucket, 0.05);
        let outcome = sizer.apply(vec![sized("A", 0.95, 0.475), sized("B", 0.95, 0.475)]);

        assert_eq!(outcome.stage1_capped, 2);
        let cash = outcome
            .assets
            .iter()
            .find(|a| a.asset() == CASH_EQUIVALENT)
            .expect("cash residual position");
        assert!(cash.is_cash_residual);
        assert!((cash.weight - 0.65).abs() < 1e-9, "cash got {}", cash.weight);
        assert!((outcome.total_allocated - 0.95).abs() < 1e-9);
        assert_eq!(outcome.strategy_applied, Some(ResidualStrategy::CashBucket));
    }

    #[test]
    fn stage2_redistributes_capped_mass_to_uncapped() {
        let sizer = TwoStagePositionSizer::new(0.15, 0.5, ResidualStrategy::SafeTopSlice, 0.05);
        // A is over the cap, B and C have room.
        let outcome = sizer.apply(vec![
            sized("A", 0.9, 0.30),
            sized("B", 0.8, 0.10),
            sized("C", 0.7, 0.10),
        ]);

        let a = outcome.assets.iter().find(|x| x.asset() == "A").unwrap();
        assert!(a.stage1_capped);
        assert!((a.weight - 0.15).abs() < 1e-9);

        // Remaining 0.35 split over B and C proportionally (0.175 each),
        // then re-capped to 0.15 each in stage 2.
        let b = outcome.assets.iter().find(|x| x.asset() == "B").unwrap();
        let c = outcome.assets.iter().find(|x| x.asset() == "C").unwrap();
        assert!(b.stage2_capped && c.stage2_capped);
        assert!((b.weight - 0.15).abs() < 1e-9);
        assert!((c.weight - 0.15).abs() < 1e-9);
    }

    #[test]
    fn top_slice_respects_per_asset_residual_cap() {
        let sizer = TwoStagePositionSizer::new(0.15, 0.5, ResidualStrategy::SafeTopSlice, 0.05);
        // One capped asset leaves a 0.35 budget; one uncapped small position.
        let outcome = sizer.apply(vec![sized("A", 0.9, 0.30), sized("B", 0.8, 0.05)]);

        let b = outcome.assets.iter().find(|x| x.asset() == "B").unwrap();
        // Stage 2 scales B into the full remaining budget (0.35 -> capped
        // at 0.15), so stage 3 has nothing left for top-slice to add.
        assert!(b.stage2_capped);
        assert!((b.weight - 0.15).abs() < 1e-9);
        // 0.5 target - 0.30 allocated = 0.20 left unplaced by top-slice
        // because no uncapped positions remain.
        let cash = outcome.assets.iter().find(|a| a.is_cash_residual);
        assert!(cash.is_some(), "top-slice falls back to cash when all capped");
    }

    #[test]
    fn top_slice_adds_bounded_residual_to_best_scores() {
        let sizer = TwoStagePositionSizer::new(0.20, 0.60, ResidualStrategy::SafeTopSlice, 0.05);
        // No caps bind in stage 1; stage 2 scales to target exactly, so
        // manufacture residual by starting above-target weights impossible;
        // instead start below and let stage 2 scale up, then cap creates
        // residual.
        let outcome = sizer.apply(vec![
            sized("A", 0.95, 0.30),
            sized("B", 0.90, 0.10),
            sized("C", 0.60, 0.10),
        ]);
        // A capped at 0.20 in stage 1; B and C scale to fill 0.40 but both
        // land at 0.20 = cap exactly (no stage2 flag at equality), total 0.60.
        assert!((outcome.total_allocated - 0.60).abs() < 1e-9);
        assert!(outcome.residual_unallocated < 1e-9);
    }

    #[test]
    fn proportional_residual_respects_caps() {
        let sizer = TwoStagePositionSizer::new(0.15, 0.5, ResidualStrategy::Proportional, 0.05);
        let outcome = sizer.apply(vec![sized("A", 0.9, 0.30), sized("B", 0.8, 0.05)]);
        // Same shape as above: B caps in stage 2, residual cannot be placed
        // proportionally (both at cap), so it stays unallocated.
        assert!(outcome.residual_unallocated > 0.0);
        for asset in &outcome.assets {
            assert!(asset.weight <= 0.15 + 1e-9);
        }
    }

    #[test]
    fn empty_selection_is_a_no_op() {
        let sizer = TwoStagePositionSizer::new(0.15, 0.95, ResidualStrategy::SafeTopSlice, 0.05);
        let outcome = sizer.apply(Vec::new());
        assert!(outcome.assets.is_empty());
        assert_eq!(outcome.strategy_applied, None);
    }
}
