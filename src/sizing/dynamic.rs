// =============================================================================
// Dynamic position sizer — score-aware first-pass sizing
// =============================================================================
//
// Three modes:
//   - adaptive (default): equal-weight base scaled by a score multiplier
//     ladder, with a small bias toward existing positions, then normalised
//     back to the target allocation.
//   - equal_weight: target / N for every asset.
//   - score_weighted: allocation proportional to combined score.
//
// A constraint pass then caps oversized positions, boosts dust positions up
// to the minimum, drops zero-sized assets, and renormalises once.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scoring::AssetScore;

/// Allocation mass below this grain is ignored everywhere in sizing.
pub const ALLOCATION_GRAIN: f64 = 0.001;

/// Bias multiplier for assets already held.
const INCUMBENT_SIZE_BIAS: f64 = 1.02;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    #[default]
    Adaptive,
    EqualWeight,
    ScoreWeighted,
}

impl std::fmt::Display for SizingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adaptive => write!(f, "adaptive"),
            Self::EqualWeight => write!(f, "equal_weight"),
            Self::ScoreWeighted => write!(f, "score_weighted"),
        }
    }
}

/// Size bracket assigned by the adaptive multiplier ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Max,
    Standard,
    Half,
    Light,
    NoPosition,
}

/// Pipeline record produced by the sizers: the score plus the evolving
/// weight and every annotation later stages need. Flags are typed fields,
/// never ad-hoc attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedAsset {
    pub score: AssetScore,
    pub weight: f64,
    pub category: SizeCategory,
    pub was_capped: bool,
    pub was_boosted: bool,
    pub stage1_capped: bool,
    pub stage2_capped: bool,
    /// Residual mass added in the final allocation stage.
    pub residual_added: f64,
    /// True for the synthetic cash position created by the cash-bucket
    /// residual strategy.
    pub is_cash_residual: bool,
    pub sizing_reason: String,
}

impl SizedAsset {
    pub fn new(score: AssetScore, weight: f64, category: SizeCategory, reason: String) -> Self {
        Self {
            score,
            weight,
            category,
            was_capped: false,
            was_boosted: false,
            stage1_capped: false,
            stage2_capped: false,
            residual_added: 0.0,
            is_cash_residual: false,
            sizing_reason: reason,
        }
    }

    pub fn asset(&self) -> &str {
        &self.score.asset
    }
}

// ---------------------------------------------------------------------------
// Sizer
// ---------------------------------------------------------------------------

pub struct DynamicPositionSizer {
    mode: SizingMode,
    max_single_position: f64,
    target_allocation: f64,
    min_position_size: f64,
}

impl DynamicPositionSizer {
    pub fn new(
        mode: SizingMode,
        max_single_position: f64,
        target_allocation: f64,
        min_position_size: f64,
    ) -> Self {
        Self {
            mode,
            max_single_position,
            target_allocation,
            min_position_size,
        }
    }

    /// Size the selection. Zero-scored assets in adaptive mode drop out.
    pub fn size(&self, assets: Vec<AssetScore>) -> Vec<SizedAsset> {
        if assets.is_empty() || self.target_allocation <= 0.0 {
            return Vec::new();
        }

        let sized = match self.mode {
            SizingMode::Adaptive => self.adaptive(assets),
            SizingMode::EqualWeight => self.equal_weight(assets),
            SizingMode::ScoreWeighted => self.score_weighted(assets),
        };

        let constrained = self.apply_constraints(sized);
        debug!(
            mode = %self.mode,
            positions = constrained.len(),
            total = constrained.iter().map(|a| a.weight).sum::<f64>(),
            "dynamic sizing complete"
        );
        constrained
    }

    fn adaptive(&self, assets: Vec<AssetScore>) -> Vec<SizedAsset> {
        let base = self.target_allocation / assets.len() as f64;

        let mut sized: Vec<SizedAsset> = assets
            .into_iter()
            .map(|score| {
                let (category, multiplier) = score_multiplier(score.combined);
                let mut weight = base * multiplier;
                let mut reason = format!("adaptive {category:?} ({multiplier:.1}x)");
                if score.is_current_position && weight > 0.0 {
                    weight *= INCUMBENT_SIZE_BIAS;
                    reason.push_str(" + incumbent bias");
                }
                SizedAsset::new(score, weight, category, reason)
            })
            .collect();

        normalize(&mut sized, self.target_allocation);
        sized
    }

    fn equal_weight(&self, assets: Vec<AssetScore>) -> Vec<SizedAsset> {
        let each = self.target_allocation / assets.len() as f64;
        assets
            .into_iter()
            .map(|score| {
                SizedAsset::new(
                    score,
                    each,
                    SizeCategory::Standard,
                    format!("equal weight: {:.1}%", each * 100.0),
                )
            })
            .collect()
    }

    fn score_weighted(&self, assets: Vec<AssetScore>) -> Vec<SizedAsset> {
        let total_score: f64 = assets.iter().map(|a| a.combined).sum();
        if total_score <= 0.0 {
            return self.equal_weight(assets);
        }

        assets
            .into_iter()
            .map(|score| {
                let share = score.combined / total_score;
                let weight = self.target_allocation * share;
                let category = if weight >= self.target_allocation * 0.15 {
                    SizeCategory::Max
                } else if weight >= self.target_allocation * 0.10 {
                    SizeCategory::Standard
                } else if weight >= self.target_allocation * 0.05 {
                    SizeCategory::Half
                } else {
                    SizeCategory::Light
                };
                SizedAsset::new(
                    score,
                    weight,
                    category,
                    format!("score weighted: {:.1}% of portfolio", share * 100.0),
                )
            })
            .collect()
    }

    /// Cap, boost, drop, renormalise, re-check caps once.
    fn apply_constraints(&self, sized: Vec<SizedAsset>) -> Vec<SizedAsset> {
        let mut kept: Vec<SizedAsset> = Vec::with_capacity(sized.len());
        for mut asset in sized {
            if asset.weight <= 0.0 {
                continue;
            }
            if asset.weight > self.max_single_position {
                asset.weight = self.max_single_position;
                asset.was_capped = true;
            } else if asset.weight < self.min_position_size {
                asset.weight = self.min_position_size;
                asset.was_boosted = true;
            }
            kept.push(asset);
        }

        let total: f64 = kept.iter().map(|a| a.weight).sum();
        if total > 0.0 {
            let scale = self.target_allocation / total;
            for asset in &mut kept {
                let scaled = asset.weight * scale;
                if scaled > self.max_single_position {
                    asset.weight = self.max_single_position;
                    asset.was_capped = true;
                } else {
                    asset.weight = scaled;
                }
            }
        }
        kept
    }
}

/// Adaptive multiplier ladder keyed on combined score.
fn score_multiplier(combined: f64) -> (SizeCategory, f64) {
    if combined >= 0.9 {
        (SizeCategory::Max, 1.5)
    } else if combined >= 0.8 {
        (SizeCategory::Standard, 1.2)
    } else if combined >= 0.7 {
        (SizeCategory::Half, 1.0)
    } else if combined >= 0.6 {
        (SizeCategory::Light, 0.8)
    } else {
        (SizeCategory::NoPosition, 0.0)
    }
}

fn normalize(sized: &mut [SizedAsset], target: f64) {
    let total: f64 = sized.iter().map(|a| a.weight).sum();
    if total > 0.0 {
        let scale = target / total;
        for asset in sized.iter_mut() {
            asset.weight *= scale;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetPriority, Regime};
    use chrono::{TimeZone, Utc};

    fn score(asset: &str, combined: f64) -> AssetScore {
        AssetScore::stub(
            asset,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Regime::Goldilocks,
            AssetPriority::Trending,
            combined,
        )
    }

    fn total(sized: &[SizedAsset]) -> f64 {
        sized.iter().map(|a| a.weight).sum()
    }

    #[test]
    fn equal_weight_splits_target_evenly() {
        let sizer = DynamicPositionSizer::new(SizingMode::EqualWeight, 0.5, 0.95, 0.02);
        let sized = sizer.size(vec![score("A", 0.8), score("B", 0.6), score("C", 0.9)]);
        assert_eq!(sized.len(), 3);
        for asset in &sized {
            assert!((asset.weight - 0.95 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn adaptive_scales_by_score_ladder() {
        let sizer = DynamicPositionSizer::new(SizingMode::Adaptive, 0.9, 0.9, 0.0);
        let sized = sizer.size(vec![score("HIGH", 0.95), score("LOW", 0.65)]);

        let high = sized.iter().find(|a| a.asset() == "HIGH").unwrap();
        let low = sized.iter().find(|a| a.asset() == "LOW").unwrap();
        assert_eq!(high.category, SizeCategory::Max);
        assert_eq!(low.category, SizeCategory::Light);
        // 1.5x vs 0.8x base, preserved through normalisation.
        assert!((high.weight / low.weight - 1.5 / 0.8).abs() < 1e-9);
        assert!((total(&sized) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn adaptive_drops_sub_threshold_scores() {
        let sizer = DynamicPositionSizer::new(SizingMode::Adaptive, 0.5, 0.95, 0.02);
        let sized = sizer.size(vec![score("KEEP", 0.8), score("DROP", 0.4)]);
        assert_eq!(sized.len(), 1);
        assert_eq!(sized[0].asset(), "KEEP");
    }

    #[test]
    fn score_weighted_is_proportional() {
        let sizer = DynamicPositionSizer::new(SizingMode::ScoreWeighted, 0.9, 0.9, 0.0);
        let sized = sizer.size(vec![score("A", 0.6), score("B", 0.3)]);
        let a = sized.iter().find(|s| s.asset() == "A").unwrap();
        let b = sized.iter().find(|s| s.asset() == "B").unwrap();
        assert!((a.weight - 0.6).abs() < 1e-9);
        assert!((b.weight - 0.3).abs() < 1e-9);
    }

    #[test]
    fn cap_flags_and_renormalises() {
        // Two assets, cap low enough that both hit it.
        let sizer = DynamicPositionSizer::new(SizingMode::EqualWeight, 0.2, 0.95, 0.02);
        let sized = sizer.size(vec![score("A", 0.9), score("B", 0.9)]);
        for asset in &sized {
            assert!(asset.was_capped);
            assert!((asset.weight - 0.2).abs() < 1e-9);
        }
        // Total stays at the cap sum, not the unreachable target.
        assert!((total(&sized) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn dust_positions_boosted_to_minimum() {
        let sizer = DynamicPositionSizer::new(SizingMode::ScoreWeighted, 0.9, 0.9, 0.05);
        // B gets ~2.6% before boost.
        let sized = sizer.size(vec![score("A", 0.9), score("B", 0.026)]);
        let b = sized.iter().find(|s| s.asset() == "B").unwrap();
        assert!(b.was_boosted);
        assert!(b.weight >= 0.04, "boost then renormalise keeps b near minimum");
    }

    #[test]
    fn incumbents_get_size_bias() {
        let sizer = DynamicPositionSizer::new(SizingMode::Adaptive, 0.9, 0.9, 0.0);
        let mut incumbent = score("INC", 0.85);
        incumbent.is_current_position = true;
        let sized = sizer.size(vec![incumbent, score("NEW", 0.85)]);
        let inc = sized.iter().find(|a| a.asset() == "INC").unwrap();
        let new = sized.iter().find(|a| a.asset() == "NEW").unwrap();
        assert!((inc.weight / new.weight - 1.02).abs() < 1e-9);
    }

    #[test]
    fn empty_input_sizes_nothing() {
        let sizer = DynamicPositionSizer::new(SizingMode::Adaptive, 0.2, 0.95, 0.02);
        assert!(sizer.size(Vec::new()).is_empty());
    }
}
