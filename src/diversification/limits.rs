// =============================================================================
// Bucket limits enforcer — per-bucket diversification constraints
// =============================================================================
//
// Applied in order:
//   1. Group scored assets by bucket; portfolio assets sort ahead of higher
//      scores within each bucket.
//   2. Position limit: keep the top N per bucket. With overflow allowed,
//      portfolio assets bypass the cap and new candidates fill what is left.
//   3. Allocation limit: applied after sizing, scaling overweight buckets
//      down to the cap.
//   4. Minimum representation: when too few buckets survive, the best asset
//      of an unrepresented bucket is injected with a neutral score and
//      flagged.
//
// Rejected assets keep a bucket rejection reason for the audit trail.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buckets::{BucketManager, BucketStatistics};
use crate::config::RebalancePolicy;
use crate::events::{EventSink, PortfolioEvent};
use crate::scoring::AssetScore;
use crate::sizing::SizedAsset;
use crate::types::{AssetPriority, Regime};

/// Neutral score assigned to assets injected for minimum representation.
const INJECTED_SCORE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketLimitsConfig {
    pub max_positions_per_bucket: usize,
    pub max_allocation_per_bucket: f64,
    pub min_buckets_represented: usize,
    pub allow_bucket_overflow: bool,
}

impl BucketLimitsConfig {
    pub fn from_policy(policy: &RebalancePolicy) -> Self {
        Self {
            max_positions_per_bucket: policy.max_positions_per_bucket,
            max_allocation_per_bucket: policy.max_allocation_per_bucket,
            min_buckets_represented: policy.min_buckets_represented,
            allow_bucket_overflow: policy.allow_bucket_overflow,
        }
    }
}

/// Asset rejected by bucket enforcement, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedScore {
    pub score: AssetScore,
    pub reason: String,
}

/// Outcome of bucket enforcement at the selection stage.
#[derive(Debug, Clone)]
pub struct BucketEnforcement {
    pub selected: Vec<AssetScore>,
    pub rejected: Vec<RejectedScore>,
    pub statistics: BTreeMap<String, BucketStatistics>,
    pub actions: Vec<String>,
    /// Assets injected purely to satisfy minimum bucket representation.
    pub forced_for_diversification: Vec<String>,
}

// ---------------------------------------------------------------------------
// Enforcer
// ---------------------------------------------------------------------------

pub struct BucketLimitsEnforcer<'a> {
    buckets: &'a BucketManager,
}

impl<'a> BucketLimitsEnforcer<'a> {
    pub fn new(buckets: &'a BucketManager) -> Self {
        Self { buckets }
    }

    /// Enforce position caps and minimum representation over scored assets.
    pub fn apply(
        &self,
        scored: Vec<AssetScore>,
        config: &BucketLimitsConfig,
        date: DateTime<Utc>,
        regime: Regime,
        sink: &dyn EventSink,
    ) -> BucketEnforcement {
        if scored.is_empty() {
            return BucketEnforcement {
                selected: Vec::new(),
                rejected: Vec::new(),
                statistics: BTreeMap::new(),
                actions: vec!["no assets to process".to_string()],
                forced_for_diversification: Vec::new(),
            };
        }

        // Group by bucket, portfolio first, then descending score.
        let mut groups: BTreeMap<String, Vec<AssetScore>> = BTreeMap::new();
        for score in scored {
            groups
                .entry(self.buckets.bucket_of(&score.asset).to_string())
                .or_default()
                .push(score);
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| {
                let rank = |s: &AssetScore| usize::from(s.priority != AssetPriority::Portfolio);
                rank(a).cmp(&rank(b)).then(
                    b.combined
                        .partial_cmp(&a.combined)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
            });
        }

        let mut selected = Vec::new();
        let mut rejected = Vec::new();
        let mut actions = Vec::new();

        for (bucket, group) in groups {
            let total = group.len();
            if total <= config.max_positions_per_bucket {
                selected.extend(group);
                continue;
            }

            let (keep, spill) =
                self.split_over_cap(group, config.max_positions_per_bucket, config.allow_bucket_overflow);

            let reason = format!(
                "exceeded max positions for bucket '{bucket}' ({})",
                config.max_positions_per_bucket
            );
            actions.push(format!(
                "bucket '{bucket}': selected {}/{total} assets (limit {})",
                keep.len(),
                config.max_positions_per_bucket
            ));
            sink.emit(
                PortfolioEvent::new(
                    date,
                    "diversification.bucket_limit_enforced",
                    "block",
                    format!("{}: rejected {} assets", bucket, spill.len()),
                )
                .meta("bucket", bucket.clone())
                .meta("limit", config.max_positions_per_bucket as u64),
            );

            selected.extend(keep);
            rejected.extend(spill.into_iter().map(|score| RejectedScore {
                score,
                reason: reason.clone(),
            }));
        }

        // Minimum bucket representation.
        let mut forced = Vec::new();
        let mut represented: Vec<String> = selected
            .iter()
            .map(|s| self.buckets.bucket_of(&s.asset).to_string())
            .collect();
        represented.sort();
        represented.dedup();

        if represented.len() < config.min_buckets_represented {
            for bucket in self.buckets.bucket_names() {
                if represented.len() >= config.min_buckets_represented {
                    break;
                }
                if represented.contains(&bucket) {
                    continue;
                }
                let Some(candidate) = self.injection_candidate(&bucket, &selected, date, regime)
                else {
                    continue;
                };
                info!(%bucket, asset = %candidate.asset, "forced for minimum bucket representation");
                actions.push(format!(
                    "added {} from bucket '{bucket}' for minimum representation",
                    candidate.asset
                ));
                forced.push(candidate.asset.clone());
                represented.push(bucket);
                selected.push(candidate);
            }
        }

        let statistics = self
            .buckets
            .statistics(&selected, &std::collections::HashMap::new());

        debug!(
            selected = selected.len(),
            rejected = rejected.len(),
            buckets = statistics.len(),
            "bucket limits applied"
        );

        BucketEnforcement {
            selected,
            rejected,
            statistics,
            actions,
            forced_for_diversification: forced,
        }
    }

    /// Scale overweight buckets down to the allocation cap. Runs after
    /// sizing, when weights exist. Returns the actions taken.
    pub fn enforce_allocation_caps(
        &self,
        sized: &mut [SizedAsset],
        max_allocation: f64,
    ) -> Vec<String> {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for asset in sized.iter() {
            if asset.is_cash_residual {
                continue;
            }
            *totals
                .entry(self.buckets.bucket_of(asset.asset()).to_string())
                .or_insert(0.0) += asset.weight;
        }

        let mut actions = Vec::new();
        for (bucket, total) in totals {
            if total <= max_allocation {
                continue;
            }
            let scale = max_allocation / total;
            for asset in sized.iter_mut() {
                if !asset.is_cash_residual && self.buckets.bucket_of(asset.asset()) == bucket {
                    asset.weight *= scale;
                }
            }
            actions.push(format!(
                "bucket '{bucket}': scaled allocation from {:.1}% to {:.1}%",
                total * 100.0,
                max_allocation * 100.0
            ));
        }
        actions
    }

    /// Split an over-cap bucket group into kept and spilled assets.
    fn split_over_cap(
        &self,
        group: Vec<AssetScore>,
        cap: usize,
        allow_overflow: bool,
    ) -> (Vec<AssetScore>, Vec<AssetScore>) {
        if !allow_overflow {
            let mut keep = group;
            let spill = keep.split_off(cap.min(keep.len()));
            return (keep, spill);
        }

        // Portfolio assets bypass the cap; new candidates compete for
        // whatever slots the incumbents left open.
        let (portfolio, others): (Vec<_>, Vec<_>) = group
            .into_iter()
            .partition(|s| s.priority == AssetPriority::Portfolio);
        let open_slots = cap.saturating_sub(portfolio.len());
        let mut keep = portfolio;
        let mut others = others;
        let spill = others.split_off(open_slots.min(others.len()));
        keep.extend(others);
        (keep, spill)
    }

    /// Best unselected asset of a bucket, or a neutral synthetic candidate
    /// when none of its members were scored.
    fn injection_candidate(
        &self,
        bucket: &str,
        selected: &[AssetScore],
        date: DateTime<Utc>,
        regime: Regime,
    ) -> Option<AssetScore> {
        let members = self.buckets.assets_in(bucket);
        let asset = members
            .iter()
            .find(|asset| !selected.iter().any(|s| &s.asset == *asset))?;
        Some(AssetScore {
            asset: asset.clone(),
            date,
            technical: INJECTED_SCORE,
            fundamental: INJECTED_SCORE,
            combined: INJECTED_SCORE,
            confidence: 0.5,
            regime,
            priority: AssetPriority::Regime,
            is_current_position: false,
            previous_allocation: 0.0,
            reason: "added for minimum bucket representation".to_string(),
            missing_data: Vec::new(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryEventSink, NullEventSink};
    use crate::sizing::{SizeCategory, SizedAsset};
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn buckets() -> BucketManager {
        BucketManager::new(BTreeMap::from([
            (
                "Risk Assets".to_string(),
                vec![
                    "AAPL".to_string(),
                    "MSFT".to_string(),
                    "NVDA".to_string(),
                    "TSLA".to_string(),
                ],
            ),
            (
                "Defensive Assets".to_string(),
                vec!["JNJ".to_string(), "PG".to_string()],
            ),
        ]))
    }

    fn score(asset: &str, combined: f64, priority: AssetPriority) -> AssetScore {
        let mut s = AssetScore::stub(asset, ts(), Regime::Goldilocks, priority, combined);
        s.is_current_position = priority == AssetPriority::Portfolio;
        s
    }

    fn config(cap: usize) -> BucketLimitsConfig {
        BucketLimitsConfig {
            max_positions_per_bucket: cap,
            max_allocation_per_bucket: 0.4,
            min_buckets_represented: 1,
            allow_bucket_overflow: false,
        }
    }

    #[test]
    fn position_cap_keeps_top_scorers() {
        let b = buckets();
        let enforcer = BucketLimitsEnforcer::new(&b);
        let scored = vec![
            score("AAPL", 0.7, AssetPriority::Trending),
            score("MSFT", 0.9, AssetPriority::Trending),
            score("NVDA", 0.8, AssetPriority::Trending),
        ];
        let sink = MemoryEventSink::new();
        let outcome = enforcer.apply(scored, &config(2), ts(), Regime::Goldilocks, &sink);

        let kept: Vec<&str> = outcome.selected.iter().map(|s| s.asset.as_str()).collect();
        assert_eq!(kept, vec!["MSFT", "NVDA"]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].score.asset, "AAPL");
        assert!(outcome.rejected[0].reason.contains("Risk Assets"));
        assert_eq!(
            sink.events_of_type("diversification.bucket_limit_enforced").len(),
            1
        );
    }

    #[test]
    fn portfolio_assets_sort_ahead_of_score() {
        let b = buckets();
        let enforcer = BucketLimitsEnforcer::new(&b);
        let scored = vec![
            score("AAPL", 0.65, AssetPriority::Portfolio),
            score("MSFT", 0.9, AssetPriority::Trending),
            score("NVDA", 0.8, AssetPriority::Trending),
        ];
        let outcome = enforcer.apply(scored, &config(2), ts(), Regime::Goldilocks, &NullEventSink);
        let kept: Vec<&str> = outcome.selected.iter().map(|s| s.asset.as_str()).collect();
        // Incumbent wins a slot despite the lowest score.
        assert!(kept.contains(&"AAPL"));
        assert!(kept.contains(&"MSFT"));
        assert!(!kept.contains(&"NVDA"));
    }

    #[test]
    fn overflow_lets_incumbents_exceed_cap() {
        let b = buckets();
        let enforcer = BucketLimitsEnforcer::new(&b);
        let mut cfg = config(2);
        cfg.allow_bucket_overflow = true;
        let scored = vec![
            score("AAPL", 0.65, AssetPriority::Portfolio),
            score("MSFT", 0.66, AssetPriority::Portfolio),
            score("NVDA", 0.67, AssetPriority::Portfolio),
            score("TSLA", 0.9, AssetPriority::Trending),
        ];
        let outcome = enforcer.apply(scored, &cfg, ts(), Regime::Goldilocks, &NullEventSink);
        let kept: Vec<&str> = outcome.selected.iter().map(|s| s.asset.as_str()).collect();
        // All three incumbents stay, the newcomer is spilled.
        assert_eq!(kept.len(), 3);
        assert!(!kept.contains(&"TSLA"));
    }

    #[test]
    fn min_representation_injects_neutral_candidate() {
        let b = buckets();
        let enforcer = BucketLimitsEnforcer::new(&b);
        let mut cfg = config(4);
        cfg.min_buckets_represented = 2;
        let scored = vec![
            score("AAPL", 0.8, AssetPriority::Trending),
            score("MSFT", 0.7, AssetPriority::Trending),
        ];
        let outcome = enforcer.apply(scored, &cfg, ts(), Regime::Goldilocks, &NullEventSink);

        assert_eq!(outcome.forced_for_diversification.len(), 1);
        let injected = outcome
            .selected
            .iter()
            .find(|s| outcome.forced_for_diversification.contains(&s.asset))
            .unwrap();
        assert_eq!(b.bucket_of(&injected.asset), "Defensive Assets");
        assert!((injected.combined - INJECTED_SCORE).abs() < 1e-12);
    }

    #[test]
    fn allocation_caps_scale_overweight_buckets() {
        let b = buckets();
        let enforcer = BucketLimitsEnforcer::new(&b);
        let mut sized = vec![
            SizedAsset::new(
                score("AAPL", 0.8, AssetPriority::Trending),
                0.30,
                SizeCategory::Standard,
                String::new(),
            ),
            SizedAsset::new(
                score("MSFT", 0.8, AssetPriority::Trending),
                0.30,
                SizeCategory::Standard,
                String::new(),
            ),
            SizedAsset::new(
                score("JNJ", 0.8, AssetPriority::Trending),
                0.20,
                SizeCategory::Standard,
                String::new(),
            ),
        ];
        let actions = enforcer.enforce_allocation_caps(&mut sized, 0.4);
        assert_eq!(actions.len(), 1);
        // Risk Assets 0.60 scaled to 0.40; members halve proportionally.
        assert!((sized[0].weight - 0.20).abs() < 1e-9);
        assert!((sized[1].weight - 0.20).abs() < 1e-9);
        // Defensive untouched.
        assert!((sized[2].weight - 0.20).abs() < 1e-9);
    }
}
