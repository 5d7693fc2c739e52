// =============================================================================
// Smart diversification — high-score bucket overrides with core promotion
// =============================================================================
//
// A full bucket normally rejects further candidates. An exceptional score at
// or above the override threshold may still enter, and the override performs
// two actions atomically: the asset is admitted AND designated a core asset.
// An override whose core designation fails (registry full, management
// disabled) is denied outright.
//
// At most `max_overrides_per_rebalance` overrides are granted per cycle.
// Assets that are already core re-enter a full bucket without consuming an
// override.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::buckets::BucketManager;
use crate::events::{EventSink, PortfolioEvent};
use crate::protection::core_assets::CoreAssetManager;
use crate::scoring::AssetScore;

pub struct SmartDiversificationManager {
    override_threshold: f64,
    max_overrides_per_rebalance: usize,
    overrides_granted: usize,
    cycle_date: Option<DateTime<Utc>>,
}

impl SmartDiversificationManager {
    pub fn new(override_threshold: f64, max_overrides_per_rebalance: usize) -> Self {
        Self {
            override_threshold,
            max_overrides_per_rebalance,
            overrides_granted: 0,
            cycle_date: None,
        }
    }

    pub fn overrides_granted_this_cycle(&self) -> usize {
        self.overrides_granted
    }

    /// Re-examine assets spilled by bucket limits. Admits already-core
    /// assets and grants bucket overrides to qualifying high scorers,
    /// promoting them to core.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &mut self,
        selected: Vec<AssetScore>,
        rejected: Vec<AssetScore>,
        buckets: &BucketManager,
        core: &mut CoreAssetManager,
        max_positions_per_bucket: usize,
        date: DateTime<Utc>,
        sink: &dyn EventSink,
    ) -> Vec<AssetScore> {
        // New rebalance date resets the override budget.
        if self.cycle_date != Some(date) {
            self.overrides_granted = 0;
            self.cycle_date = Some(date);
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for score in &selected {
            *counts
                .entry(buckets.bucket_of(&score.asset).to_string())
                .or_insert(0) += 1;
        }

        let mut out = selected;
        let mut candidates = rejected;
        candidates.sort_by(|a, b| {
            b.combined
                .partial_cmp(&a.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for mut candidate in candidates {
            let bucket = buckets.bucket_of(&candidate.asset).to_string();
            let count = counts.get(&bucket).copied().unwrap_or(0);

            if count < max_positions_per_bucket {
                // A slot opened up after all; admit normally.
                candidate.reason = format!("admitted into bucket '{bucket}' (slot available)");
                *counts.entry(bucket).or_insert(0) += 1;
                out.push(candidate);
                continue;
            }

            if core.is_core_asset(&candidate.asset, Some(date)) {
                candidate.reason =
                    format!("core asset exemption from bucket '{bucket}' limit");
                *counts.entry(bucket).or_insert(0) += 1;
                out.push(candidate);
                continue;
            }

            if candidate.combined < self.override_threshold {
                debug!(
                    asset = %candidate.asset,
                    score = candidate.combined,
                    "below override threshold, stays rejected"
                );
                continue;
            }
            if self.overrides_granted >= self.max_overrides_per_rebalance {
                debug!(asset = %candidate.asset, "override budget exhausted");
                continue;
            }

            let reason = format!(
                "high-alpha bucket override: {:.3} >= {:.3}",
                candidate.combined, self.override_threshold
            );
            if !core.mark_as_core(&candidate.asset, date, &reason, Some(candidate.combined), buckets)
            {
                debug!(asset = %candidate.asset, "core designation failed, override denied");
                continue;
            }

            self.overrides_granted += 1;
            info!(
                asset = %candidate.asset,
                %bucket,
                score = candidate.combined,
                "bucket override granted, asset promoted to core"
            );
            sink.emit(
                PortfolioEvent::new(
                    date,
                    "diversification.bucket_override_granted",
                    "override",
                    reason.clone(),
                )
                .asset(&candidate.asset)
                .scores(None, Some(candidate.combined))
                .meta("bucket", bucket.clone())
                .meta("overrides_this_cycle", self.overrides_granted as u64),
            );

            candidate.reason = format!("bucket override + core designation: {reason}");
            *counts.entry(bucket).or_insert(0) += 1;
            out.push(candidate);
        }

        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryEventSink, NullEventSink};
    use crate::types::{AssetPriority, Regime};
    use chrono::{Duration, TimeZone};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn buckets() -> BucketManager {
        BucketManager::new(BTreeMap::from([(
            "Risk Assets".to_string(),
            vec![
                "AAPL".to_string(),
                "MSFT".to_string(),
                "NVDA".to_string(),
                "TSLA".to_string(),
                "META".to_string(),
            ],
        )]))
    }

    fn core() -> CoreAssetManager {
        CoreAssetManager::new(true, 3, 90, 2, 0.15, 30, 7)
    }

    fn score(asset: &str, combined: f64) -> AssetScore {
        AssetScore::stub(asset, day(0), Regime::Goldilocks, AssetPriority::Trending, combined)
    }

    fn full_bucket() -> Vec<AssetScore> {
        vec![
            score("AAPL", 0.8),
            score("MSFT", 0.8),
            score("NVDA", 0.8),
            score("TSLA", 0.8),
        ]
    }

    #[test]
    fn high_scorer_overrides_full_bucket_and_becomes_core() {
        let b = buckets();
        let mut core = core();
        let mut smart = SmartDiversificationManager::new(0.95, 2);
        let sink = MemoryEventSink::new();

        let out = smart.apply(
            full_bucket(),
            vec![score("META", 0.97)],
            &b,
            &mut core,
            4,
            day(0),
            &sink,
        );

        assert!(out.iter().any(|s| s.asset == "META"));
        assert!(core.is_core_asset("META", Some(day(0))));
        assert_eq!(smart.overrides_granted_this_cycle(), 1);
        let events = sink.events_of_type("diversification.bucket_override_granted");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].asset.as_deref(), Some("META"));
    }

    #[test]
    fn below_threshold_stays_rejected() {
        let b = buckets();
        let mut core = core();
        let mut smart = SmartDiversificationManager::new(0.95, 2);

        let out = smart.apply(
            full_bucket(),
            vec![score("META", 0.90)],
            &b,
            &mut core,
            4,
            day(0),
            &NullEventSink,
        );
        assert!(!out.iter().any(|s| s.asset == "META"));
        assert!(!core.is_core_asset("META", None));
    }

    #[test]
    fn override_budget_limits_grants() {
        let b = BucketManager::new(BTreeMap::from([(
            "Risk Assets".to_string(),
            vec![
                "A".to_string(),
                "B".to_string(),
                "C".to_string(),
                "D".to_string(),
                "E".to_string(),
            ],
        )]));
        let mut core = core();
        let mut smart = SmartDiversificationManager::new(0.95, 1);

        let selected = vec![score("A", 0.8), score("B", 0.8)];
        let rejected = vec![score("C", 0.99), score("D", 0.98), score("E", 0.97)];
        let out = smart.apply(selected, rejected, &b, &mut core, 2, day(0), &NullEventSink);

        // Only the best one wins the single override slot.
        assert!(out.iter().any(|s| s.asset == "C"));
        assert!(!out.iter().any(|s| s.asset == "D"));
        assert_eq!(smart.overrides_granted_this_cycle(), 1);
    }

    #[test]
    fn denied_when_core_registry_full() {
        let b = buckets();
        let mut core = CoreAssetManager::new(true, 1, 90, 2, 0.15, 30, 7);
        core.mark_as_core("AAPL", day(0), "pre-existing", None, &b);
        let mut smart = SmartDiversificationManager::new(0.95, 2);

        let out = smart.apply(
            full_bucket(),
            vec![score("META", 0.99)],
            &b,
            &mut core,
            4,
            day(0),
            &NullEventSink,
        );
        assert!(!out.iter().any(|s| s.asset == "META"));
        assert_eq!(smart.overrides_granted_this_cycle(), 0);
    }

    #[test]
    fn existing_core_asset_reenters_without_spending_override() {
        let b = buckets();
        let mut core = core();
        core.mark_as_core("META", day(0), "earlier override", None, &b);
        let mut smart = SmartDiversificationManager::new(0.95, 2);

        // Score below the override threshold, but the asset is already core.
        let out = smart.apply(
            full_bucket(),
            vec![score("META", 0.85)],
            &b,
            &mut core,
            4,
            day(1),
            &NullEventSink,
        );
        assert!(out.iter().any(|s| s.asset == "META"));
        assert_eq!(smart.overrides_granted_this_cycle(), 0);
    }

    #[test]
    fn budget_resets_each_cycle_date() {
        let b = buckets();
        let mut core = core();
        let mut smart = SmartDiversificationManager::new(0.95, 1);

        smart.apply(
            full_bucket(),
            vec![score("META", 0.97)],
            &b,
            &mut core,
            4,
            day(0),
            &NullEventSink,
        );
        assert_eq!(smart.overrides_granted_this_cycle(), 1);

        // Next day the budget is fresh.
        smart.apply(Vec::new(), Vec::new(), &b, &mut core, 4, day(1), &NullEventSink);
        assert_eq!(smart.overrides_granted_this_cycle(), 0);
    }
}
