// =============================================================================
// Universe builder — who gets analysed this rebalance
// =============================================================================
//
// The rebalancing universe is the union of three sets:
//   1. Portfolio assets   — current positions. ALWAYS included, regardless of
//                           any confidence filter. An existing holding must be
//                           analysed even if it no longer trends.
//   2. Trending assets    — detector candidates above the confidence floor.
//   3. Regime assets      — members of the buckets appropriate for the
//                           current regime (or a caller-supplied filter).
//
// Each asset is tagged with the highest priority tier it qualifies for:
// Portfolio > Trending > Regime.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::buckets::BucketManager;
use crate::providers::RegimeDetector;
use crate::types::{AssetPriority, Regime};

/// Combined asset universe for one rebalance.
#[derive(Debug, Clone)]
pub struct Universe {
    pub date: DateTime<Utc>,
    pub regime: Regime,
    /// Current positions. Must all be analysed.
    pub portfolio: BTreeSet<String>,
    /// Trending candidates (always a superset of `portfolio`).
    pub trending: BTreeSet<String>,
    /// Assets from regime-appropriate buckets.
    pub regime_bucket: BTreeSet<String>,
    /// Union of the three sets above.
    pub combined: BTreeSet<String>,
}

impl Universe {
    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }

    /// Assets with their priority tier, portfolio first, deterministic order.
    pub fn prioritized(&self) -> Vec<(String, AssetPriority)> {
        let mut out = Vec::with_capacity(self.combined.len());
        for asset in &self.portfolio {
            out.push((asset.clone(), AssetPriority::Portfolio));
        }
        for asset in self.trending.difference(&self.portfolio) {
            out.push((asset.clone(), AssetPriority::Trending));
        }
        for asset in self.regime_bucket.iter() {
            if !self.portfolio.contains(asset) && !self.trending.contains(asset) {
                out.push((asset.clone(), AssetPriority::Regime));
            }
        }
        out
    }
}

/// Builds the rebalancing universe from detector output and the bucket
/// directory.
pub struct UniverseBuilder<'a> {
    detector: &'a dyn RegimeDetector,
    buckets: &'a BucketManager,
}

impl<'a> UniverseBuilder<'a> {
    pub fn new(detector: &'a dyn RegimeDetector, buckets: &'a BucketManager) -> Self {
        Self { detector, buckets }
    }

    /// Build the universe for a rebalance date.
    ///
    /// `default_regime` is used when the detector has no view; universe
    /// construction never aborts on a missing regime.
    pub fn build(
        &self,
        date: DateTime<Utc>,
        current_positions: &HashMap<String, f64>,
        default_regime: Regime,
        bucket_filter: Option<&[String]>,
        min_trending_confidence: f64,
    ) -> Universe {
        let portfolio: BTreeSet<String> = current_positions
            .iter()
            .filter(|(_, weight)| **weight > 0.0)
            .map(|(asset, _)| asset.clone())
            .collect();

        let regime = match self.detector.current(date) {
            Some(state) => state.regime,
            None => {
                debug!(%default_regime, "regime detector has no view, using default");
                default_regime
            }
        };

        // Regime-appropriate bucket assets, optionally narrowed by the caller.
        let regime_bucket_names = match bucket_filter {
            Some(filter) => {
                let allowed = self.detector.regime_buckets(regime);
                filter
                    .iter()
                    .filter(|name| allowed.is_empty() || allowed.contains(*name))
                    .cloned()
                    .collect::<Vec<_>>()
            }
            None => self.detector.regime_buckets(regime),
        };
        let regime_bucket: BTreeSet<String> = self
            .buckets
            .assets_from_buckets(&regime_bucket_names)
            .into_iter()
            .collect();

        // Trending candidates from the detector pool, filtered by confidence.
        // Portfolio assets are unioned in unconditionally.
        let pool: Vec<String> = regime_bucket.iter().cloned().collect();
        let mut trending: BTreeSet<String> = self
            .detector
            .trending(date, &pool, min_trending_confidence)
            .into_iter()
            .map(|c| c.asset)
            .collect();
        trending.extend(portfolio.iter().cloned());

        let combined: BTreeSet<String> = portfolio
            .iter()
            .chain(trending.iter())
            .chain(regime_bucket.iter())
            .cloned()
            .collect();

        info!(
            %regime,
            portfolio = portfolio.len(),
            trending = trending.len(),
            regime_bucket = regime_bucket.len(),
            combined = combined.len(),
            "universe built"
        );

        Universe {
            date,
            regime,
            portfolio,
            trending,
            regime_bucket,
            combined,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FixedRegimeDetector;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn buckets() -> BucketManager {
        BucketManager::new(BTreeMap::from([(
            "Risk Assets".to_string(),
            vec!["AAPL".to_string(), "NVDA".to_string(), "TSLA".to_string()],
        )]))
    }

    #[test]
    fn portfolio_always_included_even_below_confidence() {
        let buckets = buckets();
        let detector = FixedRegimeDetector::new(Regime::Goldilocks, ts())
            .with_buckets(Regime::Goldilocks, vec!["Risk Assets".to_string()])
            .with_trending("NVDA", 0.9)
            .with_trending("TSLA", 0.4);
        let builder = UniverseBuilder::new(&detector, &buckets);

        let positions = HashMap::from([("XOM".to_string(), 0.2)]);
        let universe = builder.build(ts(), &positions, Regime::Goldilocks, None, 0.7);

        // XOM is neither trending nor in a regime bucket but must be analysed.
        assert!(universe.portfolio.contains("XOM"));
        assert!(universe.trending.contains("XOM"));
        assert!(universe.combined.contains("XOM"));
        // NVDA passes the confidence floor, TSLA does not.
        assert!(universe.trending.contains("NVDA"));
        assert!(!universe.trending.contains("TSLA"));
        // TSLA still enters through the regime bucket.
        assert!(universe.combined.contains("TSLA"));
    }

    #[test]
    fn priorities_ranked_portfolio_trending_regime() {
        let buckets = buckets();
        let detector = FixedRegimeDetector::new(Regime::Goldilocks, ts())
            .with_buckets(Regime::Goldilocks, vec!["Risk Assets".to_string()])
            .with_trending("NVDA", 0.9);
        let builder = UniverseBuilder::new(&detector, &buckets);

        let positions = HashMap::from([("AAPL".to_string(), 0.3)]);
        let universe = builder.build(ts(), &positions, Regime::Goldilocks, None, 0.7);
        let prioritized: HashMap<String, AssetPriority> =
            universe.prioritized().into_iter().collect();

        assert_eq!(prioritized["AAPL"], AssetPriority::Portfolio);
        assert_eq!(prioritized["NVDA"], AssetPriority::Trending);
        assert_eq!(prioritized["TSLA"], AssetPriority::Regime);
    }

    #[test]
    fn blind_detector_falls_back_to_default_regime() {
        let buckets = buckets();
        let detector = FixedRegimeDetector::blind();
        let builder = UniverseBuilder::new(&detector, &buckets);

        let universe = builder.build(ts(), &HashMap::new(), Regime::Deflation, None, 0.7);
        assert_eq!(universe.regime, Regime::Deflation);
        assert!(universe.is_empty());
    }

    #[test]
    fn zero_weight_positions_are_not_portfolio() {
        let buckets = buckets();
        let detector = FixedRegimeDetector::new(Regime::Goldilocks, ts());
        let builder = UniverseBuilder::new(&detector, &buckets);

        let positions = HashMap::from([("AAPL".to_string(), 0.0)]);
        let universe = builder.build(ts(), &positions, Regime::Goldilocks, None, 0.7);
        assert!(universe.portfolio.is_empty());
    }
}
