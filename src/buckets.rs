// =============================================================================
// Bucket directory — read-only asset grouping
// =============================================================================
//
// Buckets are named risk groups ("Risk Assets", "Defensive Assets", ...).
// The directory is the single source of truth for asset-to-bucket lookups:
// every diversification and core-asset component resolves buckets through it
// and never keeps its own table. An asset belongs to at most one bucket;
// unmapped assets report the sentinel `UNKNOWN_BUCKET`.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::scoring::AssetScore;

/// Bucket reported for assets absent from the directory.
pub const UNKNOWN_BUCKET: &str = "Unknown";

/// Aggregate statistics for one bucket over a scored selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStatistics {
    pub bucket: String,
    pub asset_count: usize,
    pub total_allocation: f64,
    pub assets: Vec<String>,
    pub avg_score: f64,
    pub max_score: f64,
    pub min_score: f64,
}

/// Read-only directory mapping assets to buckets and back.
#[derive(Debug, Clone, Default)]
pub struct BucketManager {
    buckets: BTreeMap<String, Vec<String>>,
    asset_index: HashMap<String, String>,
}

impl BucketManager {
    /// Build the directory from bucket -> assets. If an asset appears in
    /// several buckets, the first (alphabetical bucket order) wins.
    pub fn new(buckets: BTreeMap<String, Vec<String>>) -> Self {
        let mut asset_index = HashMap::new();
        for (bucket, assets) in &buckets {
            for asset in assets {
                asset_index
                    .entry(asset.clone())
                    .or_insert_with(|| bucket.clone());
            }
        }
        Self {
            buckets,
            asset_index,
        }
    }

    /// Bucket for an asset, or `UNKNOWN_BUCKET` when unmapped.
    pub fn bucket_of(&self, asset: &str) -> &str {
        self.asset_index
            .get(asset)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_BUCKET)
    }

    /// All assets in a bucket. Empty for unknown buckets.
    pub fn assets_in(&self, bucket: &str) -> &[String] {
        self.buckets.get(bucket).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Union of assets across the named buckets, sorted and deduplicated.
    pub fn assets_from_buckets(&self, names: &[String]) -> Vec<String> {
        let mut assets: Vec<String> = names
            .iter()
            .flat_map(|name| self.assets_in(name).iter().cloned())
            .collect();
        assets.sort();
        assets.dedup();
        assets
    }

    /// Group scored assets by bucket, each group sorted by descending score.
    pub fn group_scores<'a>(&self, scores: &'a [AssetScore]) -> BTreeMap<String, Vec<&'a AssetScore>> {
        let mut groups: BTreeMap<String, Vec<&AssetScore>> = BTreeMap::new();
        for score in scores {
            groups
                .entry(self.bucket_of(&score.asset).to_string())
                .or_default()
                .push(score);
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| {
                b.combined
                    .partial_cmp(&a.combined)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        groups
    }

    /// Per-bucket statistics over a scored selection, using the attached
    /// position sizes for allocation totals.
    pub fn statistics(
        &self,
        scores: &[AssetScore],
        sizes: &HashMap<String, f64>,
    ) -> BTreeMap<String, BucketStatistics> {
        let mut stats = BTreeMap::new();
        for (bucket, group) in self.group_scores(scores) {
            let combined: Vec<f64> = group.iter().map(|s| s.combined).collect();
            let total_allocation = group
                .iter()
                .map(|s| sizes.get(&s.asset).copied().unwrap_or(0.0))
                .sum();
            stats.insert(
                bucket.clone(),
                BucketStatistics {
                    bucket,
                    asset_count: group.len(),
                    total_allocation,
                    assets: group.iter().map(|s| s.asset.clone()).collect(),
                    avg_score: combined.iter().sum::<f64>() / combined.len() as f64,
                    max_score: combined.iter().cloned().fold(f64::MIN, f64::max),
                    min_score: combined.iter().cloned().fold(f64::MAX, f64::min),
                },
            );
        }
        stats
    }
}

// =============================================================================
// Tests
// =============================================================================
