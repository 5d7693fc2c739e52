// =============================================================================
// Core asset manager — high-alpha assets immune to closure
// =============================================================================
//
// Core assets are granted by explicit marking or by a high-score bucket
// override. While core, an asset cannot be closed or decreased by the
// pipeline. Core status is bounded:
//   - it expires after a configured number of days (extendable a limited
//     number of times), and
//   - it is revoked when the asset underperforms its bucket mean by more
//     than the configured threshold over the lookback window.
//
// Bucket membership comes from the BucketManager and returns from the
// injected DataProvider. Without a provider the underperformance check
// degrades to "no data" and never revokes.
//
// Revocations are applied by `lifecycle_check`, which must run once per
// rebalance cycle before any `is_core_asset` query; the query itself only
// adds an inline expiry test on top of registry state.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buckets::BucketManager;
use crate::events::{EventSink, PortfolioEvent};
use crate::providers::DataProvider;

/// Warning history per core asset is bounded to this many entries.
const MAX_PERFORMANCE_WARNINGS: usize = 10;

/// Minimum bucket peers (excluding the asset) with return data required for
/// a meaningful bucket-mean comparison.
const MIN_BUCKET_PEERS: usize = 2;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Lifecycle record for one core asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreAssetInfo {
    pub asset: String,
    pub designation_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    pub reason: String,
    pub bucket: String,
    pub designation_score: Option<f64>,
    pub extension_count: u32,
    pub last_performance_check: Option<DateTime<Utc>>,
    pub performance_warnings: Vec<String>,
}

/// Outcome of a lifecycle check for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleAction {
    Retained(String),
    Revoked(String),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct CoreAssetManager {
    enabled: bool,
    max_core_assets: usize,
    expiry_days: i64,
    extension_limit: u32,
    underperformance_threshold: f64,
    underperformance_period_days: i64,
    performance_check_frequency_days: i64,
    core_assets: BTreeMap<String, CoreAssetInfo>,
}

impl CoreAssetManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enabled: bool,
        max_core_assets: usize,
        expiry_days: i64,
        extension_limit: u32,
        underperformance_threshold: f64,
        underperformance_period_days: i64,
        performance_check_frequency_days: i64,
    ) -> Self {
        Self {
            enabled,
            max_core_assets,
            expiry_days,
            extension_limit,
            underperformance_threshold,
            underperformance_period_days,
            performance_check_frequency_days,
            core_assets: BTreeMap::new(),
        }
    }

    /// Mark an asset as core. Fails when management is disabled, the asset
    /// is already core, or the registry is full.
    pub fn mark_as_core(
        &mut self,
        asset: &str,
        date: DateTime<Utc>,
        reason: &str,
        designation_score: Option<f64>,
        buckets: &BucketManager,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if self.core_assets.contains_key(asset) {
            return false;
        }
        if self.core_assets.len() >= self.max_core_assets {
            warn!(
                asset,
                limit = self.max_core_assets,
                "core asset registry full, designation refused"
            );
            return false;
        }

        let expiry_date = date + Duration::days(self.expiry_days);
        self.core_assets.insert(
            asset.to_string(),
            CoreAssetInfo {
                asset: asset.to_string(),
                designation_date: date,
                expiry_date,
                reason: reason.to_string(),
                bucket: buckets.bucket_of(asset).to_string(),
                designation_score,
                extension_count: 0,
                last_performance_check: Some(date),
                performance_warnings: Vec::new(),
            },
        );

        info!(asset, %expiry_date, reason, "asset marked as core");
        true
    }

    /// Whether the asset currently holds core status. With a date, a lapsed
    /// expiry counts as not core even before the next lifecycle check
    /// removes the record.
    ///
    /// Only the expiry test runs inline. Performance-based revocation
    /// happens exclusively in [`Self::lifecycle_check`], so callers must
    /// run that once per cycle before querying, or an underperforming
    /// asset will still read as core. The engine does this at the top of
    /// every rebalance.
    pub fn is_core_asset(&self, asset: &str, date: Option<DateTime<Utc>>) -> bool {
        match (self.core_assets.get(asset), date) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(info), Some(date)) => date <= info.expiry_date,
        }
    }

    /// Core assets are exempt from grace period handling.
    pub fn should_exempt_from_grace(&self, asset: &str, date: DateTime<Utc>) -> bool {
        self.is_core_asset(asset, Some(date))
    }

    /// Manual revocation.
    pub fn revoke(&mut self, asset: &str, reason: &str) -> bool {
        match self.core_assets.remove(asset) {
            Some(_) => {
                info!(asset, reason, "core status manually revoked");
                true
            }
            None => false,
        }
    }

    /// Extend expiry by `additional_days` from `date`. Limited by the
    /// extension counter.
    pub fn extend(
        &mut self,
        asset: &str,
        additional_days: i64,
        date: DateTime<Utc>,
        reason: &str,
    ) -> bool {
        let Some(info) = self.core_assets.get_mut(asset) else {
            return false;
        };
        if info.extension_count >= self.extension_limit {
            warn!(
                asset,
                limit = self.extension_limit,
                "core extension limit reached"
            );
            return false;
        }
        info.expiry_date = date + Duration::days(additional_days);
        info.extension_count += 1;
        info!(asset, new_expiry = %info.expiry_date, reason, "core status extended");
        true
    }

    pub fn core_assets(&self) -> Vec<String> {
        self.core_assets.keys().cloned().collect()
    }

    pub fn info(&self, asset: &str) -> Option<&CoreAssetInfo> {
        self.core_assets.get(asset)
    }

    pub fn len(&self) -> usize {
        self.core_assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core_assets.is_empty()
    }

    // -------------------------------------------------------------------------
    // Lifecycle check
    // -------------------------------------------------------------------------

    /// Run expiry and underperformance auto-revocation over every core asset.
    /// Returns the action taken per asset.
    pub fn lifecycle_check(
        &mut self,
        date: DateTime<Utc>,
        buckets: &BucketManager,
        data: Option<&dyn DataProvider>,
        sink: &dyn EventSink,
    ) -> BTreeMap<String, LifecycleAction> {
        let mut actions = BTreeMap::new();
        let assets: Vec<String> = self.core_assets.keys().cloned().collect();

        for asset in assets {
            let expiry_date = self.core_assets[&asset].expiry_date;
            if date > expiry_date {
                let reason = format!("automatic expiry after {} days", self.expiry_days);
                self.auto_revoke(&asset, date, &reason, sink);
                actions.insert(asset, LifecycleAction::Revoked(reason));
                continue;
            }

            if !self.performance_check_due(&asset, date) {
                actions.insert(asset, LifecycleAction::Retained("no checks due".into()));
                continue;
            }

            match self.underperformance(&asset, date, buckets, data) {
                Some(gap) if gap > self.underperformance_threshold => {
                    self.issue_performance_warning(&asset, gap, date);
                    let reason = format!(
                        "underperformed bucket by {:.1}% over {} days (threshold {:.1}%)",
                        gap * 100.0,
                        self.underperformance_period_days,
                        self.underperformance_threshold * 100.0
                    );
                    self.auto_revoke(&asset, date, &reason, sink);
                    actions.insert(asset, LifecycleAction::Revoked(reason));
                }
                Some(gap) => {
                    self.stamp_performance_check(&asset, date);
                    actions.insert(
                        asset,
                        LifecycleAction::Retained(format!(
                            "performance acceptable (gap {:.1}%)",
                            gap * 100.0
                        )),
                    );
                }
                None => {
                    self.stamp_performance_check(&asset, date);
                    actions.insert(
                        asset,
                        LifecycleAction::Retained("insufficient return data".into()),
                    );
                }
            }
        }

        actions
    }

    /// Status report used by dashboards: expiring soon, extension
    /// candidates, warning counts.
    pub fn status_report(&self, date: DateTime<Utc>) -> CoreStatusReport {
        let mut report = CoreStatusReport {
            total_core_assets: self.core_assets.len(),
            max_core_assets: self.max_core_assets,
            expiring_soon: Vec::new(),
            extension_candidates: Vec::new(),
            assets_with_warnings: Vec::new(),
        };
        for (asset, info) in &self.core_assets {
            let days_until_expiry = (info.expiry_date - date).num_days();
            if days_until_expiry <= 7 {
                report.expiring_soon.push(asset.clone());
            }
            if days_until_expiry <= 14 && info.extension_count < self.extension_limit {
                report.extension_candidates.push(asset.clone());
            }
            if !info.performance_warnings.is_empty() {
                report.assets_with_warnings.push(asset.clone());
            }
        }
        report
    }

    fn performance_check_due(&self, asset: &str, date: DateTime<Utc>) -> bool {
        match self.core_assets.get(asset).and_then(|i| i.last_performance_check) {
            Some(last) => (date - last).num_days() >= self.performance_check_frequency_days,
            None => true,
        }
    }

    fn stamp_performance_check(&mut self, asset: &str, date: DateTime<Utc>) {
        if let Some(info) = self.core_assets.get_mut(asset) {
            info.last_performance_check = Some(date);
        }
    }

    /// Bucket-mean return minus asset return over the lookback window.
    /// `None` when returns are unavailable or the bucket is too thin.
    fn underperformance(
        &self,
        asset: &str,
        date: DateTime<Utc>,
        buckets: &BucketManager,
        data: Option<&dyn DataProvider>,
    ) -> Option<f64> {
        let data = data?;
        let info = self.core_assets.get(asset)?;
        let start = date - Duration::days(self.underperformance_period_days);

        let asset_return = data.asset_return(asset, start, date)?;

        let peer_returns: Vec<f64> = buckets
            .assets_in(&info.bucket)
            .iter()
            .filter(|peer| peer.as_str() != asset)
            .filter_map(|peer| data.asset_return(peer, start, date))
            .collect();
        if peer_returns.len() < MIN_BUCKET_PEERS {
            debug!(asset, bucket = %info.bucket, "bucket too thin for mean comparison");
            return None;
        }

        let bucket_mean = peer_returns.iter().sum::<f64>() / peer_returns.len() as f64;
        Some(bucket_mean - asset_return)
    }

    fn issue_performance_warning(&mut self, asset: &str, gap: f64, date: DateTime<Utc>) {
        if let Some(info) = self.core_assets.get_mut(asset) {
            info.performance_warnings.push(format!(
                "underperforming bucket {} by {:.1}% on {}",
                info.bucket,
                gap * 100.0,
                date.format("%Y-%m-%d")
            ));
            if info.performance_warnings.len() > MAX_PERFORMANCE_WARNINGS {
                let excess = info.performance_warnings.len() - MAX_PERFORMANCE_WARNINGS;
                info.performance_warnings.drain(..excess);
            }
            warn!(asset, gap, "core asset performance warning issued");
        }
    }

    fn auto_revoke(&mut self, asset: &str, date: DateTime<Utc>, reason: &str, sink: &dyn EventSink) {
        if let Some(info) = self.core_assets.remove(asset) {
            let days_core = (date - info.designation_date).num_days();
            info!(asset, days_core, reason, "core status auto-revoked");
            sink.emit(
                PortfolioEvent::new(date, "protection.core_asset_immunity", "revoke", reason)
                    .asset(asset)
                    .meta("days_core", days_core)
                    .meta("bucket", info.bucket.clone()),
            );
        }
    }
}

/// Dashboard summary of the core registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreStatusReport {
    pub total_core_assets: usize,
    pub max_core_assets: usize,
    pub expiring_soon: Vec<String>,
    pub extension_candidates: Vec<String>,
    pub assets_with_warnings: Vec<String>,
}

// =============================================================================
// Tests
// =============================================================================
