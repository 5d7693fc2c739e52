// =============================================================================
// External collaborator interfaces
// =============================================================================
//
// The engine never reaches out to data feeds itself. Price history, indicator
// computation, fundamental research and regime detection are all supplied by
// the caller through the narrow traits below. Each trait carries a fixed-map
// implementation used by tests and by backtests that precompute their inputs.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Regime, RegimeState, RegimeTransition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Raised by an analyzer when it cannot produce a score. The scoring service
/// degrades to a neutral score and flags the asset as missing data.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DataError(pub String);

impl DataError {
    pub fn missing(what: impl Into<String>) -> Self {
        Self(what.into())
    }
}

// ---------------------------------------------------------------------------
// Analyzer traits
// ---------------------------------------------------------------------------

/// Produces a technical score in [0.0, 1.0] for an asset on a date.
pub trait TechnicalAnalyzer: Send + Sync {
    fn score(&self, asset: &str, date: DateTime<Utc>) -> Result<f64, DataError>;
}

/// Produces a fundamental score in [0.0, 1.0] for an asset on a date,
/// conditioned on the prevailing regime.
pub trait FundamentalAnalyzer: Send + Sync {
    fn score(&self, asset: &str, date: DateTime<Utc>, regime: Regime) -> Result<f64, DataError>;
}

/// Supplies asset returns for core-asset performance comparisons.
pub trait DataProvider: Send + Sync {
    /// Return over the period as a decimal (0.10 = +10%), or `None` when the
    /// provider has no data for the asset.
    fn asset_return(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// Regime detection
// ---------------------------------------------------------------------------

/// Trending opportunity surfaced by the regime detector.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendingCandidate {
    pub asset: String,
    pub confidence: f64,
}

/// Adapter over an external macro-regime detector.
pub trait RegimeDetector: Send + Sync {
    /// Current regime classification, or `None` when the detector has no
    /// view for the date. Callers fall back to a default regime.
    fn current(&self, date: DateTime<Utc>) -> Option<RegimeState>;

    /// Most recent regime transition near the date, if any.
    fn transition(&self, date: DateTime<Utc>) -> Option<RegimeTransition>;

    /// Bucket names appropriate for a regime.
    fn regime_buckets(&self, regime: Regime) -> Vec<String>;

    /// Trending candidates drawn from the supplied asset pool, filtered by
    /// the detector's own confidence model.
    fn trending(
        &self,
        date: DateTime<Utc>,
        candidates: &[String],
        min_confidence: f64,
    ) -> Vec<TrendingCandidate>;
}

// =============================================================================
// Fixed-map implementations
// =============================================================================

/// Technical analyzer backed by a fixed score map.
#[derive(Debug, Clone, Default)]
pub struct FixedTechnicalAnalyzer {
    scores: HashMap<String, f64>,
    fallback: Option<f64>,
}

impl FixedTechnicalAnalyzer {
    pub fn new(scores: HashMap<String, f64>) -> Self {
        Self {
            scores,
            fallback: None,
        }
    }

    /// Score returned for assets absent from the map. Without it, unknown
    /// assets produce a `DataError`.
    pub fn with_fallback(mut self, score: f64) -> Self {
        self.fallback = Some(score);
        self
    }
}

impl TechnicalAnalyzer for FixedTechnicalAnalyzer {
    fn score(&self, asset: &str, _date: DateTime<Utc>) -> Result<f64, DataError> {
        self.scores
            .get(asset)
            .copied()
            .or(self.fallback)
            .ok_or_else(|| DataError::missing(format!("no technical data for {asset}")))
    }
}

/// Fundamental analyzer backed by a fixed score map.
#[derive(Debug, Clone, Default)]
pub struct FixedFundamentalAnalyzer {
    scores: HashMap<String, f64>,
    fallback: Option<f64>,
}

impl FixedFundamentalAnalyzer {
    pub fn new(scores: HashMap<String, f64>) -> Self {
        Self {
            scores,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, score: f64) -> Self {
        self.fallback = Some(score);
        self
    }
}

impl FundamentalAnalyzer for FixedFundamentalAnalyzer {
    fn score(&self, asset: &str, _date: DateTime<Utc>, _regime: Regime) -> Result<f64, DataError> {
        self.scores
            .get(asset)
            .copied()
            .or(self.fallback)
            .ok_or_else(|| DataError::missing(format!("no fundamental data for {asset}")))
    }
}

/// Return provider backed by a fixed per-asset return map.
#[derive(Debug, Clone, Default)]
pub struct FixedDataProvider {
    returns: HashMap<String, f64>,
}

impl FixedDataProvider {
    pub fn new(returns: HashMap<String, f64>) -> Self {
        Self { returns }
    }
}

impl DataProvider for FixedDataProvider {
    fn asset_return(
        &self,
        asset: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Option<f64> {
        self.returns.get(asset).copied()
    }
}

/// Regime detector with a static view, for tests and replayed backtests.
#[derive(Debug, Clone)]
pub struct FixedRegimeDetector {
    pub state: Option<RegimeState>,
    pub recent_transition: Option<RegimeTransition>,
    pub buckets_by_regime: HashMap<Regime, Vec<String>>,
    pub trending_candidates: Vec<TrendingCandidate>,
}

impl FixedRegimeDetector {
    pub fn new(regime: Regime, detected_at: DateTime<Utc>) -> Self {
        Self {
            state: Some(RegimeState::new(regime, detected_at)),
            recent_transition: None,
            buckets_by_regime: HashMap::new(),
            trending_candidates: Vec::new(),
        }
    }

    /// Detector with no regime view at all; callers fall back to a default.
    pub fn blind() -> Self {
        Self {
            state: None,
            recent_transition: None,
            buckets_by_regime: HashMap::new(),
            trending_candidates: Vec::new(),
        }
    }

    pub fn with_transition(mut self, transition: RegimeTransition) -> Self {
        self.recent_transition = Some(transition);
        self
    }

    pub fn with_buckets(mut self, regime: Regime, buckets: Vec<String>) -> Self {
        self.buckets_by_regime.insert(regime, buckets);
        self
    }

    pub fn with_trending(mut self, asset: &str, confidence: f64) -> Self {
        self.trending_candidates.push(TrendingCandidate {
            asset: asset.to_string(),
            confidence,
        });
        self
    }
}

impl RegimeDetector for FixedRegimeDetector {
    fn current(&self, _date: DateTime<Utc>) -> Option<RegimeState> {
        self.state
    }

    fn transition(&self, _date: DateTime<Utc>) -> Option<RegimeTransition> {
        self.recent_transition.clone()
    }

    fn regime_buckets(&self, regime: Regime) -> Vec<String> {
        self.buckets_by_regime
            .get(&regime)
            .cloned()
            .unwrap_or_default()
    }

    fn trending(
        &self,
        _date: DateTime<Utc>,
        candidates: &[String],
        min_confidence: f64,
    ) -> Vec<TrendingCandidate> {
        self.trending_candidates
            .iter()
            .filter(|c| c.confidence >= min_confidence)
            .filter(|c| candidates.is_empty() || candidates.contains(&c.asset))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
