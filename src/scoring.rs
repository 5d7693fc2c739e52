// =============================================================================
// Scoring service — regime-aware composite asset scoring
// =============================================================================
//
// Combines technical and fundamental sub-scores into one score per asset:
//
//   combined = w_t * technical + w_f * fundamental
//
// with weight renormalisation when one side is disabled or returns no data,
// a 2% incumbent bias for existing positions, and per-regime multipliers.
// Analyzer failures never abort the rebalance: the failing side scores 0.0
// and the asset is flagged as missing data with reduced confidence.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RebalanceError;
use crate::events::{EventSink, PortfolioEvent};
use crate::providers::{FundamentalAnalyzer, TechnicalAnalyzer};
use crate::types::{AssetPriority, Regime};
use crate::universe::Universe;

// ---------------------------------------------------------------------------
// Score record
// ---------------------------------------------------------------------------

/// Multiplicative bias applied to incumbents to avoid churn on ties.
const INCUMBENT_BIAS: f64 = 1.02;

/// Composite score for one asset in one rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetScore {
    pub asset: String,
    pub date: DateTime<Utc>,
    pub technical: f64,
    pub fundamental: f64,
    pub combined: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub priority: AssetPriority,
    pub is_current_position: bool,
    pub previous_allocation: f64,
    pub reason: String,
    /// Which analyzers degraded for this asset, empty when all data arrived.
    pub missing_data: Vec<String>,
}

impl AssetScore {
    /// Minimal score record for unit tests.
    #[cfg(test)]
    pub(crate) fn stub(
        asset: &str,
        date: DateTime<Utc>,
        regime: Regime,
        priority: AssetPriority,
        combined: f64,
    ) -> Self {
        Self {
            asset: asset.to_string(),
            date,
            technical: combined,
            fundamental: combined,
            combined,
            confidence: 0.8,
            regime,
            priority,
            is_current_position: priority == AssetPriority::Portfolio,
            previous_allocation: 0.0,
            reason: String::new(),
            missing_data: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Composite scoring configuration plus regime multipliers.
#[derive(Debug)]
pub struct ScoringService {
    pub enable_technical: bool,
    pub enable_fundamental: bool,
    pub technical_weight: f64,
    pub fundamental_weight: f64,
    regime_multipliers: BTreeMap<Regime, f64>,
}

impl ScoringService {
    /// Build a scoring service. At least one analysis side must be enabled.
    pub fn new(
        enable_technical: bool,
        enable_fundamental: bool,
        technical_weight: f64,
        fundamental_weight: f64,
    ) -> Result<Self, RebalanceError> {
        if !enable_technical && !enable_fundamental {
            return Err(RebalanceError::config(
                "at least one analysis type must be enabled",
            ));
        }
        if technical_weight < 0.0 || fundamental_weight < 0.0 {
            return Err(RebalanceError::config("analysis weights must be >= 0"));
        }
        if enable_technical && enable_fundamental && technical_weight + fundamental_weight <= 0.0 {
            return Err(RebalanceError::config("analysis weights must not both be 0"));
        }

        Ok(Self {
            enable_technical,
            enable_fundamental,
            technical_weight,
            fundamental_weight,
            regime_multipliers: BTreeMap::from([
                (Regime::Goldilocks, 1.10),
                (Regime::Reflation, 1.05),
                (Regime::Inflation, 0.95),
                (Regime::Deflation, 0.90),
            ]),
        })
    }

    /// Override the multiplier applied to combined scores under a regime.
    pub fn set_regime_multiplier(&mut self, regime: Regime, multiplier: f64) {
        self.regime_multipliers.insert(regime, multiplier);
    }

    pub fn regime_multiplier(&self, regime: Regime) -> f64 {
        self.regime_multipliers.get(&regime).copied().unwrap_or(1.0)
    }

    /// Score every asset in the universe, portfolio assets first.
    pub fn score_universe(
        &self,
        universe: &Universe,
        current_positions: &std::collections::HashMap<String, f64>,
        technical: Option<&dyn TechnicalAnalyzer>,
        fundamental: Option<&dyn FundamentalAnalyzer>,
        sink: &dyn EventSink,
    ) -> Vec<AssetScore> {
        let mut scored = Vec::with_capacity(universe.combined.len());

        for (asset, priority) in universe.prioritized() {
            let previous_allocation = current_positions.get(&asset).copied().unwrap_or(0.0);
            let score = self.score_asset(
                &asset,
                universe.date,
                universe.regime,
                priority,
                previous_allocation,
                technical,
                fundamental,
            );

            sink.emit(
                PortfolioEvent::new(universe.date, "scoring.asset_scored", "score", score.reason.clone())
                    .asset(&score.asset)
                    .regime(universe.regime)
                    .scores(None, Some(score.combined))
                    .meta("priority", score.priority.to_string())
                    .meta("confidence", score.confidence),
            );

            scored.push(score);
        }

        debug!(assets = scored.len(), regime = %universe.regime, "universe scored");
        scored
    }

    fn score_asset(
        &self,
        asset: &str,
        date: DateTime<Utc>,
        regime: Regime,
        priority: AssetPriority,
        previous_allocation: f64,
        technical: Option<&dyn TechnicalAnalyzer>,
        fundamental: Option<&dyn FundamentalAnalyzer>,
    ) -> AssetScore {
        let mut missing_data = Vec::new();

        let technical_score = if self.enable_technical {
            match technical {
                Some(analyzer) => match analyzer.score(asset, date) {
                    Ok(value) => value.clamp(0.0, 1.0),
                    Err(err) => {
                        warn!(asset, error = %err, "technical analyzer degraded");
                        missing_data.push(format!("technical: {err}"));
                        0.0
                    }
                },
                None => {
                    missing_data.push("technical: analyzer not wired".to_string());
                    0.0
                }
            }
        } else {
            0.0
        };

        let fundamental_score = if self.enable_fundamental {
            match fundamental {
                Some(analyzer) => match analyzer.score(asset, date, regime) {
                    Ok(value) => value.clamp(0.0, 1.0),
                    Err(err) => {
                        warn!(asset, error = %err, "fundamental analyzer degraded");
                        missing_data.push(format!("fundamental: {err}"));
                        0.0
                    }
                },
                None => {
                    missing_data.push("fundamental: analyzer not wired".to_string());
                    0.0
                }
            }
        } else {
            0.0
        };

        // Effective weights: renormalise when one side is disabled, and fall
        // back to technical-only when fundamental data is absent.
        let (w_tech, w_fund) = if !self.enable_technical {
            (0.0, 1.0)
        } else if !self.enable_fundamental {
            (1.0, 0.0)
        } else if fundamental_score == 0.0 && technical_score > 0.0 {
            (1.0, 0.0)
        } else {
            let sum = self.technical_weight + self.fundamental_weight;
            (self.technical_weight / sum, self.fundamental_weight / sum)
        };

        let mut combined = technical_score * w_tech + fundamental_score * w_fund;

        // Incumbent bias, capped so the boost alone cannot push past 1.0.
        let is_current_position = previous_allocation > 0.0;
        if priority == AssetPriority::Portfolio && is_current_position {
            combined = (combined * INCUMBENT_BIAS).min(1.0);
        }

        combined = (combined * self.regime_multiplier(regime)).clamp(0.0, 1.0);

        let confidence = if missing_data.is_empty() { 0.8 } else { 0.6 };

        AssetScore {
            asset: asset.to_string(),
            date,
            technical: technical_score,
            fundamental: fundamental_score,
            combined,
            confidence,
            regime,
            priority,
            is_current_position,
            previous_allocation,
            reason: format!(
                "tech {:.0}% ({technical_score:.2}), fund {:.0}% ({fundamental_score:.2})",
                w_tech * 100.0,
                w_fund * 100.0
            ),
            missing_data,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::providers::{FixedFundamentalAnalyzer, FixedRegimeDetector, FixedTechnicalAnalyzer};
    use crate::universe::UniverseBuilder;
    use crate::BucketManager;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn universe_of(positions: &HashMap<String, f64>) -> Universe {
        let buckets = BucketManager::default();
        let detector = FixedRegimeDetector::new(Regime::Inflation, ts());
        UniverseBuilder::new(&detector, &buckets).build(ts(), positions, Regime::Inflation, None, 0.7)
    }

    #[test]
    fn both_analyzers_disabled_is_a_configuration_error() {
        let err = ScoringService::new(false, false, 0.6, 0.4).unwrap_err();
        assert!(matches!(err, RebalanceError::Configuration(_)));
    }

    #[test]
    fn combined_score_uses_configured_weights() {
        let mut service = ScoringService::new(true, true, 0.6, 0.4).unwrap();
        service.set_regime_multiplier(Regime::Inflation, 1.0);

        let technical = FixedTechnicalAnalyzer::new(HashMap::from([("AAPL".to_string(), 0.8)]));
        let fundamental = FixedFundamentalAnalyzer::new(HashMap::from([("AAPL".to_string(), 0.5)]));

        let positions = HashMap::from([("AAPL".to_string(), 0.1)]);
        let universe = universe_of(&positions);
        let scored = service.score_universe(
            &universe,
            &positions,
            Some(&technical),
            Some(&fundamental),
            &NullEventSink,
        );

        assert_eq!(scored.len(), 1);
        let score = &scored[0];
        // (0.6*0.8 + 0.4*0.5) * 1.02 incumbent bias
        let expected = (0.6 * 0.8 + 0.4 * 0.5) * 1.02;
        assert!((score.combined - expected).abs() < 1e-9, "got {}", score.combined);
        assert!((score.confidence - 0.8).abs() < 1e-12);
        assert!(score.is_current_position);
    }

    #[test]
    fn missing_fundamental_falls_back_to_technical_only() {
        let mut service = ScoringService::new(true, true, 0.6, 0.4).unwrap();
        service.set_regime_multiplier(Regime::Inflation, 1.0);

        let technical = FixedTechnicalAnalyzer::new(HashMap::from([("AAPL".to_string(), 0.8)]));
        // Fundamental analyzer knows nothing about AAPL.
        let fundamental = FixedFundamentalAnalyzer::new(HashMap::new());

        let positions = HashMap::from([("AAPL".to_string(), 0.1)]);
        let universe = universe_of(&positions);
        let scored = service.score_universe(
            &universe,
            &positions,
            Some(&technical),
            Some(&fundamental),
            &NullEventSink,
        );

        let score = &scored[0];
        // Technical weight renormalised to 1.0, then incumbent bias.
        assert!((score.combined - 0.8 * 1.02).abs() < 1e-9);
        assert_eq!(score.missing_data.len(), 1);
        assert!((score.confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn disabled_fundamental_renormalises_weights() {
        let mut service = ScoringService::new(true, false, 0.6, 0.4).unwrap();
        service.set_regime_multiplier(Regime::Inflation, 1.0);

        let technical = FixedTechnicalAnalyzer::new(HashMap::from([("NVDA".to_string(), 0.7)]));
        let positions = HashMap::new();
        let mut universe = universe_of(&positions);
        universe.trending.insert("NVDA".to_string());
        universe.combined.insert("NVDA".to_string());

        let scored =
            service.score_universe(&universe, &positions, Some(&technical), None, &NullEventSink);
        assert!((scored[0].combined - 0.7).abs() < 1e-9);
        // Non-incumbent, so confidence is the full-data value even with the
        // fundamental side disabled.
        assert!(scored[0].missing_data.is_empty());
    }

    #[test]
    fn regime_multiplier_scales_and_clamps() {
        let service = ScoringService::new(true, true, 0.5, 0.5).unwrap();
        assert!((service.regime_multiplier(Regime::Goldilocks) - 1.10).abs() < 1e-12);
        assert!((service.regime_multiplier(Regime::Deflation) - 0.90).abs() < 1e-12);

        let technical = FixedTechnicalAnalyzer::new(HashMap::from([("AAPL".to_string(), 0.98)]));
        let fundamental = FixedFundamentalAnalyzer::new(HashMap::from([("AAPL".to_string(), 0.98)]));

        let buckets = BucketManager::default();
        let detector = FixedRegimeDetector::new(Regime::Goldilocks, ts());
        let positions = HashMap::from([("AAPL".to_string(), 0.2)]);
        let universe = UniverseBuilder::new(&detector, &buckets).build(
            ts(),
            &positions,
            Regime::Goldilocks,
            None,
            0.7,
        );
        let scored = service.score_universe(
            &universe,
            &positions,
            Some(&technical),
            Some(&fundamental),
            &NullEventSink,
        );
        // 0.98 * 1.02 * 1.10 would exceed 1.0, so the score clamps.
        assert!((scored[0].combined - 1.0).abs() < 1e-12);
    }
}
