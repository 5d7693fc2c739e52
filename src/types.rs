// =============================================================================
// Shared types used across the Aurora rebalancing engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Macro regime
// ---------------------------------------------------------------------------

/// Macro market regime classification supplied by the regime detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Regime {
    /// Growth up, inflation down. Risk assets favoured.
    Goldilocks,
    /// Growth down, inflation down. Defensives and duration favoured.
    Deflation,
    /// Growth down, inflation up. Real assets favoured.
    Inflation,
    /// Growth up, inflation up. Cyclicals and commodities favoured.
    Reflation,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Goldilocks => write!(f, "Goldilocks"),
            Self::Deflation => write!(f, "Deflation"),
            Self::Inflation => write!(f, "Inflation"),
            Self::Reflation => write!(f, "Reflation"),
        }
    }
}

/// Snapshot of the detected regime plus the detector's quality metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    /// Detector confidence in the classification [0.0, 1.0].
    pub confidence: f64,
    /// How long-lived the regime looks [0.0, 1.0].
    pub stability: f64,
    /// Strength of the regime signal [0.0, 1.0].
    pub strength: f64,
    pub detected_at: DateTime<Utc>,
}

impl RegimeState {
    pub fn new(regime: Regime, detected_at: DateTime<Utc>) -> Self {
        Self {
            regime,
            confidence: 1.0,
            stability: 1.0,
            strength: 1.0,
            detected_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Regime transitions
// ---------------------------------------------------------------------------

/// Graduated impact label on a regime transition. Severity decides which
/// protection systems a transition is allowed to override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSeverity {
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TransitionSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Immutable record of a regime change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeTransition {
    pub from: Regime,
    pub to: Regime,
    pub date: DateTime<Utc>,
    pub severity: TransitionSeverity,
    /// Transition momentum [0.0, 1.0].
    pub momentum: f64,
    /// Detector confidence in the transition [0.0, 1.0].
    pub confidence: f64,
    /// Indicator names that triggered the transition.
    pub triggers: Vec<String>,
}

impl RegimeTransition {
    pub fn is_high_impact(&self) -> bool {
        self.severity >= TransitionSeverity::High
    }
}

// ---------------------------------------------------------------------------
// Universe priority
// ---------------------------------------------------------------------------

/// Ordering tier for an asset inside the rebalancing universe. Lower
/// discriminant wins, so sorting ascending puts portfolio assets first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetPriority {
    /// Current position. Always analysed.
    Portfolio,
    /// Trending opportunity surfaced by the regime detector.
    Trending,
    /// Member of a regime-appropriate bucket.
    Regime,
    /// Backup asset.
    Fallback,
}

impl std::fmt::Display for AssetPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Portfolio => write!(f, "portfolio"),
            Self::Trending => write!(f, "trending"),
            Self::Regime => write!(f, "regime"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

// ---------------------------------------------------------------------------
// Rebalancing targets
// ---------------------------------------------------------------------------

/// Instruction emitted for a single asset at the end of a rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetAction {
    Open,
    Close,
    Increase,
    Decrease,
    Hold,
}

impl std::fmt::Display for TargetAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::Increase => write!(f, "increase"),
            Self::Decrease => write!(f, "decrease"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Relative change beyond which a position adjustment is classified as an
/// increase or decrease rather than a hold.
pub const ACTION_CHANGE_THRESHOLD: f64 = 0.05;

/// Final rebalancing output for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancingTarget {
    pub asset: String,
    /// Desired portfolio weight [0.0, 1.0].
    pub target_weight: f64,
    /// Weight before the rebalance [0.0, 1.0].
    pub current_weight: f64,
    pub action: TargetAction,
    pub priority: AssetPriority,
    pub score: f64,
    pub reason: String,
}

impl RebalancingTarget {
    /// Classify the action from current and target weights.
    pub fn classify_action(current: f64, target: f64) -> TargetAction {
        if current <= 0.0 && target > 0.0 {
            TargetAction::Open
        } else if target <= 0.0 && current > 0.0 {
            TargetAction::Close
        } else if current > 0.0 && (target - current).abs() / current > ACTION_CHANGE_THRESHOLD {
            if target > current {
                TargetAction::Increase
            } else {
                TargetAction::Decrease
            }
        } else {
            TargetAction::Hold
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
