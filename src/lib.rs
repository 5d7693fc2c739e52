// =============================================================================
// Aurora Rebalancer — portfolio rebalancing decision engine
// =============================================================================
//
// Given current holdings, a detected macro regime, a bucketed asset universe
// and per-asset scores, the engine produces rebalancing targets: desired
// weight, action (open / close / increase / decrease / hold) and an
// auditable reason per asset.
//
// Pipeline layers:
//   L1 universe        — portfolio + trending + regime-bucket assets
//   L2 scoring         — weighted technical/fundamental composite
//   L3 diversification — bucket caps, smart overrides with core promotion
//   L4 protection      — core immunity, grace, holding, whipsaw, regime
//                        overrides, orchestrated with a priority hierarchy
//   L5 sizing          — dynamic sizing then two-stage caps and residuals
//
// Data feeds, indicator computation, regime detection and event storage are
// external: callers wire them in through the `providers` traits and the
// `EventSink` interface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
pub mod buckets;
pub mod config;
pub mod diversification;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod protection;
pub mod providers;
pub mod scoring;
pub mod selection;
pub mod sizing;
pub mod types;
pub mod universe;

pub use buckets::{BucketManager, BucketStatistics, UNKNOWN_BUCKET};
pub use config::RebalancePolicy;
pub use engine::{RebalanceReport, RebalanceRequest, RebalancerEngine};
pub use error::RebalanceError;
pub use events::{EventSink, MemoryEventSink, NullEventSink, PortfolioEvent};
pub use providers::{
    DataProvider, FundamentalAnalyzer, RegimeDetector, TechnicalAnalyzer, TrendingCandidate,
};
pub use scoring::AssetScore;
pub use types::{
    AssetPriority, RebalancingTarget, Regime, RegimeState, RegimeTransition, TargetAction,
    TransitionSeverity,
};
