// =============================================================================
// Rebalancer engine — top-level pipeline coordinator
// =============================================================================
//
// One `rebalance` call runs the full decision pipeline, synchronously and in
// a fixed order:
//
//   universe -> scoring -> bucket limits -> regime context -> core lifecycle
//   -> smart diversification -> selection -> sizing (dynamic, two-stage)
//   -> bucket allocation caps -> targets -> final protection gate -> events
//
// The engine owns every piece of mutable state (core registry, grace
// registry, position ages, whipsaw history, lifecycle states, context
// cache). All of it is touched only on the thread running `rebalance`;
// concurrent rebalances on one engine are unsupported.
//
// The engine decides, the caller executes. Trades actually placed are
// reported back through `confirm_execution`, which is what advances the
// whipsaw history and position-age registries.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buckets::BucketManager;
use crate::config::RebalancePolicy;
use crate::diversification::{BucketLimitsConfig, BucketLimitsEnforcer, SmartDiversificationManager};
use crate::error::RebalanceError;
use crate::events::{EventSink, PortfolioEvent, SessionStats};
use crate::protection::core_assets::CoreAssetManager;
use crate::protection::grace::GracePeriodManager;
use crate::protection::holding::HoldingPeriodManager;
use crate::protection::regime_context::{RegimeContext, RegimeContextProvider};
use crate::protection::whipsaw::{PositionEventKind, WhipsawProtectionManager};
use crate::protection::{
    ProtectionAction, ProtectionOrchestrator, ProtectionRequest, ProtectionSystems,
};
use crate::providers::{DataProvider, FundamentalAnalyzer, RegimeDetector, TechnicalAnalyzer};
use crate::scoring::ScoringService;
use crate::selection::{build_targets, SelectionService};
use crate::sizing::{
    DynamicPositionSizer, SizeCategory, SizedAsset, TwoStagePositionSizer, CASH_EQUIVALENT,
};
use crate::types::{RebalancingTarget, Regime, TargetAction};
use crate::universe::UniverseBuilder;

// ---------------------------------------------------------------------------
// Request / report records
// ---------------------------------------------------------------------------

/// Input to one rebalance run.
#[derive(Debug, Clone)]
pub struct RebalanceRequest {
    pub date: DateTime<Utc>,
    /// Current portfolio weights by asset.
    pub current_positions: HashMap<String, f64>,
    /// Narrow the regime-bucket universe to these buckets.
    pub bucket_filter: Option<Vec<String>>,
    pub min_trending_confidence: f64,
    pub enable_technical: bool,
    pub enable_fundamental: bool,
    pub technical_weight: f64,
    pub fundamental_weight: f64,
}

impl RebalanceRequest {
    pub fn new(date: DateTime<Utc>, current_positions: HashMap<String, f64>) -> Self {
        Self {
            date,
            current_positions,
            bucket_filter: None,
            min_trending_confidence: 0.7,
            enable_technical: true,
            enable_fundamental: true,
            technical_weight: 0.6,
            fundamental_weight: 0.4,
        }
    }
}

/// JSON-ready view of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub asset: String,
    pub target_allocation_pct: f64,
    pub current_allocation_pct: f64,
    pub action: TargetAction,
    pub priority: crate::types::AssetPriority,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub total_targets: usize,
    pub actions_summary: BTreeMap<String, usize>,
    /// Sum of target weights over non-close targets.
    pub total_target_allocation: f64,
    pub timestamp: DateTime<Utc>,
}

/// Serialisable summary of a rebalance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub rebalancing_targets: Vec<TargetReport>,
    pub metadata: ReportMetadata,
}

impl RebalanceReport {
    pub fn from_targets(targets: &[RebalancingTarget], timestamp: DateTime<Utc>) -> Self {
        let mut actions_summary = BTreeMap::new();
        let mut total_target_allocation = 0.0;
        for target in targets {
            *actions_summary.entry(target.action.to_string()).or_insert(0) += 1;
            if target.action != TargetAction::Close {
                total_target_allocation += target.target_weight;
            }
        }
        Self {
            rebalancing_targets: targets
                .iter()
                .map(|t| TargetReport {
                    asset: t.asset.clone(),
                    target_allocation_pct: round4(t.target_weight),
                    current_allocation_pct: round4(t.current_weight),
                    action: t.action,
                    priority: t.priority,
                    score: round4(t.score),
                    reason: t.reason.clone(),
                })
                .collect(),
            metadata: ReportMetadata {
                total_targets: targets.len(),
                actions_summary,
                total_target_allocation: round4(total_target_allocation),
                timestamp,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn round4(value: f64) -> f64 {
    (value * 1e4).round() / 1e4
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RebalancerEngine {
    policy: RebalancePolicy,
    buckets: BucketManager,
    detector: Box<dyn RegimeDetector>,
    technical: Option<Box<dyn TechnicalAnalyzer>>,
    fundamental: Option<Box<dyn FundamentalAnalyzer>>,
    data: Option<Box<dyn DataProvider>>,
    sink: Arc<dyn EventSink>,
    default_regime: Regime,
    regime_multiplier_overrides: Vec<(Regime, f64)>,

    core_assets: CoreAssetManager,
    grace: GracePeriodManager,
    holding: HoldingPeriodManager,
    whipsaw: WhipsawProtectionManager,
    regime_context: RegimeContextProvider,
    lifecycle: crate::lifecycle::PositionLifecycleTracker,
    orchestrator: ProtectionOrchestrator,
    smart: SmartDiversificationManager,
    selection: SelectionService,
}

impl RebalancerEngine {
    /// Build an engine from a validated policy. Fails with a configuration
    /// error when any policy knob is out of range.
    pub fn new(
        policy: RebalancePolicy,
        buckets: BucketManager,
        detector: Box<dyn RegimeDetector>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, RebalanceError> {
        policy.validate()?;

        let core_assets = CoreAssetManager::new(
            policy.enable_core_asset_management,
            policy.max_core_assets,
            policy.core_asset_expiry_days,
            policy.core_asset_extension_limit,
            policy.core_asset_underperformance_threshold,
            policy.core_asset_underperformance_period,
            policy.performance_check_frequency_days,
        );
        let grace = GracePeriodManager::new(
            policy.grace_period_days,
            policy.grace_decay_rate,
            policy.min_decay_factor,
        );
        let holding = HoldingPeriodManager::new(
            policy.min_holding_period_days,
            policy.max_holding_period_days,
            policy.enable_regime_overrides,
            policy.regime_override_cooldown_days,
        );
        let whipsaw = WhipsawProtectionManager::new(
            policy.max_cycles_per_protection_period,
            policy.whipsaw_protection_days,
            policy.min_position_duration_hours,
        );
        let regime_context = RegimeContextProvider::new(
            policy.regime_context_cache_hours,
            policy.regime_severity_threshold,
        );
        let smart = SmartDiversificationManager::new(
            policy.core_asset_override_threshold,
            policy.max_overrides_per_rebalance,
        );

        Ok(Self {
            policy,
            buckets,
            detector,
            technical: None,
            fundamental: None,
            data: None,
            sink,
            default_regime: Regime::Goldilocks,
            regime_multiplier_overrides: Vec::new(),
            core_assets,
            grace,
            holding,
            whipsaw,
            regime_context,
            lifecycle: crate::lifecycle::PositionLifecycleTracker::new(),
            orchestrator: ProtectionOrchestrator::new(),
            smart,
            selection: SelectionService::new(),
        })
    }

    pub fn with_technical_analyzer(mut self, analyzer: Box<dyn TechnicalAnalyzer>) -> Self {
        self.technical = Some(analyzer);
        self
    }

    pub fn with_fundamental_analyzer(mut self, analyzer: Box<dyn FundamentalAnalyzer>) -> Self {
        self.fundamental = Some(analyzer);
        self
    }

    pub fn with_data_provider(mut self, provider: Box<dyn DataProvider>) -> Self {
        self.data = Some(provider);
        self
    }

    /// Regime used when the detector has no view.
    pub fn with_default_regime(mut self, regime: Regime) -> Self {
        self.default_regime = regime;
        self
    }

    /// Override the scoring multiplier for a regime.
    pub fn with_regime_multiplier(mut self, regime: Regime, multiplier: f64) -> Self {
        self.regime_multiplier_overrides.push((regime, multiplier));
        self
    }

    // ── State accessors ──────────────────────────────────────────────────

    pub fn policy(&self) -> &RebalancePolicy {
        &self.policy
    }

    pub fn core_assets(&self) -> &CoreAssetManager {
        &self.core_assets
    }

    pub fn core_assets_mut(&mut self) -> &mut CoreAssetManager {
        &mut self.core_assets
    }

    pub fn grace(&self) -> &GracePeriodManager {
        &self.grace
    }

    pub fn holding(&self) -> &HoldingPeriodManager {
        &self.holding
    }

    pub fn holding_mut(&mut self) -> &mut HoldingPeriodManager {
        &mut self.holding
    }

    pub fn whipsaw(&self) -> &WhipsawProtectionManager {
        &self.whipsaw
    }

    pub fn whipsaw_mut(&mut self) -> &mut WhipsawProtectionManager {
        &mut self.whipsaw
    }

    pub fn lifecycle(&self) -> &crate::lifecycle::PositionLifecycleTracker {
        &self.lifecycle
    }

    pub fn orchestrator_stats(&self) -> crate::protection::OrchestratorStats {
        self.orchestrator.stats()
    }

    // ── Main pipeline ────────────────────────────────────────────────────

    /// Run one rebalance and return the targets.
    pub fn rebalance(
        &mut self,
        request: &RebalanceRequest,
    ) -> Result<Vec<RebalancingTarget>, RebalanceError> {
        let started = Instant::now();
        let date = request.date;
        let positions = &request.current_positions;

        // Configuration problems abort before any state mutation.
        let mut scoring = ScoringService::new(
            request.enable_technical,
            request.enable_fundamental,
            request.technical_weight,
            request.fundamental_weight,
        )?;
        for (regime, multiplier) in &self.regime_multiplier_overrides {
            scoring.set_regime_multiplier(*regime, *multiplier);
        }

        let session_id = self.sink.start_session("portfolio_rebalancing");
        let trace_id = self.sink.start_trace("rebalance");

        // Step 1: universe.
        let universe = UniverseBuilder::new(&*self.detector, &self.buckets).build(
            date,
            positions,
            self.default_regime,
            request.bucket_filter.as_deref(),
            request.min_trending_confidence,
        );
        if universe.is_empty() {
            self.sink.end_trace(&trace_id, true);
            self.sink.end_session(SessionStats {
                execution_time_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                targets_generated: Some(0),
                success: Some(true),
            });
            return Ok(Vec::new());
        }

        self.sink.emit(
            PortfolioEvent::new(
                date,
                "portfolio.rebalance_start",
                "start",
                "portfolio rebalancing session initiated",
            )
            .regime(universe.regime)
            .portfolio(positions.values().sum(), positions.len())
            .meta("session_id", session_id.clone())
            .meta("universe_size", universe.combined.len() as u64),
        );

        // Step 2: scoring.
        let scored = scoring.score_universe(
            &universe,
            positions,
            self.technical.as_deref(),
            self.fundamental.as_deref(),
            &*self.sink,
        );

        // Step 3: bucket diversification.
        let (mut scored, bucket_rejected) = if self.policy.enable_bucket_diversification {
            let enforcement = BucketLimitsEnforcer::new(&self.buckets).apply(
                scored,
                &BucketLimitsConfig::from_policy(&self.policy),
                date,
                universe.regime,
                &*self.sink,
            );
            (
                enforcement.selected,
                enforcement
                    .rejected
                    .into_iter()
                    .map(|r| r.score)
                    .collect::<Vec<_>>(),
            )
        } else {
            (scored, Vec::new())
        };

        // Step 4: regime context.
        let ctx = self.regime_context.get_context(
            date,
            &*self.detector,
            self.default_regime,
            &*self.sink,
        );

        // Step 5: core asset lifecycle (auto-revocations).
        if self.policy.enable_core_asset_management {
            self.core_assets
                .lifecycle_check(date, &self.buckets, self.data.as_deref(), &*self.sink);
        }

        // Step 6: smart diversification over the bucket spill.
        if self.policy.enable_smart_diversification {
            scored = self.smart.apply(
                scored,
                bucket_rejected,
                &self.buckets,
                &mut self.core_assets,
                self.policy.max_positions_per_bucket,
                date,
                &*self.sink,
            );
        }

        // Step 7: selection with lifecycle pre-filters.
        let selection = self.selection.select(
            scored,
            &self.policy,
            positions,
            date,
            &ctx,
            &mut self.grace,
            &mut self.holding,
            &self.whipsaw,
            &self.core_assets,
            &*self.sink,
        );

        // Step 8: sizing. Pinned weights (grace decays, protection holds)
        // bypass the sizers; the sizers fill the rest of the budget.
        let mut pinned: Vec<SizedAsset> = Vec::new();
        let mut free = Vec::new();
        for selected in selection.kept {
            match selected.pinned_weight {
                Some(weight) => {
                    pinned.push(SizedAsset::new(
                        selected.score,
                        weight,
                        SizeCategory::Standard,
                        selected.reason,
                    ));
                }
                None => {
                    let mut score = selected.score;
                    score.reason = selected.reason;
                    free.push(score);
                }
            }
        }

        let pinned_total: f64 = pinned.iter().map(|a| a.weight).sum();
        if pinned_total > self.policy.target_total_allocation {
            let scale = self.policy.target_total_allocation / pinned_total;
            warn!(pinned_total, scale, "pinned weights exceed target, scaling down");
            for asset in &mut pinned {
                asset.weight *= scale;
            }
        }
        let free_target = (self.policy.target_total_allocation
            - pinned.iter().map(|a| a.weight).sum::<f64>())
        .max(0.0);

        let dynamically_sized = DynamicPositionSizer::new(
            self.policy.sizing_mode,
            self.policy.max_single_position_pct,
            free_target,
            self.policy.min_position_size,
        )
        .size(free);
        let two_stage = TwoStagePositionSizer::new(
            self.policy.max_single_position,
            free_target,
            self.policy.residual_strategy,
            self.policy.max_residual_per_asset,
        )
        .apply(dynamically_sized);

        let mut sized = two_stage.assets;
        sized.extend(pinned);

        // Step 9: bucket allocation caps over the sized weights.
        if self.policy.enable_bucket_diversification {
            BucketLimitsEnforcer::new(&self.buckets)
                .enforce_allocation_caps(&mut sized, self.policy.max_allocation_per_bucket);
        }

        // Step 10: materialise targets and run the final protection gate.
        let targets = build_targets(sized, &selection.closes, positions);
        let targets = self.protection_gate(targets, date, &ctx);

        // Step 11: events and lifecycle updates.
        self.emit_target_events(&targets, date);
        self.update_lifecycle(&targets, date);
        self.whipsaw.cleanup_old_events(date);
        self.holding.prune_override_stamps(date);
        self.grace.prune_expired(date);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let open_allocation: f64 = targets
            .iter()
            .filter(|t| t.action != TargetAction::Close)
            .map(|t| t.target_weight)
            .sum();
        self.sink.emit(
            PortfolioEvent::new(
                date,
                "portfolio.rebalance_complete",
                "complete",
                "portfolio rebalancing completed",
            )
            .portfolio(open_allocation, targets.iter().filter(|t| t.action != TargetAction::Close).count())
            .meta("total_targets", targets.len() as u64)
            .elapsed_ms(elapsed_ms),
        );
        self.sink.end_trace(&trace_id, true);
        self.sink.end_session(SessionStats {
            execution_time_ms: Some(elapsed_ms),
            targets_generated: Some(targets.len()),
            success: Some(true),
        });

        info!(
            targets = targets.len(),
            allocation = open_allocation,
            elapsed_ms,
            "rebalance complete"
        );
        Ok(targets)
    }

    /// Report trades the caller actually executed. This is what advances
    /// the whipsaw history, position ages and lifecycle records.
    pub fn confirm_execution(&mut self, targets: &[RebalancingTarget], date: DateTime<Utc>) {
        for target in targets {
            if target.asset == CASH_EQUIVALENT {
                continue;
            }
            match target.action {
                TargetAction::Open => {
                    self.whipsaw.record_event(
                        &target.asset,
                        PositionEventKind::Open,
                        date,
                        target.target_weight,
                        &target.reason,
                        None,
                    );
                    self.holding
                        .record_entry(&target.asset, date, target.target_weight, &target.reason);
                    self.lifecycle.track_entry(
                        &target.asset,
                        date,
                        target.target_weight,
                        target.score,
                        self.buckets.bucket_of(&target.asset),
                    );
                }
                TargetAction::Close => {
                    self.whipsaw.record_event(
                        &target.asset,
                        PositionEventKind::Close,
                        date,
                        target.current_weight,
                        &target.reason,
                        None,
                    );
                    self.holding.record_closure(&target.asset, date);
                    self.lifecycle.record_closure(&target.asset, date, &target.reason);
                    self.grace.remove(&target.asset);
                }
                TargetAction::Increase | TargetAction::Decrease => {
                    self.holding.record_adjustment(&target.asset, date);
                }
                TargetAction::Hold => {}
            }
        }
    }

    /// JSON-ready summary for the caller.
    pub fn to_report(&self, targets: &[RebalancingTarget], date: DateTime<Utc>) -> RebalanceReport {
        RebalanceReport::from_targets(targets, date)
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Every non-hold target must clear the protection orchestrator. Denied
    /// shrinks on incumbents become holds at the current weight so every
    /// incumbent still appears in exactly one target; denied entries drop.
    fn protection_gate(
        &mut self,
        targets: Vec<RebalancingTarget>,
        date: DateTime<Utc>,
        ctx: &RegimeContext,
    ) -> Vec<RebalancingTarget> {
        let mut out = Vec::with_capacity(targets.len());

        for mut target in targets {
            let action = match target.action {
                TargetAction::Hold => {
                    out.push(target);
                    continue;
                }
                TargetAction::Open => ProtectionAction::Open,
                TargetAction::Close => ProtectionAction::Close,
                TargetAction::Increase => ProtectionAction::Increase,
                TargetAction::Decrease => ProtectionAction::Decrease,
            };
            if target.asset == CASH_EQUIVALENT {
                out.push(target);
                continue;
            }

            let mut request = ProtectionRequest::new(&target.asset, action, date);
            request.current_size = Some(target.current_weight);
            request.target_size = Some(target.target_weight);
            request.current_score = Some(target.score);
            request.position_entry_date = self.holding.entry_date(&target.asset);
            request.reason = target.reason.clone();

            let decision = self.orchestrator.can_execute(
                &request,
                ctx,
                ProtectionSystems {
                    core_assets: self
                        .policy
                        .enable_core_asset_management
                        .then_some(&self.core_assets),
                    grace: self.policy.enable_grace_periods.then_some(&self.grace),
                    holding: (self.policy.min_holding_period_days > 0)
                        .then_some(&mut self.holding),
                    whipsaw: self
                        .policy
                        .enable_whipsaw_protection
                        .then_some(&self.whipsaw),
                },
                &*self.sink,
            );

            if decision.approved {
                out.push(target);
                continue;
            }

            match target.action {
                TargetAction::Close | TargetAction::Decrease | TargetAction::Increase
                    if target.current_weight > 0.0 =>
                {
                    target.target_weight = target.current_weight;
                    target.action = TargetAction::Hold;
                    target.reason = format!("protected: {}", decision.reason);
                    out.push(target);
                }
                _ => {
                    warn!(asset = %target.asset, reason = %decision.reason, "target dropped by protection");
                }
            }
        }

        out
    }

    fn emit_target_events(&self, targets: &[RebalancingTarget], date: DateTime<Utc>) {
        for target in targets {
            let (event_type, action) = match target.action {
                TargetAction::Open => ("portfolio.position_open", "open"),
                TargetAction::Close => ("portfolio.position_close", "close"),
                TargetAction::Increase | TargetAction::Decrease => {
                    ("portfolio.position_adjust", "adjust")
                }
                TargetAction::Hold => continue,
            };
            self.sink.emit(
                PortfolioEvent::new(date, event_type, action, target.reason.clone())
                    .asset(&target.asset)
                    .scores(None, Some(target.score))
                    .sizes(Some(target.current_weight), Some(target.target_weight)),
            );
        }
    }

    fn update_lifecycle(&mut self, targets: &[RebalancingTarget], date: DateTime<Utc>) {
        for target in targets {
            if target.asset == CASH_EQUIVALENT {
                continue;
            }
            let closing = target.action == TargetAction::Close;
            if target.current_weight > 0.0 && !self.lifecycle.is_tracked(&target.asset) {
                self.lifecycle.track_entry(
                    &target.asset,
                    date,
                    target.current_weight,
                    target.score,
                    self.buckets.bucket_of(&target.asset),
                );
            }
            if closing {
                self.lifecycle.record_closure(&target.asset, date, &target.reason);
                continue;
            }
            if self.lifecycle.is_tracked(&target.asset) {
                let in_grace = self.grace.is_in_grace(&target.asset, Some(date));
                let grace_days_remaining = self
                    .grace
                    .status(&target.asset, date)
                    .map(|s| s.days_remaining)
                    .unwrap_or(0);
                let forced_review = self.holding.should_force_review(&target.asset, date);
                self.lifecycle.update(
                    &target.asset,
                    date,
                    target.score,
                    target.target_weight,
                    self.policy.min_score_threshold,
                    in_grace,
                    grace_days_remaining,
                    forced_review,
                    false,
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
