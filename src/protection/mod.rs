// =============================================================================
// Protection orchestrator — the arbiter for every position mutation
// =============================================================================
//
// Every non-hold target passes through `can_execute` before it is emitted.
// Guards are evaluated in a fixed priority order:
//
//   1. Core asset immunity   — close/decrease of a core asset. Never
//                              overrideable, fails CLOSED on guard failure.
//   2. Grace period          — close of an asset in grace.
//   3. Holding period        — close/decrease before the minimum age.
//   4. Whipsaw protection    — open that would exceed the cycle limit.
//
// Guards 2-4 are candidate blocks: a regime transition of sufficient
// severity can override them per the context's permission table. They fail
// OPEN on guard failure; the failure is recorded in the decision chain and
// logged, but does not block. The asymmetry is deliberate.
//
// Managers never reference each other. The orchestrator borrows each one
// per call through `ProtectionSystems` and receives the regime context by
// value, so the dependency tree stays one-way.
// =============================================================================

pub mod core_assets;
pub mod grace;
pub mod holding;
pub mod regime_context;
pub mod whipsaw;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GuardFailure;
use crate::events::{EventSink, PortfolioEvent};
use self::core_assets::CoreAssetManager;
use self::grace::GracePeriodManager;
use self::holding::{AdjustmentKind, HoldingPeriodManager};
use self::regime_context::RegimeContext;
use self::whipsaw::WhipsawProtectionManager;

// ---------------------------------------------------------------------------
// Request / decision records
// ---------------------------------------------------------------------------

/// Position mutation being vetted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionAction {
    Open,
    Close,
    Increase,
    Decrease,
}

impl ProtectionAction {
    fn shrinks_position(self) -> bool {
        matches!(self, Self::Close | Self::Decrease)
    }

    fn adjustment_kind(self) -> AdjustmentKind {
        match self {
            Self::Close => AdjustmentKind::Close,
            Self::Decrease => AdjustmentKind::Reduce,
            Self::Increase => AdjustmentKind::Increase,
            Self::Open => AdjustmentKind::Any,
        }
    }
}

impl std::fmt::Display for ProtectionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::Increase => write!(f, "increase"),
            Self::Decrease => write!(f, "decrease"),
        }
    }
}

/// Standardized protection request with complete context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionRequest {
    pub asset: String,
    pub action: ProtectionAction,
    pub date: DateTime<Utc>,
    pub current_size: Option<f64>,
    pub target_size: Option<f64>,
    pub current_score: Option<f64>,
    pub position_entry_date: Option<DateTime<Utc>>,
    pub reason: String,
}

impl ProtectionRequest {
    pub fn new(asset: &str, action: ProtectionAction, date: DateTime<Utc>) -> Self {
        Self {
            asset: asset.to_string(),
            action,
            date,
            current_size: None,
            target_size: None,
            current_score: None,
            position_entry_date: None,
            reason: String::new(),
        }
    }
}

/// Identity of one protection guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionSystem {
    CoreAssetImmunity,
    GracePeriod,
    HoldingPeriod,
    WhipsawProtection,
}

impl ProtectionSystem {
    pub fn name(self) -> &'static str {
        match self {
            Self::CoreAssetImmunity => "core_asset_immunity",
            Self::GracePeriod => "grace_period",
            Self::HoldingPeriod => "holding_period",
            Self::WhipsawProtection => "whipsaw_protection",
        }
    }

    fn priority(self) -> u8 {
        match self {
            Self::CoreAssetImmunity => 1,
            Self::GracePeriod => 3,
            Self::HoldingPeriod => 4,
            Self::WhipsawProtection => 5,
        }
    }
}

impl std::fmt::Display for ProtectionSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of one guard evaluation, kept in the decision chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionCheck {
    pub system: ProtectionSystem,
    pub blocks: bool,
    pub reason: String,
    pub priority: u8,
    /// Guard failure message when the check itself failed.
    pub error: Option<String>,
}

impl ProtectionCheck {
    fn pass(system: ProtectionSystem, reason: impl Into<String>) -> Self {
        Self {
            system,
            blocks: false,
            reason: reason.into(),
            priority: system.priority(),
            error: None,
        }
    }

    fn block(system: ProtectionSystem, reason: impl Into<String>) -> Self {
        Self {
            system,
            blocks: true,
            reason: reason.into(),
            priority: system.priority(),
            error: None,
        }
    }
}

/// Final verdict with complete reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionDecision {
    pub approved: bool,
    pub reason: String,
    pub blocking_systems: Vec<String>,
    pub override_applied: bool,
    pub override_reason: Option<String>,
    pub decision_chain: Vec<ProtectionCheck>,
}

/// Running decision statistics for the orchestrator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub decisions_processed: u64,
    pub decisions_approved: u64,
    pub decisions_denied: u64,
    pub overrides_applied: u64,
}

/// Per-call borrow bundle over the protection managers. `None` means the
/// feature is disabled by policy and the guard passes vacuously.
pub struct ProtectionSystems<'a> {
    pub core_assets: Option<&'a CoreAssetManager>,
    pub grace: Option<&'a GracePeriodManager>,
    pub holding: Option<&'a mut HoldingPeriodManager>,
    pub whipsaw: Option<&'a WhipsawProtectionManager>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ProtectionOrchestrator {
    stats: OrchestratorStats,
}

impl ProtectionOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    /// Central decision authority for a position mutation.
    pub fn can_execute(
        &mut self,
        request: &ProtectionRequest,
        ctx: &RegimeContext,
        mut systems: ProtectionSystems<'_>,
        sink: &dyn EventSink,
    ) -> ProtectionDecision {
        self.stats.decisions_processed += 1;

        let mut chain: Vec<ProtectionCheck> = Vec::new();
        let mut blocking_systems: Vec<String> = Vec::new();
        let mut override_applied = false;
        let mut override_reason: Option<String> = None;

        // Priority 1: core asset immunity. Not overrideable, fails closed.
        let core_check = match check_core_immunity(request, systems.core_assets) {
            Ok(check) => check,
            Err(failure) => {
                warn!(asset = %request.asset, error = %failure, "core guard failed, denying");
                sink.emit(
                    PortfolioEvent::new(
                        request.date,
                        "error.protection_check",
                        "error",
                        failure.to_string(),
                    )
                    .asset(&request.asset),
                );
                let mut check =
                    ProtectionCheck::block(ProtectionSystem::CoreAssetImmunity, failure.to_string());
                check.error = Some(failure.message.clone());
                check
            }
        };
        chain.push(core_check.clone());
        if core_check.blocks {
            self.stats.decisions_denied += 1;
            sink.emit(
                PortfolioEvent::new(
                    request.date,
                    "protection.core_asset_immunity",
                    "block",
                    core_check.reason.clone(),
                )
                .asset(&request.asset),
            );
            return ProtectionDecision {
                approved: false,
                reason: core_check.reason.clone(),
                blocking_systems: vec![ProtectionSystem::CoreAssetImmunity.name().to_string()],
                override_applied: false,
                override_reason: None,
                decision_chain: chain,
            };
        }

        // Priority 3-5: standard chain, candidate blocks only.
        let checks = [
            check_grace(request, systems.grace),
            check_holding(request, ctx, systems.holding.as_deref_mut()),
            check_whipsaw(request, systems.whipsaw),
        ];

        for result in checks {
            let check = absorb_failure(result, request, sink);
            let blocks = check.blocks;
            let system = check.system;
            let block_reason = check.reason.clone();
            chain.push(check);

            if !blocks {
                continue;
            }

            if overridable(system, ctx) {
                override_applied = true;
                let severity = ctx
                    .severity()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".into());
                let reason = format!(
                    "regime override bypassed {}: {severity} severity transition",
                    system.name()
                );
                sink.emit(
                    PortfolioEvent::new(
                        request.date,
                        "protection.override_applied",
                        "override",
                        reason.clone(),
                    )
                    .asset(&request.asset)
                    .regime(ctx.current_regime.regime)
                    .meta("overridden_system", system.name())
                    .meta("original_block_reason", block_reason),
                );
                override_reason = Some(reason);
                continue;
            }

            blocking_systems.push(system.name().to_string());
        }

        if blocking_systems.is_empty() {
            self.stats.decisions_approved += 1;
            if override_applied {
                self.stats.overrides_applied += 1;
            }
            let mut reason = "all protection checks passed".to_string();
            if let Some(override_reason) = &override_reason {
                reason = format!("{reason} (with {override_reason})");
            }
            debug!(asset = %request.asset, action = %request.action, "mutation approved");
            ProtectionDecision {
                approved: true,
                reason,
                blocking_systems,
                override_applied,
                override_reason,
                decision_chain: chain,
            }
        } else {
            self.stats.decisions_denied += 1;
            ProtectionDecision {
                approved: false,
                reason: format!("action blocked by: {}", blocking_systems.join(", ")),
                blocking_systems,
                override_applied,
                override_reason,
                decision_chain: chain,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Individual guards
// ---------------------------------------------------------------------------

fn check_core_immunity(
    request: &ProtectionRequest,
    core: Option<&CoreAssetManager>,
) -> Result<ProtectionCheck, GuardFailure> {
    let system = ProtectionSystem::CoreAssetImmunity;
    let Some(core) = core else {
        return Ok(ProtectionCheck::pass(system, "core asset management disabled"));
    };

    let is_core = core.is_core_asset(&request.asset, Some(request.date));
    if is_core && request.action.shrinks_position() {
        return Ok(ProtectionCheck::block(
            system,
            format!(
                "core asset {} protected from {}",
                request.asset, request.action
            ),
        ));
    }
    Ok(ProtectionCheck::pass(
        system,
        if is_core {
            "core asset check passed"
        } else {
            "not a core asset"
        },
    ))
}

fn check_grace(
    request: &ProtectionRequest,
    grace: Option<&GracePeriodManager>,
) -> Result<ProtectionCheck, GuardFailure> {
    let system = ProtectionSystem::GracePeriod;
    let Some(grace) = grace else {
        return Ok(ProtectionCheck::pass(system, "grace periods disabled"));
    };

    if request.action == ProtectionAction::Close
        && grace.is_in_grace(&request.asset, Some(request.date))
    {
        let until = grace
            .status(&request.asset, request.date)
            .map(|s| s.days_remaining)
            .unwrap_or(0);
        return Ok(ProtectionCheck::block(
            system,
            format!(
                "asset {} in grace period ({until} days remaining)",
                request.asset
            ),
        ));
    }
    Ok(ProtectionCheck::pass(system, "grace period check passed"))
}

fn check_holding(
    request: &ProtectionRequest,
    ctx: &RegimeContext,
    holding: Option<&mut HoldingPeriodManager>,
) -> Result<ProtectionCheck, GuardFailure> {
    let system = ProtectionSystem::HoldingPeriod;
    let Some(holding) = holding else {
        return Ok(ProtectionCheck::pass(system, "holding periods disabled"));
    };

    if request.action.shrinks_position() && request.position_entry_date.is_some() {
        // The context is passed along so a qualifying transition can unlock
        // the minimum inside the manager itself.
        let decision = holding.can_adjust(
            &request.asset,
            request.date,
            Some(ctx),
            request.action.adjustment_kind(),
        );
        if !decision.allowed {
            return Ok(ProtectionCheck::block(system, decision.reason));
        }
        return Ok(ProtectionCheck::pass(system, decision.reason));
    }
    Ok(ProtectionCheck::pass(system, "holding period check passed"))
}

fn check_whipsaw(
    request: &ProtectionRequest,
    whipsaw: Option<&WhipsawProtectionManager>,
) -> Result<ProtectionCheck, GuardFailure> {
    let system = ProtectionSystem::WhipsawProtection;
    let Some(whipsaw) = whipsaw else {
        return Ok(ProtectionCheck::pass(system, "whipsaw protection disabled"));
    };

    if request.action == ProtectionAction::Open {
        let (can_open, reason) = whipsaw.can_open(&request.asset, request.date);
        if !can_open {
            return Ok(ProtectionCheck::block(system, reason));
        }
        return Ok(ProtectionCheck::pass(system, reason));
    }
    Ok(ProtectionCheck::pass(system, "whipsaw check passed"))
}

/// Secondary guards fail open: a guard failure is logged and recorded in the
/// chain as non-blocking.
fn absorb_failure(
    result: Result<ProtectionCheck, GuardFailure>,
    request: &ProtectionRequest,
    sink: &dyn EventSink,
) -> ProtectionCheck {
    match result {
        Ok(check) => check,
        Err(failure) => {
            warn!(asset = %request.asset, error = %failure, "secondary guard failed open");
            sink.emit(
                PortfolioEvent::new(
                    request.date,
                    "error.protection_check",
                    "error",
                    failure.to_string(),
                )
                .asset(&request.asset),
            );
            let system = match failure.system {
                "grace_period" => ProtectionSystem::GracePeriod,
                "holding_period" => ProtectionSystem::HoldingPeriod,
                _ => ProtectionSystem::WhipsawProtection,
            };
            let mut check = ProtectionCheck::pass(system, failure.to_string());
            check.error = Some(failure.message);
            check
        }
    }
}

/// Whether the regime context can override a blocking system.
fn overridable(system: ProtectionSystem, ctx: &RegimeContext) -> bool {
    let permissions = &ctx.override_permissions;
    match system {
        ProtectionSystem::CoreAssetImmunity => false,
        ProtectionSystem::GracePeriod => permissions.grace_period,
        ProtectionSystem::HoldingPeriod => permissions.holding_period,
        ProtectionSystem::WhipsawProtection => permissions.whipsaw_protection,
    }
}

// =============================================================================
// Tests
// =============================================================================
