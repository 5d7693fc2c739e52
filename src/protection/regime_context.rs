// =============================================================================
// Regime context provider — severity-driven override permissions
// =============================================================================
//
// Adapts the external regime detector into the context every protection
// component consumes. The context carries the current regime, the most
// recent transition (if any), and the override permissions that transition
// unlocks:
//
//   severity  | systems that may be overridden
//   ----------|------------------------------------------------------------
//   normal    | none
//   high      | grace_period, holding_period, position_limits,
//             | core_asset_designation
//   critical  | all of the above + whipsaw_protection + bucket_limits
//
// Contexts are cached keyed to the hour and expire after the configured
// duration. Stale cache entries are cleaned opportunistically on access.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{EventSink, PortfolioEvent};
use crate::providers::RegimeDetector;
use crate::types::{Regime, RegimeState, RegimeTransition, TransitionSeverity};

/// A transition older than this no longer counts as recent.
const RECENT_TRANSITION_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Which protection systems the current regime situation may override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePermissions {
    pub grace_period: bool,
    pub holding_period: bool,
    pub whipsaw_protection: bool,
    pub bucket_limits: bool,
    pub position_limits: bool,
    pub core_asset_designation: bool,
}

impl OverridePermissions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_severity(severity: TransitionSeverity) -> Self {
        match severity {
            TransitionSeverity::Normal => Self::none(),
            TransitionSeverity::High => Self {
                grace_period: true,
                holding_period: true,
                position_limits: true,
                core_asset_designation: true,
                ..Self::none()
            },
            TransitionSeverity::Critical => Self {
                grace_period: true,
                holding_period: true,
                whipsaw_protection: true,
                bucket_limits: true,
                position_limits: true,
                core_asset_designation: true,
            },
        }
    }

    pub fn any(&self) -> bool {
        self.grace_period
            || self.holding_period
            || self.whipsaw_protection
            || self.bucket_limits
            || self.position_limits
            || self.core_asset_designation
    }
}

/// Regime-conditioned tuning hints passed through to callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterAdjustments {
    pub position_limit_multiplier: f64,
    pub score_threshold_adjustment: f64,
    pub risk_scaling_factor: f64,
}

impl ParameterAdjustments {
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::Goldilocks => Self {
                position_limit_multiplier: 1.1,
                score_threshold_adjustment: -0.02,
                risk_scaling_factor: 1.0,
            },
            Regime::Reflation => Self {
                position_limit_multiplier: 1.0,
                score_threshold_adjustment: 0.0,
                risk_scaling_factor: 0.9,
            },
            Regime::Inflation => Self {
                position_limit_multiplier: 0.9,
                score_threshold_adjustment: 0.03,
                risk_scaling_factor: 0.8,
            },
            Regime::Deflation => Self {
                position_limit_multiplier: 0.8,
                score_threshold_adjustment: 0.05,
                risk_scaling_factor: 0.7,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Read-only regime situation delivered by value to every protection check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeContext {
    pub date: DateTime<Utc>,
    pub current_regime: RegimeState,
    pub recent_transition: Option<RegimeTransition>,
    pub regime_changed: bool,
    pub override_permissions: OverridePermissions,
    pub parameter_adjustments: ParameterAdjustments,
}

impl RegimeContext {
    /// Build a context directly from a regime state and optional transition.
    /// Transitions below the severity threshold grant no permissions.
    pub fn for_transition(
        date: DateTime<Utc>,
        current_regime: RegimeState,
        recent_transition: Option<RegimeTransition>,
        severity_threshold: TransitionSeverity,
    ) -> Self {
        let regime_changed = recent_transition.is_some();
        let override_permissions = recent_transition
            .as_ref()
            .filter(|t| t.severity >= severity_threshold)
            .map(|t| OverridePermissions::for_severity(t.severity))
            .unwrap_or_default();
        Self {
            date,
            parameter_adjustments: ParameterAdjustments::for_regime(current_regime.regime),
            current_regime,
            recent_transition,
            regime_changed,
            override_permissions,
        }
    }

    /// Context with no transition and no permissions.
    pub fn quiet(date: DateTime<Utc>, current_regime: RegimeState) -> Self {
        Self::for_transition(date, current_regime, None, TransitionSeverity::High)
    }

    pub fn severity(&self) -> Option<TransitionSeverity> {
        self.recent_transition.as_ref().map(|t| t.severity)
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct RegimeContextProvider {
    cache_duration: Duration,
    severity_threshold: TransitionSeverity,
    cache: HashMap<String, (DateTime<Utc>, RegimeContext)>,
    /// Transition dates already announced through the sink.
    announced_transitions: Vec<DateTime<Utc>>,
}

impl RegimeContextProvider {
    pub fn new(cache_duration_hours: i64, severity_threshold: TransitionSeverity) -> Self {
        Self {
            cache_duration: Duration::hours(cache_duration_hours.max(1)),
            severity_threshold,
            cache: HashMap::new(),
            announced_transitions: Vec::new(),
        }
    }

    /// Context for a date, cached to the hour.
    pub fn get_context(
        &mut self,
        date: DateTime<Utc>,
        detector: &dyn RegimeDetector,
        default_regime: Regime,
        sink: &dyn EventSink,
    ) -> RegimeContext {
        let key = date.format("%Y-%m-%d-%H").to_string();
        if let Some((cached_at, context)) = self.cache.get(&key) {
            if date - *cached_at <= self.cache_duration {
                return context.clone();
            }
        }

        let current_regime = detector
            .current(date)
            .unwrap_or_else(|| RegimeState::new(default_regime, date));

        let recent_transition = detector
            .transition(date)
            .filter(|t| (date - t.date).num_days() <= RECENT_TRANSITION_DAYS && t.date <= date);

        sink.emit(
            PortfolioEvent::new(
                date,
                "regime.detection",
                "detect",
                format!("regime context computed: {}", current_regime.regime),
            )
            .regime(current_regime.regime)
            .meta("confidence", current_regime.confidence),
        );

        if let Some(transition) = &recent_transition {
            if !self.announced_transitions.contains(&transition.date) {
                self.announced_transitions.push(transition.date);
                sink.emit(
                    PortfolioEvent::new(
                        date,
                        "regime.transition",
                        "transition",
                        format!(
                            "{} -> {} (severity {})",
                            transition.from, transition.to, transition.severity
                        ),
                    )
                    .regime(transition.to)
                    .meta("severity", transition.severity.to_string())
                    .meta("momentum", transition.momentum),
                );
            }
        }

        let context = RegimeContext::for_transition(
            date,
            current_regime,
            recent_transition,
            self.severity_threshold,
        );

        if context.override_permissions.any() {
            sink.emit(
                PortfolioEvent::new(
                    date,
                    "regime.override_granted",
                    "override",
                    format!(
                        "transition severity {} unlocks protection overrides",
                        context
                            .severity()
                            .map(|s| s.to_string())
                            .unwrap_or_default()
                    ),
                )
                .regime(context.current_regime.regime),
            );
        }

        self.evict_stale(date);
        self.cache.insert(key, (date, context.clone()));
        debug!(%date, regime = %context.current_regime.regime, "regime context cached");
        context
    }

    fn evict_stale(&mut self, now: DateTime<Utc>) {
        let horizon = self.cache_duration * 2;
        self.cache.retain(|_, (cached_at, _)| now - *cached_at <= horizon);
        self.announced_transitions
            .retain(|date| now - *date <= Duration::days(RECENT_TRANSITION_DAYS * 2));
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryEventSink, NullEventSink};
    use crate::providers::FixedRegimeDetector;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn transition(severity: TransitionSeverity, date: DateTime<Utc>) -> RegimeTransition {
        RegimeTransition {
            from: Regime::Goldilocks,
            to: Regime::Deflation,
            date,
            severity,
            momentum: 0.7,
            confidence: 0.9,
            triggers: vec!["pmi".into()],
        }
    }

    #[test]
    fn severity_maps_to_permission_table() {
        let none = OverridePermissions::for_severity(TransitionSeverity::Normal);
        assert!(!none.any());

        let high = OverridePermissions::for_severity(TransitionSeverity::High);
        assert!(high.grace_period && high.holding_period);
        assert!(high.position_limits && high.core_asset_designation);
        assert!(!high.whipsaw_protection && !high.bucket_limits);

        let critical = OverridePermissions::for_severity(TransitionSeverity::Critical);
        assert!(critical.whipsaw_protection && critical.bucket_limits);
    }

    #[test]
    fn threshold_gates_permissions() {
        let state = RegimeState::new(Regime::Deflation, ts());
        // High transition under a Critical threshold grants nothing.
        let ctx = RegimeContext::for_transition(
            ts(),
            state,
            Some(transition(TransitionSeverity::High, ts())),
            TransitionSeverity::Critical,
        );
        assert!(ctx.regime_changed);
        assert!(!ctx.override_permissions.any());
    }

    #[test]
    fn context_cached_by_hour() {
        let detector = FixedRegimeDetector::new(Regime::Goldilocks, ts());
        let mut provider = RegimeContextProvider::new(1, TransitionSeverity::High);
        let sink = MemoryEventSink::new();

        provider.get_context(ts(), &detector, Regime::Goldilocks, &sink);
        provider.get_context(
            ts() + Duration::minutes(30),
            &detector,
            Regime::Goldilocks,
            &sink,
        );
        // Second call inside the same hour hits the cache: one detection event.
        assert_eq!(sink.events_of_type("regime.detection").len(), 1);
        assert_eq!(provider.cache_len(), 1);

        provider.get_context(
            ts() + Duration::hours(2),
            &detector,
            Regime::Goldilocks,
            &sink,
        );
        assert_eq!(sink.events_of_type("regime.detection").len(), 2);
    }

    #[test]
    fn old_transitions_are_not_recent() {
        let old = transition(TransitionSeverity::Critical, ts() - Duration::days(30));
        let detector =
            FixedRegimeDetector::new(Regime::Deflation, ts()).with_transition(old);
        let mut provider = RegimeContextProvider::new(1, TransitionSeverity::High);

        let ctx = provider.get_context(ts(), &detector, Regime::Deflation, &NullEventSink);
        assert!(!ctx.regime_changed);
        assert!(!ctx.override_permissions.any());
    }

    #[test]
    fn override_granted_event_emitted_once_per_context() {
        let detector = FixedRegimeDetector::new(Regime::Deflation, ts())
            .with_transition(transition(TransitionSeverity::Critical, ts()));
        let mut provider = RegimeContextProvider::new(1, TransitionSeverity::High);
        let sink = MemoryEventSink::new();

        let ctx = provider.get_context(ts(), &detector, Regime::Deflation, &sink);
        assert!(ctx.override_permissions.whipsaw_protection);
        assert_eq!(sink.events_of_type("regime.override_granted").len(), 1);
        assert_eq!(sink.events_of_type("regime.transition").len(), 1);
    }

    #[test]
    fn blind_detector_uses_default_regime() {
        let detector = FixedRegimeDetector::blind();
        let mut provider = RegimeContextProvider::new(1, TransitionSeverity::High);
        let ctx = provider.get_context(ts(), &detector, Regime::Reflation, &NullEventSink);
        assert_eq!(ctx.current_regime.regime, Regime::Reflation);
    }
}
