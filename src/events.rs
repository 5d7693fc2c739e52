// =============================================================================
// Event model — auditable record of every pipeline decision
// =============================================================================
//
// The engine never persists events itself. Every decision is wrapped in a
// `PortfolioEvent` envelope and handed to an injected `EventSink`; storage is
// the caller's concern. Event types are dotted `category.name` strings
// ("protection.whipsaw_block", "portfolio.rebalance_start", ...) and the
// category is derived from the prefix.
//
// Emission must be non-blocking from the engine's point of view. The bundled
// `MemoryEventSink` keeps a bounded in-memory log behind a `parking_lot`
// RwLock and is what backtests and tests read back; `NullEventSink` discards
// everything.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::Regime;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Coarse event family, derived from the event-type prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Portfolio,
    Regime,
    Protection,
    Scoring,
    Diversification,
    System,
    Error,
}

impl EventCategory {
    /// Derive the category from a dotted event type such as
    /// `protection.whipsaw_block`.
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type.split('.').next().unwrap_or("") {
            "portfolio" => Self::Portfolio,
            "regime" => Self::Regime,
            "protection" => Self::Protection,
            "scoring" => Self::Scoring,
            "diversification" => Self::Diversification,
            "error" => Self::Error,
            _ => Self::System,
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Portfolio => write!(f, "portfolio"),
            Self::Regime => write!(f, "regime"),
            Self::Protection => write!(f, "protection"),
            Self::Scoring => write!(f, "scoring"),
            Self::Diversification => write!(f, "diversification"),
            Self::System => write!(f, "system"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Standardized event envelope with complete decision context.
///
/// Timestamps carry the pipeline's logical date, not wall-clock time, so
/// that event ordering follows rebalance ordering in a backtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub event_category: EventCategory,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub action: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<Regime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_before: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_after: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_before: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_after: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_allocation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_positions: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

impl PortfolioEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        event_type: &str,
        action: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            event_type: event_type.to_string(),
            event_category: EventCategory::from_event_type(event_type),
            trace_id: None,
            session_id: None,
            action: action.to_string(),
            reason: reason.into(),
            asset: None,
            regime: None,
            score_before: None,
            score_after: None,
            size_before: None,
            size_after: None,
            portfolio_allocation: None,
            active_positions: None,
            metadata: BTreeMap::new(),
            execution_time_ms: None,
        }
    }

    pub fn asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into());
        self
    }

    pub fn regime(mut self, regime: Regime) -> Self {
        self.regime = Some(regime);
        self
    }

    pub fn scores(mut self, before: Option<f64>, after: Option<f64>) -> Self {
        self.score_before = before;
        self.score_after = after;
        self
    }

    pub fn sizes(mut self, before: Option<f64>, after: Option<f64>) -> Self {
        self.size_before = before;
        self.size_after = after;
        self
    }

    pub fn portfolio(mut self, allocation: f64, active_positions: usize) -> Self {
        self.portfolio_allocation = Some(allocation);
        self.active_positions = Some(active_positions);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn elapsed_ms(mut self, ms: f64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Sink interface
// ---------------------------------------------------------------------------

/// Aggregate statistics handed to the sink when a session closes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets_generated: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Destination for pipeline events.
///
/// `emit` is fire-and-forget: implementations must not block the pipeline.
/// Trace and session ids returned by `start_*` are attached by the sink to
/// subsequent events that do not carry their own.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PortfolioEvent);

    fn start_trace(&self, operation: &str) -> String;

    fn end_trace(&self, trace_id: &str, success: bool);

    fn start_session(&self, kind: &str) -> String;

    fn end_session(&self, stats: SessionStats);
}

// ---------------------------------------------------------------------------
// Null sink
// ---------------------------------------------------------------------------

/// Sink that discards every event. Useful when auditing is not needed.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: PortfolioEvent) {}

    fn start_trace(&self, _operation: &str) -> String {
        Uuid::new_v4().to_string()
    }

    fn end_trace(&self, _trace_id: &str, _success: bool) {}

    fn start_session(&self, _kind: &str) -> String {
        Uuid::new_v4().to_string()
    }

    fn end_session(&self, _stats: SessionStats) {}
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Default capacity of the in-memory event log.
const DEFAULT_CAPACITY: usize = 10_000;

struct MemorySinkInner {
    events: Vec<PortfolioEvent>,
    trace_stack: Vec<String>,
    current_session: Option<String>,
    sessions_completed: usize,
}

/// Bounded in-memory event log. Oldest events are evicted FIFO once the
/// capacity is reached.
pub struct MemoryEventSink {
    inner: RwLock<MemorySinkInner>,
    capacity: usize,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(MemorySinkInner {
                events: Vec::new(),
                trace_stack: Vec::new(),
                current_session: None,
                sessions_completed: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of all retained events, oldest first.
    pub fn events(&self) -> Vec<PortfolioEvent> {
        self.inner.read().events.clone()
    }

    /// Events matching an exact dotted type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<PortfolioEvent> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Count of retained events per category.
    pub fn counts_by_category(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for event in self.inner.read().events.iter() {
            *counts.entry(event.event_category.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn sessions_completed(&self) -> usize {
        self.inner.read().sessions_completed
    }

    pub fn clear(&self) {
        self.inner.write().events.clear();
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, mut event: PortfolioEvent) {
        let mut inner = self.inner.write();
        if event.trace_id.is_none() {
            event.trace_id = inner.trace_stack.last().cloned();
        }
        if event.session_id.is_none() {
            event.session_id = inner.current_session.clone();
        }
        if inner.events.len() >= self.capacity {
            inner.events.remove(0);
        }
        inner.events.push(event);
    }

    fn start_trace(&self, operation: &str) -> String {
        let trace_id = format!("{}-{}", operation, Uuid::new_v4());
        self.inner.write().trace_stack.push(trace_id.clone());
        trace_id
    }

    fn end_trace(&self, trace_id: &str, _success: bool) {
        let mut inner = self.inner.write();
        inner.trace_stack.retain(|t| t != trace_id);
    }

    fn start_session(&self, kind: &str) -> String {
        let session_id = format!("{}-{}", kind, Uuid::new_v4());
        self.inner.write().current_session = Some(session_id.clone());
        session_id
    }

    fn end_session(&self, _stats: SessionStats) {
        let mut inner = self.inner.write();
        inner.current_session = None;
        inner.sessions_completed += 1;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn category_derived_from_prefix() {
        assert_eq!(
            EventCategory::from_event_type("protection.whipsaw_block"),
            EventCategory::Protection
        );
        assert_eq!(
            EventCategory::from_event_type("diversification.bucket_override_granted"),
            EventCategory::Diversification
        );
        assert_eq!(
            EventCategory::from_event_type("error.protection_check"),
            EventCategory::Error
        );
        assert_eq!(EventCategory::from_event_type("trace.start"), EventCategory::System);
    }

    #[test]
    fn memory_sink_attaches_current_trace_and_session() {
        let sink = MemoryEventSink::new();
        let session = sink.start_session("rebalancing");
        let trace = sink.start_trace("pipeline");

        sink.emit(PortfolioEvent::new(ts(), "portfolio.rebalance_start", "start", "go"));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trace_id.as_deref(), Some(trace.as_str()));
        assert_eq!(events[0].session_id.as_deref(), Some(session.as_str()));

        sink.end_trace(&trace, true);
        sink.emit(PortfolioEvent::new(ts(), "portfolio.rebalance_complete", "complete", "done"));
        assert!(sink.events()[1].trace_id.is_none());
    }

    #[test]
    fn memory_sink_evicts_oldest_beyond_capacity() {
        let sink = MemoryEventSink::with_capacity(2);
        for i in 0..3 {
            sink.emit(
                PortfolioEvent::new(ts(), "scoring.asset_scored", "score", format!("event {i}")),
            );
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "event 1");
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let event = PortfolioEvent::new(ts(), "protection.grace_start", "block", "score below threshold")
            .asset("AAPL")
            .regime(Regime::Goldilocks)
            .sizes(Some(0.1), Some(0.08))
            .meta("days_in_grace", 1);
        let json = serde_json::to_string(&event).unwrap();
        let back: PortfolioEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, "protection.grace_start");
        assert_eq!(back.event_category, EventCategory::Protection);
        assert_eq!(back.asset.as_deref(), Some("AAPL"));
        assert_eq!(back.size_after, Some(0.08));
    }
}
