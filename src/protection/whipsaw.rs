// =============================================================================
// Whipsaw protection — quantified defence against rapid position cycling
// =============================================================================
//
// A whipsaw cycle is one open followed by a later close of the same asset.
// The manager keeps a chronological event log per asset and denies:
//   - opening, when the asset is already open or the cycle count within the
//     protection window has reached the limit;
//   - closing, when the position is younger than the minimum duration.
//
// Events older than twice the protection window are pruned on every append.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionEventKind {
    Open,
    Close,
}

/// One entry in the per-asset position event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub kind: PositionEventKind,
    pub date: DateTime<Utc>,
    pub size: f64,
    pub reason: String,
    pub price: Option<f64>,
}

/// Snapshot of an asset's whipsaw state for reporting and block reasons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhipsawStatus {
    pub asset: String,
    pub position_open: bool,
    pub recent_cycles: usize,
    pub cycle_limit: usize,
    pub at_cycle_limit: bool,
    pub days_until_reset: i64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct WhipsawProtectionManager {
    max_cycles_per_period: usize,
    protection_period_days: i64,
    min_position_duration_hours: i64,
    history: BTreeMap<String, Vec<PositionEvent>>,
    active: BTreeMap<String, PositionEvent>,
}

impl WhipsawProtectionManager {
    pub fn new(
        max_cycles_per_period: usize,
        protection_period_days: i64,
        min_position_duration_hours: i64,
    ) -> Self {
        Self {
            max_cycles_per_period,
            protection_period_days,
            min_position_duration_hours,
            history: BTreeMap::new(),
            active: BTreeMap::new(),
        }
    }

    /// Check whether opening the asset would violate cycle limits.
    pub fn can_open(&self, asset: &str, date: DateTime<Utc>) -> (bool, String) {
        if let Some(open_event) = self.active.get(asset) {
            return (
                false,
                format!("position already open since {}", open_event.date),
            );
        }

        let cycles = self.complete_cycles(asset, date);
        if cycles >= self.max_cycles_per_period {
            let days_until_reset = self.days_until_reset(asset, date);
            return (
                false,
                format!(
                    "whipsaw protection: {cycles} cycles in last {} days (limit {}), resets in {days_until_reset} days",
                    self.protection_period_days, self.max_cycles_per_period
                ),
            );
        }

        (
            true,
            format!("can open ({cycles}/{} recent cycles)", self.max_cycles_per_period),
        )
    }

    /// Check whether closing now would be too quick.
    pub fn can_close(
        &self,
        asset: &str,
        open_date: DateTime<Utc>,
        date: DateTime<Utc>,
    ) -> (bool, String) {
        if !self.active.contains_key(asset) {
            return (true, "position not tracked as open, closure allowed".into());
        }

        let held = date - open_date;
        let min = Duration::hours(self.min_position_duration_hours);
        if held < min {
            let hours_held = held.num_minutes() as f64 / 60.0;
            return (
                false,
                format!(
                    "whipsaw protection: position duration {hours_held:.1}h < minimum {}h",
                    self.min_position_duration_hours
                ),
            );
        }

        (true, format!("minimum duration met ({}h)", held.num_hours()))
    }

    /// Append an open/close event and update active tracking.
    pub fn record_event(
        &mut self,
        asset: &str,
        kind: PositionEventKind,
        date: DateTime<Utc>,
        size: f64,
        reason: &str,
        price: Option<f64>,
    ) {
        let event = PositionEvent {
            kind,
            date,
            size,
            reason: reason.to_string(),
            price,
        };

        self.history
            .entry(asset.to_string())
            .or_default()
            .push(event.clone());

        match kind {
            PositionEventKind::Open => {
                debug!(asset, size, "position open recorded");
                self.active.insert(asset.to_string(), event);
            }
            PositionEventKind::Close => {
                if self.active.remove(asset).is_none() {
                    warn!(asset, "closing untracked position");
                }
            }
        }

        self.prune_asset(asset, date);
    }

    /// Complete open-then-close cycles inside the protection window ending
    /// at `date`.
    pub fn complete_cycles(&self, asset: &str, date: DateTime<Utc>) -> usize {
        let Some(events) = self.history.get(asset) else {
            return 0;
        };
        let cutoff = date - Duration::days(self.protection_period_days);

        let mut recent: Vec<&PositionEvent> =
            events.iter().filter(|e| e.date > cutoff && e.date <= date).collect();
        recent.sort_by_key(|e| e.date);

        let mut cycles = 0;
        let mut expecting_open = true;
        for event in recent {
            match event.kind {
                PositionEventKind::Open if expecting_open => expecting_open = false,
                PositionEventKind::Close if !expecting_open => {
                    cycles += 1;
                    expecting_open = true;
                }
                _ => {}
            }
        }
        cycles
    }

    /// Days until the oldest in-window cycle falls out of the window.
    pub fn days_until_reset(&self, asset: &str, date: DateTime<Utc>) -> i64 {
        let Some(events) = self.history.get(asset) else {
            return 0;
        };
        let cutoff = date - Duration::days(self.protection_period_days);
        events
            .iter()
            .filter(|e| e.date > cutoff && e.date <= date)
            .map(|e| self.protection_period_days - (date - e.date).num_days())
            .min()
            .unwrap_or(0)
            .max(0)
    }

    pub fn is_position_open(&self, asset: &str) -> bool {
        self.active.contains_key(asset)
    }

    pub fn open_event(&self, asset: &str) -> Option<&PositionEvent> {
        self.active.get(asset)
    }

    pub fn protection_status(&self, asset: &str, date: DateTime<Utc>) -> WhipsawStatus {
        let recent_cycles = self.complete_cycles(asset, date);
        WhipsawStatus {
            asset: asset.to_string(),
            position_open: self.is_position_open(asset),
            recent_cycles,
            cycle_limit: self.max_cycles_per_period,
            at_cycle_limit: recent_cycles >= self.max_cycles_per_period,
            days_until_reset: self.days_until_reset(asset, date),
        }
    }

    /// Drop events older than twice the protection window for every asset.
    pub fn cleanup_old_events(&mut self, now: DateTime<Utc>) {
        let assets: Vec<String> = self.history.keys().cloned().collect();
        for asset in assets {
            self.prune_asset(&asset, now);
        }
        self.history.retain(|_, events| !events.is_empty());
    }

    fn prune_asset(&mut self, asset: &str, now: DateTime<Utc>) {
        let retention = Duration::days(self.protection_period_days * 2);
        if let Some(events) = self.history.get_mut(asset) {
            events.retain(|e| now - e.date <= retention);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn manager() -> WhipsawProtectionManager {
        WhipsawProtectionManager::new(1, 14, 4)
    }

    #[test]
    fn one_cycle_blocks_reopen_within_window() {
        let mut m = manager();
        m.record_event("SOL", PositionEventKind::Open, day(0), 0.1, "entry", None);
        m.record_event("SOL", PositionEventKind::Close, day(1), 0.1, "exit", None);

        assert_eq!(m.complete_cycles("SOL", day(2)), 1);
        let (ok, reason) = m.can_open("SOL", day(2));
        assert!(!ok);
        assert!(reason.contains("whipsaw protection"), "{reason}");
    }

    #[test]
    fn reopen_allowed_after_window_passes() {
        let mut m = manager();
        m.record_event("SOL", PositionEventKind::Open, day(0), 0.1, "entry", None);
        m.record_event("SOL", PositionEventKind::Close, day(1), 0.1, "exit", None);

        // 16 days later the close has left the 14-day window.
        let (ok, _) = m.can_open("SOL", day(16));
        assert!(ok);
    }

    #[test]
    fn open_denied_while_position_active() {
        let mut m = manager();
        m.record_event("SOL", PositionEventKind::Open, day(0), 0.1, "entry", None);
        let (ok, reason) = m.can_open("SOL", day(1));
        assert!(!ok);
        assert!(reason.contains("already open"));
    }

    #[test]
    fn close_denied_under_min_duration() {
        let mut m = manager();
        let open = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        m.record_event("SOL", PositionEventKind::Open, open, 0.1, "entry", None);

        let two_hours_later = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let (ok, reason) = m.can_close("SOL", open, two_hours_later);
        assert!(!ok);
        assert!(reason.contains("minimum 4h"), "{reason}");

        let five_hours_later = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        let (ok, _) = m.can_close("SOL", open, five_hours_later);
        assert!(ok);
    }

    #[test]
    fn unpaired_open_is_not_a_cycle() {
        let mut m = manager();
        m.record_event("SOL", PositionEventKind::Open, day(0), 0.1, "entry", None);
        assert_eq!(m.complete_cycles("SOL", day(1)), 0);

        // close without matching open in window also counts nothing.
        let mut m2 = manager();
        m2.record_event("ETH", PositionEventKind::Close, day(0), 0.1, "stale exit", None);
        assert_eq!(m2.complete_cycles("ETH", day(1)), 0);
    }

    #[test]
    fn retention_prunes_old_events() {
        let mut m = manager();
        m.record_event("SOL", PositionEventKind::Open, day(0), 0.1, "entry", None);
        m.record_event("SOL", PositionEventKind::Close, day(1), 0.1, "exit", None);

        // 2 * 14 days retention, so both events expire by day 30.
        m.cleanup_old_events(day(30));
        assert!(m.history.get("SOL").is_none());
    }

    #[test]
    fn status_reports_cycle_pressure() {
        let mut m = manager();
        m.record_event("SOL", PositionEventKind::Open, day(0), 0.1, "entry", None);
        m.record_event("SOL", PositionEventKind::Close, day(1), 0.1, "exit", None);

        let status = m.protection_status("SOL", day(2));
        assert!(status.at_cycle_limit);
        assert_eq!(status.recent_cycles, 1);
        assert!(!status.position_open);
        assert!(status.days_until_reset > 0);
    }
}
