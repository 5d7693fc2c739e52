// =============================================================================
// Error taxonomy for the rebalancing engine
// =============================================================================
//
// Two kinds of failure surface to callers:
//   - Configuration: invalid policy or analyzer wiring. Fatal, raised before
//     any state mutation.
//   - Rebalance: unrecoverable pipeline failure, carries the trace id of the
//     failed run so the event log can be correlated.
//
// Everything else degrades locally: missing data produces neutral scores with
// a missing-data flag, and failing secondary protection guards are recorded in
// the decision chain without blocking.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RebalanceError {
    /// Invalid policy or component configuration. Raised before any mutation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable pipeline failure. No targets were produced and no state
    /// beyond appended error events was mutated.
    #[error("rebalance failed (trace {trace_id}): {message}")]
    Rebalance { trace_id: String, message: String },
}

impl RebalanceError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Failure of an individual protection guard. Secondary guards fail open
/// (the failure is logged and the check treated as non-blocking); the
/// core-asset guard fails closed.
#[derive(Debug, Clone, Error)]
#[error("{system} check failed: {message}")]
pub struct GuardFailure {
    pub system: &'static str,
    pub message: String,
}

impl GuardFailure {
    pub fn new(system: &'static str, message: impl Into<String>) -> Self {
        Self {
            system,
            message: message.into(),
        }
    }
}
