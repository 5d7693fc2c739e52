// =============================================================================
// Position sizing — two-pass pipeline
// =============================================================================
//
// First pass (`DynamicPositionSizer`) turns scores into raw weights under the
// looser initial cap. Second pass (`TwoStagePositionSizer`) enforces the
// stricter final cap, redistributes to uncapped positions, and places any
// residual allocation.
// =============================================================================

pub mod dynamic;
pub mod two_stage;

pub use dynamic::{
    DynamicPositionSizer, SizeCategory, SizedAsset, SizingMode, ALLOCATION_GRAIN,
};
pub use two_stage::{
    ResidualStrategy, TwoStageOutcome, TwoStagePositionSizer, CASH_EQUIVALENT,
};
