// =============================================================================
// Bucket diversification — caps, minimum representation, smart overrides
// =============================================================================

pub mod limits;
pub mod smart;

pub use limits::{BucketEnforcement, BucketLimitsConfig, BucketLimitsEnforcer, RejectedScore};
pub use smart::SmartDiversificationManager;
