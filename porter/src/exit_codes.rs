//! Stable exit codes for porter CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Validation or execution failure, or a user-declined confirmation.
pub const INVALID: i32 = 1;
/// Execution suspended at a checkpoint awaiting disposition.
pub const CHECKPOINT_PENDING: i32 = 2;
/// Execution paused for semantic review.
pub const PAUSED_FOR_REVIEW: i32 = 3;
