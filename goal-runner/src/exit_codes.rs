//! Stable exit codes for goal-runner CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, arguments, store state or other errors.
pub const INVALID: i32 = 1;
/// The referenced goal is unknown or already archived.
pub const NOT_ACTIVE: i32 = 2;
/// A plan was rejected by schema or structural validation.
pub const INVALID_PLAN: i32 = 3;
