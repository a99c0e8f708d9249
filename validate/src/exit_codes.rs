//! Stable exit codes for the `validate` CLI.

/// Every validated task was consistent (skipped tasks do not count).
pub const OK: i32 = 0;
/// Harness error: bad config, unreadable tasks root, or report write failure.
pub const ERROR: i32 = 1;
/// At least one task failed one or more of its trials.
pub const INCONSISTENT: i32 = 2;
