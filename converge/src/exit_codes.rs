//! Stable exit codes for the converge CLI.

/// Run finished under the failure threshold with unreachable hosts within tolerance.
pub const OK: i32 = 0;
/// Invalid config, inventory or deploy file, or another error before the run started.
pub const INVALID: i32 = 1;
/// An operation's failure ratio exceeded `fail_threshold` and the run was aborted.
pub const THRESHOLD_EXCEEDED: i32 = 2;
/// More hosts ended unreachable than `unreachable_tolerance` allows.
pub const UNREACHABLE: i32 = 3;
