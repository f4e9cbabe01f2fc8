//! Stable exit codes for runner CLI commands.

/// Command succeeded or the run completed.
pub const OK: i32 = 0;
/// Command failed due to invalid data dir, spec, task list, or other errors.
pub const INVALID: i32 = 1;
/// The run finished with at least one failed task.
pub const FAILED: i32 = 2;
/// The run was stopped before it finished.
pub const STOPPED: i32 = 3;
