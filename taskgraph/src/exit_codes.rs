//! Stable exit codes for taskgraph CLI commands.

/// Run finished (including partial success) or command succeeded.
pub const OK: i32 = 0;
/// Invalid input, config or subtask file, or any other error.
pub const INVALID: i32 = 1;
/// Planning could not proceed (empty task, invalid plan, unresumable run).
pub const PLANNING_FAILED: i32 = 2;
