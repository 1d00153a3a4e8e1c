//! Stable exit codes for the supervisor and probe binaries.

/// Graceful shutdown (quit, end of input, termination request) or a completed probe run.
pub const OK: i32 = 0;
/// Setup failure or fatal read error.
pub const FAILURE: i32 = 1;
