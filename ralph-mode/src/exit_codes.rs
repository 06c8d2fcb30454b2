//! Stable exit codes for ralph-mode CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input (empty prompt, bad tasks file, duplicate task ids, ...).
pub const INVALID: i32 = 1;
/// Operation not applicable: no active loop, loop already active, or wrong mode.
pub const NOT_APPLICABLE: i32 = 2;
/// `complete` did not find the completion promise (keep iterating).
pub const INCOMPLETE: i32 = 3;
/// Runtime failure: lock timeout, corrupted state, or I/O error.
pub const FAILURE: i32 = 4;
