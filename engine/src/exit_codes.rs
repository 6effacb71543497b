//! Stable exit codes for `loom` hook invocations.

/// Handler allowed the action (no output).
pub const ALLOW: i32 = 0;
/// Handler had no opinion; the caller proceeds.
pub const PASSTHROUGH: i32 = 0;
/// The operation failed (invalid input, corrupt state, lock timeout, failed gate).
pub const ERROR: i32 = 1;
/// The action was explicitly denied; the reason is on stderr.
pub const BLOCK: i32 = 2;
