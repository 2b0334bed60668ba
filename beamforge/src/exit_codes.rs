//! Stable exit codes for `beamforge` CLI commands.

/// Command succeeded; `generate`/`resume` produced a validated project.
pub const OK: i32 = 0;
/// Invalid config, checkpoint or input, or an infrastructure failure.
pub const INVALID: i32 = 1;
/// A stage search ran out of candidates without a validated solution.
pub const EXHAUSTED: i32 = 2;
/// The model asked a clarifying question; answer it with `beamforge resume`.
pub const NEEDS_INPUT: i32 = 3;
