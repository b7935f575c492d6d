//! Stable exit codes for evolver CLI commands.

/// Command succeeded (for `cycle`: the change was committed).
pub const OK: i32 = 0;
/// Command failed due to invalid config, layout, input or an internal fault.
pub const INVALID: i32 = 1;
/// `evolver check`/`evolver parse` found diagnostics, or `evolver cycle` rolled back.
pub const DIAGNOSTICS: i32 = 2;
