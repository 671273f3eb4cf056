//! Process exit codes.

/// The run reached a terminal state, or the command succeeded.
pub const SUCCESS: i32 = 0;

/// Startup failure or any other error.
pub const STARTUP_ERROR: i32 = 1;

/// The run stopped early and can be resumed.
pub const RESUMABLE: i32 = 3;
