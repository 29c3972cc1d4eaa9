//! Process exit codes shared by the supervisor and the outer watchdog.

/// Clean stop, nothing to relaunch.
pub const OK: i32 = 0;
/// Pool stopped respawning after repeated crashes.
pub const CRASH_STORM: i32 = 3;
/// Graceful restart requested; the watchdog relaunches.
pub const RESTART: i32 = 42;
/// Panic stop; the watchdog sweeps orphans and does not relaunch.
pub const PANIC: i32 = 99;
