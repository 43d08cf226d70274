//! Compile-time scheduler configuration
//!
//! All limits are fixed at build time. Nothing here is allocated.
//!
//! Author: Moroya Sakamoto

/// Maximum concurrently registered tasks
///
/// Registration beyond this returns [`SchedError::TableFull`](crate::SchedError::TableFull).
pub const MAX_TASKS: usize = 25;

/// Free-running hardware counter frequency (Hz)
///
/// The counter is 32 bits wide, so one full period is a little over
/// two minutes at this rate.
pub const TIMER_HZ: i64 = 33_330_000;

/// Ticks in one full period of the 32-bit hardware counter
pub const ROLLOVER_TICKS: i64 = 1 << 32;

/// Minimum wall time between two statistics dumps (seconds)
pub const STATS_INTERVAL_SECS: f64 = 10.0;

/// Nested `yield` calls allowed before the kernel refuses to recurse further.
/// Each level holds one scheduler frame plus one task frame on the stack.
pub const MAX_YIELD_DEPTH: usize = 8;

/// Yield timeouts shorter than this run the scheduler loop exactly once
pub const MIN_YIELD_TIMEOUT_SECS: f64 = 0.0001;

/// Scale applied to backoff and target interval by `boost_task`
pub const BOOST_FACTOR: f64 = 0.1;

/// Capacity of the owned task label (bytes)
pub const TASK_NAME_LEN: usize = 24;
