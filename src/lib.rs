//! Cadence-RTOS — Cooperative Deadline-Aware Scheduler
//!
//! Don't preempt the audio, schedule around it.
//!
//! Single-threaded task scheduler for audio/control firmware:
//! - Static task table (no heap, no allocation)
//! - Per-task backoff / target / hard-deadline intervals
//! - Duration-aware selection: long jobs never push a due task past its deadline
//! - Cooperative `yield_until` that keeps the rest of the system running
//! - Periodic load statistics through `log`
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod config;
pub mod error;
pub mod timer;
pub mod task;
pub mod scheduler;
pub mod stats;
pub mod kernel;
#[cfg(feature = "cortex-m")]
pub mod port;

pub use error::{Result, SchedError};
pub use timer::{Clock, HardwareTimer, SoftwareTimer, Time};
pub use task::{Resources, RunCondition, Task, TaskFn, TaskId, TaskPriority, TaskSchedule, TaskState};
pub use scheduler::{Pick, Scheduler, Selection};
pub use stats::{SchedulerLoad, TaskReport};
pub use kernel::{Kernel, RunSummary};
#[cfg(feature = "cortex-m")]
pub use port::DwtTimer;
