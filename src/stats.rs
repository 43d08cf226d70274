//! Load statistics
//!
//! Per-task busy time and duration figures live in the task descriptors;
//! this module holds the scheduler-wide counters and formats the periodic
//! dump. The kernel only dumps when it found nothing to run, at most once
//! per [`STATS_INTERVAL_SECS`], and resets every counter afterwards.
//!
//! Author: Moroya Sakamoto

use core::fmt;

use crate::config::STATS_INTERVAL_SECS;
use crate::task::Task;
use crate::timer::{HardwareTimer, Time};

/// Scheduler-wide time accounting since the last reset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerLoad {
    /// Sum of task run durations
    pub cpu_time: Time,
    /// Everything between task runs: selection, interrupts, idle cycles
    pub overhead: Time,
    /// End of the most recent task run (or idle cycle)
    pub last_finish_time: Time,
    /// When the last dump was written
    pub last_report: Time,
}

impl SchedulerLoad {
    /// All zero
    pub const fn new() -> Self {
        Self {
            cpu_time: Time::ZERO,
            overhead: Time::ZERO,
            last_finish_time: Time::ZERO,
            last_report: Time::ZERO,
        }
    }

    /// Is another dump allowed at `now`?
    pub fn report_due(&self, now: Time) -> bool {
        now > self.last_report + Time::from_secs(STATS_INTERVAL_SECS)
    }

    /// Share of accounted time spent in task bodies
    pub fn working_percent(&self) -> f64 {
        percent(self.cpu_time, self.cpu_time + self.overhead)
    }

    /// Share of accounted time spent outside task bodies
    pub fn overhead_percent(&self) -> f64 {
        percent(self.overhead, self.cpu_time + self.overhead)
    }

    /// Zero the counters, keep the timestamps
    pub fn reset(&mut self) {
        self.cpu_time = Time::ZERO;
        self.overhead = Time::ZERO;
    }
}

impl Default for SchedulerLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SchedulerLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Working time: {:5.2}%, Overhead: {:5.2}%",
            self.working_percent(),
            self.overhead_percent()
        )
    }
}

fn percent(part: Time, whole: Time) -> f64 {
    if whole == Time::ZERO {
        0.0
    } else {
        100.0 * part.ticks() as f64 / whole.ticks() as f64
    }
}

fn rate(count: u32, window: Time) -> f64 {
    if window <= Time::ZERO {
        0.0
    } else {
        count as f64 / window.as_secs()
    }
}

/// One line of the statistics dump
#[derive(Debug, Clone, Copy)]
pub struct TaskReport<'a> {
    pub name: &'a str,
    /// Share of total task time (%)
    pub load_percent: f64,
    /// Mean duration over the window
    pub mean_duration: Time,
    /// Smoothed duration the scheduler predicts with
    pub average_duration: Time,
    pub times_called: u32,
    /// Calls per second over the window
    pub call_rate: f64,
    pub overruns: u32,
    #[cfg(feature = "detailed-stats")]
    pub min_duration: Time,
    #[cfg(feature = "detailed-stats")]
    pub max_duration: Time,
    #[cfg(feature = "detailed-stats")]
    pub latency: (Time, Time, Time),
}

impl<'a> TaskReport<'a> {
    /// Summarise `task` against the window's total task time
    ///
    /// `window` is the wall time the counters cover.
    pub fn new<T: HardwareTimer>(task: &'a Task<T>, cpu_time: Time, window: Time) -> Self {
        let mean_duration = if task.times_called == 0 {
            Time::ZERO
        } else {
            task.total_time / task.times_called as i64
        };
        Self {
            name: task.name(),
            load_percent: percent(task.total_time, cpu_time),
            mean_duration,
            average_duration: task.duration.average,
            times_called: task.times_called,
            call_rate: rate(task.times_called, window),
            overruns: task.overruns,
            #[cfg(feature = "detailed-stats")]
            min_duration: task.duration.min,
            #[cfg(feature = "detailed-stats")]
            max_duration: task.duration.max,
            #[cfg(feature = "detailed-stats")]
            latency: (task.latency.min, task.latency.average, task.latency.max),
        }
    }
}

impl fmt::Display for TaskReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let us = |t: Time| t.as_secs() * 1_000_000.0;
        write!(f, "Load: {:5.2}, ", self.load_percent)?;
        #[cfg(feature = "detailed-stats")]
        {
            let ms = |t: Time| t.as_secs() * 1_000.0;
            write!(
                f,
                "Dur: {:8.3}/{:8.3}/{:9.3} us Latency: {:8.3}/{:8.3}/{:8.3} ms ",
                us(self.min_duration),
                us(self.mean_duration),
                us(self.max_duration),
                ms(self.latency.0),
                ms(self.latency.1),
                ms(self.latency.2),
            )?;
        }
        #[cfg(not(feature = "detailed-stats"))]
        write!(f, "Dur: {:9.3} us ", us(self.average_duration))?;
        write!(
            f,
            "Calls: {:6} ({:6.1} Hz), Overruns: {}, Task: {}",
            self.times_called,
            self.call_rate,
            self.overruns,
            self.name
        )
    }
}
