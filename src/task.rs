//! Task definition — fixed-size, no-alloc task descriptors
//!
//! A task is a body function plus a timing contract: either an interval
//! schedule (backoff ≤ target ≤ max) or a readiness predicate. The
//! descriptor also carries the running statistics the selection algorithm
//! feeds on (average duration, last call/finish).
//!
//! Author: Moroya Sakamoto

use bitflags::bitflags;
use heapless::String;

use crate::config::{BOOST_FACTOR, TASK_NAME_LEN};
use crate::kernel::Kernel;
use crate::timer::{HardwareTimer, Time};

/// Task body, called with the kernel so it can yield or inspect itself
pub type TaskFn<T> = fn(&mut Kernel<T>);

/// Readiness predicate for conditional tasks
pub type RunCondition = fn() -> bool;

/// Owned, fixed-capacity task label
pub type TaskName = String<TASK_NAME_LEN>;

/// Handle to a task table slot
///
/// Valid until the task is removed; slots are reused afterwards. Any index
/// is representable; lookups reject the ones past the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(usize);

impl TaskId {
    /// Handle for slot `index`
    pub const fn new(index: usize) -> Self {
        TaskId(index)
    }

    /// Slot index
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Task priority (lower number = higher precedence)
///
/// Registration order in the firmware decides the number: audio render
/// first, card and UI housekeeping last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskPriority(pub u8);

impl TaskPriority {
    /// Highest priority (audio rate tasks)
    pub const CRITICAL: TaskPriority = TaskPriority(0);
    /// High priority (MIDI, encoders)
    pub const HIGH: TaskPriority = TaskPriority(1);
    /// Normal priority (playback, UI)
    pub const NORMAL: TaskPriority = TaskPriority(2);
    /// Low priority (card I/O, display flush)
    pub const LOW: TaskPriority = TaskPriority(3);
    /// Background
    pub const IDLE: TaskPriority = TaskPriority(255);
}

bitflags! {
    /// Shared resources a task body touches
    ///
    /// A task is held back while any task on the call stack owns one of
    /// its resources.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Resources: u8 {
        /// Storage card bus
        const SD = 0b0000_0001;
        /// Card housekeeping routine (not re-entrant)
        const SD_ROUTINE = 0b0000_0010;
        /// USB host/device stack
        const USB = 0b0000_0100;
        /// Front panel controller link
        const PIC = 0b0000_1000;
        /// Audio engine buffers
        const AUDIO = 0b0001_0000;
    }
}

/// Timing contract of an interval task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSchedule {
    /// Precedence
    pub priority: TaskPriority,
    /// Minimum spacing after the previous finish
    pub backoff: Time,
    /// Desired spacing between calls
    pub target_interval: Time,
    /// Hard deadline since the previous call
    pub max_interval: Time,
}

impl TaskSchedule {
    /// Interval schedule
    pub const fn new(priority: TaskPriority, backoff: Time, target: Time, max: Time) -> Self {
        Self {
            priority,
            backoff,
            target_interval: target,
            max_interval: max,
        }
    }

    /// Schedule used for a one-shot task: due after `wait`, overdue at twice that
    pub fn once(priority: TaskPriority, wait: Time) -> Self {
        Self::new(priority, wait, wait, wait * 2)
    }

    /// Conditional tasks are due as soon as they become runnable
    pub const fn immediate(priority: TaskPriority) -> Self {
        Self::new(priority, Time::ZERO, Time::ZERO, Time::ZERO)
    }

    /// max ≥ target ≥ backoff
    pub fn is_consistent(&self) -> bool {
        self.max_interval >= self.target_interval && self.target_interval >= self.backoff
    }
}

/// What happens to a task after it runs
#[derive(Debug, Clone, Copy)]
pub enum TaskKind {
    /// Stays in the table
    Repeating,
    /// Removed after a single run
    Once,
    /// Joins the runnable set once its predicate fires, then runs once
    Conditional(RunCondition),
}

/// Execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not on the call stack
    Idle,
    /// Body is executing
    Running,
    /// Body called `yield`; its frame is still live below the nested loop
    Yielding,
}

/// Running duration statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatBlock {
    /// Running average, `(average + latest) / 2`
    pub average: Time,
    #[cfg(feature = "detailed-stats")]
    pub min: Time,
    #[cfg(feature = "detailed-stats")]
    pub max: Time,
}

impl StatBlock {
    /// No samples yet
    pub const fn new() -> Self {
        Self {
            average: Time::ZERO,
            #[cfg(feature = "detailed-stats")]
            min: Time::MAX,
            #[cfg(feature = "detailed-stats")]
            max: Time::ZERO,
        }
    }

    /// Fold in one sample
    #[inline]
    pub fn update(&mut self, value: Time) {
        #[cfg(feature = "detailed-stats")]
        {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.average = self.average.average(value);
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for StatBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Task descriptor
pub struct Task<T: HardwareTimer> {
    /// Body (None = slot is free)
    pub(crate) body: Option<TaskFn<T>>,
    /// Label for statistics
    pub name: TaskName,
    /// Priority and intervals
    pub schedule: TaskSchedule,
    /// Lifetime policy
    pub kind: TaskKind,
    /// False until a conditional task's predicate has fired
    pub runnable: bool,
    /// Call-stack state
    pub state: TaskState,
    /// Resources held while this task is on the stack
    pub resources: Resources,
    /// `boost` has been applied
    pub boosted: bool,
    /// Start of the last invocation
    pub last_call_time: Time,
    /// End of the last invocation
    pub last_finish_time: Time,
    /// Execution duration
    pub duration: StatBlock,
    /// Start time relative to the ideal call time
    #[cfg(feature = "detailed-stats")]
    pub latency: StatBlock,
    /// Busy time since the last statistics reset
    pub total_time: Time,
    /// Calls since the last statistics reset
    pub times_called: u32,
    /// Times chosen because the hard deadline had passed
    pub overruns: u32,
    /// Registration counter value, tells reused slots apart
    pub(crate) serial: u32,
}

impl<T: HardwareTimer> Task<T> {
    /// Empty task slot
    pub fn empty() -> Self {
        Self {
            body: None,
            name: String::new(),
            schedule: TaskSchedule::immediate(TaskPriority::IDLE),
            kind: TaskKind::Repeating,
            runnable: false,
            state: TaskState::Idle,
            resources: Resources::empty(),
            boosted: false,
            last_call_time: Time::ZERO,
            last_finish_time: Time::ZERO,
            duration: StatBlock::new(),
            #[cfg(feature = "detailed-stats")]
            latency: StatBlock::new(),
            total_time: Time::ZERO,
            times_called: 0,
            overruns: 0,
            serial: 0,
        }
    }

    fn with_body(body: TaskFn<T>, schedule: TaskSchedule, kind: TaskKind, name: &str) -> Self {
        Self {
            body: Some(body),
            name: task_name(name),
            schedule,
            kind,
            runnable: true,
            ..Self::empty()
        }
    }

    /// Periodic task
    pub fn repeating(body: TaskFn<T>, schedule: TaskSchedule, name: &str) -> Self {
        Self::with_body(body, schedule, TaskKind::Repeating, name)
    }

    /// One-shot task, due `wait` after `registered_at`
    pub fn once(body: TaskFn<T>, priority: TaskPriority, wait: Time, registered_at: Time, name: &str) -> Self {
        let mut task = Self::with_body(body, TaskSchedule::once(priority, wait), TaskKind::Once, name);
        task.last_call_time = registered_at;
        task
    }

    /// Task gated on `condition`
    pub fn conditional(body: TaskFn<T>, priority: TaskPriority, condition: RunCondition, name: &str) -> Self {
        let mut task = Self::with_body(
            body,
            TaskSchedule::immediate(priority),
            TaskKind::Conditional(condition),
            name,
        );
        task.runnable = false;
        task
    }

    /// Is this slot in use?
    pub fn is_occupied(&self) -> bool {
        self.body.is_some()
    }

    /// Occupied and allowed into the sorted view
    pub fn is_runnable(&self) -> bool {
        self.is_occupied() && self.runnable
    }

    /// Task label
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Precedence
    pub fn priority(&self) -> TaskPriority {
        self.schedule.priority
    }

    /// Deleted from the table after running?
    pub fn remove_after_use(&self) -> bool {
        !matches!(self.kind, TaskKind::Repeating)
    }

    /// Could run at `now`: off the stack, past its backoff, resources free
    pub fn is_ready(&self, now: Time, held: Resources) -> bool {
        self.is_runnable()
            && self.state == TaskState::Idle
            && now - self.last_finish_time > self.schedule.backoff
            && !held.intersects(self.resources)
    }

    /// Hard deadline has passed
    pub fn is_overdue(&self, now: Time) -> bool {
        now - self.last_call_time > self.schedule.max_interval
    }

    /// When to start so the run ends on the target interval
    pub fn ideal_call_time(&self) -> Time {
        self.last_call_time + self.schedule.target_interval - self.duration.average
    }

    /// Last start that still ends inside the hard deadline
    pub fn latest_call_time(&self) -> Time {
        self.last_call_time + self.schedule.max_interval - self.duration.average
    }

    /// Poll a conditional task's predicate; true on the transition to runnable
    pub fn check_condition(&mut self) -> bool {
        match self.kind {
            TaskKind::Conditional(condition) if self.is_occupied() && !self.runnable => {
                self.runnable = condition();
                self.runnable
            }
            _ => false,
        }
    }

    /// Fold a finished (or yielded) run into the statistics
    pub fn update_next_times(&mut self, runtime: Time, finish: Time) {
        self.last_finish_time = finish;
        self.duration.update(runtime);
        self.total_time += runtime;
        self.times_called = self.times_called.saturating_add(1);
    }

    /// Shrink backoff and target interval, once
    pub fn boost(&mut self) {
        if !self.boosted {
            self.boosted = true;
            self.schedule.backoff = self.schedule.backoff * BOOST_FACTOR;
            self.schedule.target_interval = self.schedule.target_interval * BOOST_FACTOR;
        }
    }

    /// Zero the counters reported by the statistics dump
    pub fn reset_stats(&mut self) {
        self.total_time = Time::ZERO;
        self.times_called = 0;
        self.duration.reset();
        #[cfg(feature = "detailed-stats")]
        self.latency.reset();
    }
}

/// Copy `name` into an owned label, truncating at a char boundary
pub fn task_name(name: &str) -> TaskName {
    let mut label = TaskName::new();
    for c in name.chars() {
        if label.push(c).is_err() {
            break;
        }
    }
    label
}
