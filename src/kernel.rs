//! Kernel — scheduler loop, task execution and cooperative yield
//!
//! Combines the task table, the clock and the load counters into one
//! explicitly constructed instance. Task bodies receive `&mut Kernel`, so a
//! body can call [`Kernel::yield_until`] to run the scheduler loop on its own
//! stack frame until a condition holds. Yield is plain recursion: each level
//! costs one scheduler frame and one task frame, and depth is capped at
//! [`MAX_YIELD_DEPTH`].
//!
//! Author: Moroya Sakamoto

use crate::config::{MAX_YIELD_DEPTH, MIN_YIELD_TIMEOUT_SECS};
use crate::error::{Result, SchedError};
use crate::scheduler::{Pick, Scheduler};
use crate::stats::{SchedulerLoad, TaskReport};
use crate::task::{Resources, RunCondition, Task, TaskFn, TaskId, TaskPriority, TaskSchedule, TaskState};
use crate::timer::{Clock, HardwareTimer, SoftwareTimer, Time};

/// Cooperative scheduler kernel
pub struct Kernel<T: HardwareTimer> {
    /// Task table and sorted view
    pub scheduler: Scheduler<T>,
    /// Monotonic clock over the hardware counter
    clock: Clock<T>,
    /// Busy/overhead accounting
    load: SchedulerLoad,
    /// Bound for test runs started with a finite duration
    must_end_before: Option<Time>,
    /// Task whose body is executing (innermost)
    current: Option<TaskId>,
    /// Cleared by `ignore_for_stats` for the current run
    count_this_task: bool,
    /// Resources owned by tasks on the call stack
    held: Resources,
    /// Nested `yield_until` calls in progress
    yield_depth: usize,
    /// Task runs since creation
    pub tasks_executed: u64,
    /// Loop iterations that found nothing to select
    pub idle_cycles: u64,
}

impl<T: HardwareTimer> Kernel<T> {
    /// Create kernel over a hardware timer
    pub fn new(timer: T) -> Self {
        Self {
            scheduler: Scheduler::new(),
            clock: Clock::new(timer),
            load: SchedulerLoad::new(),
            must_end_before: None,
            current: None,
            count_this_task: true,
            held: Resources::empty(),
            yield_depth: 0,
            tasks_executed: 0,
            idle_cycles: 0,
        }
    }

    // -----------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------

    /// Register a periodic task
    pub fn add_repeating_task(&mut self, body: TaskFn<T>, schedule: TaskSchedule, name: &str) -> Result<TaskId> {
        if !schedule.is_consistent() {
            log::warn!("task '{}': expected max >= target >= backoff", name);
        }
        self.scheduler.register(Task::repeating(body, schedule, name))
    }

    /// Register a task that runs once, `wait` after now
    ///
    /// Before the clock is running the wait counts from scheduler start.
    pub fn add_once_task(&mut self, body: TaskFn<T>, priority: TaskPriority, wait: Time, name: &str) -> Result<TaskId> {
        let registered_at = if self.is_running() { self.now() } else { Time::ZERO };
        self.scheduler
            .register(Task::once(body, priority, wait, registered_at, name))
    }

    /// Register a task that runs once after `condition` returns true
    pub fn add_conditional_task(
        &mut self,
        body: TaskFn<T>,
        priority: TaskPriority,
        condition: RunCondition,
        name: &str,
    ) -> Result<TaskId> {
        self.scheduler
            .register(Task::conditional(body, priority, condition, name))
    }

    /// Unregister a task
    pub fn remove_task(&mut self, id: TaskId) -> Result<()> {
        self.scheduler.remove(id)
    }

    /// Shorten a task's backoff and target interval for good
    pub fn boost_task(&mut self, id: TaskId) -> Result<()> {
        self.scheduler.boost(id)
    }

    /// Declare the shared resources a task's body uses
    pub fn set_task_resources(&mut self, id: TaskId, resources: Resources) -> Result<()> {
        self.scheduler.set_resources(id, resources)
    }

    // -----------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------

    /// Run the scheduler loop
    ///
    /// `Time::ZERO` runs forever; a finite duration is for bounded test runs
    /// and is also passed to selection as the caller deadline.
    pub fn start(&mut self, duration: Time) -> RunSummary {
        self.clock.start();
        let started = self.now();
        let executed_before = self.tasks_executed;
        let idle_before = self.idle_cycles;

        let forever = duration == Time::ZERO;
        self.must_end_before = if forever { None } else { Some(started + duration) };
        while forever || self.now() < started + duration {
            self.tick();
        }
        self.must_end_before = None;

        RunSummary {
            elapsed: self.now() - started,
            tasks_executed: self.tasks_executed - executed_before,
            idle_cycles: self.idle_cycles - idle_before,
        }
    }

    /// One loop iteration: run the best task, or do the idle work
    ///
    /// Returns the task that ran, if any.
    pub fn tick(&mut self) -> Option<TaskId> {
        let now = self.now();
        match self.scheduler.choose_best_task(now, self.must_end_before, self.held) {
            Some(selection) => {
                if selection.pick == Pick::Overdue {
                    if let Ok(task) = self.scheduler.get_mut(selection.id) {
                        task.overruns = task.overruns.saturating_add(1);
                    }
                }
                self.dispatch(selection.id)
            }
            None => self.idle_cycle(now),
        }
    }

    fn idle_cycle(&mut self, now: Time) -> Option<TaskId> {
        self.idle_cycles += 1;
        self.load.overhead += now - self.load.last_finish_time;
        self.load.last_finish_time = now;

        let added = self.check_conditional_tasks();
        // A freshly runnable task beats a statistics dump
        if !added && self.load.report_due(now) {
            self.load.last_report = now;
            self.print_stats();
        }
        self.run_highest_priority_task()
    }

    /// The top task (audio) is always wanted; run it if it can go
    fn run_highest_priority_task(&mut self) -> Option<TaskId> {
        let id = self.scheduler.highest_priority_task()?;
        let now = self.now();
        let ready = self
            .scheduler
            .get(id)
            .is_ok_and(|task| task.is_ready(now, self.held));
        if ready {
            self.dispatch(id)
        } else {
            None
        }
    }

    fn dispatch(&mut self, id: TaskId) -> Option<TaskId> {
        match self.run_task(id) {
            Ok(()) => Some(id),
            Err(e) => {
                log::error!("failed to run task {}: {}", id.index(), e);
                None
            }
        }
    }

    /// Poll conditional tasks; true if any became runnable
    pub fn check_conditional_tasks(&mut self) -> bool {
        self.scheduler.check_conditional_tasks()
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Run one task body and fold its timing into the descriptor
    ///
    /// One-shot and conditional tasks are removed once the body returns.
    pub fn run_task(&mut self, id: TaskId) -> Result<()> {
        let now = self.now();
        let task = self.scheduler.get_mut(id)?;
        let body = task.body.ok_or(SchedError::UnknownTask(id))?;
        let serial = task.serial;
        #[cfg(feature = "detailed-stats")]
        {
            let latency = now - task.ideal_call_time();
            task.latency.update(latency);
        }
        task.last_call_time = now;
        task.state = TaskState::Running;
        let resources = task.resources;

        // Includes interrupt time as well as our own bookkeeping
        self.load.overhead += now - self.load.last_finish_time;

        let outer_current = self.current.replace(id);
        let outer_count = core::mem::replace(&mut self.count_this_task, true);
        let outer_held = self.held;
        self.held |= resources;

        body(self);

        let finish = self.now();
        self.held = outer_held;
        let counted = core::mem::replace(&mut self.count_this_task, outer_count);
        self.current = outer_current;
        self.tasks_executed += 1;
        self.load.last_finish_time = finish;

        let remove = match self.scheduler.get_mut(id) {
            Ok(task) if task.serial == serial => {
                // Measured from the last yield return, if the body yielded
                let runtime = finish - task.last_call_time;
                self.load.cpu_time += runtime;
                task.state = TaskState::Idle;
                if task.remove_after_use() {
                    true
                } else {
                    if counted {
                        task.update_next_times(runtime, finish);
                    } else {
                        task.last_finish_time = finish;
                    }
                    false
                }
            }
            _ => {
                log::warn!("task {} was removed while it was running", id.index());
                false
            }
        };
        if remove {
            self.scheduler.remove(id)?;
        }
        Ok(())
    }

    /// Let other tasks run until `until` holds or `timeout` passes
    ///
    /// Called from inside a task body. The caller is accounted as if it had
    /// finished, then the scheduler loop runs on top of its frame. The
    /// caller itself is never selected while it waits. A timeout below
    /// [`MIN_YIELD_TIMEOUT_SECS`] runs the loop exactly once.
    ///
    /// Returns whether `until` was met.
    pub fn yield_until<F>(&mut self, mut until: F, timeout: Time) -> Result<bool>
    where
        F: FnMut() -> bool,
    {
        if self.yield_depth >= MAX_YIELD_DEPTH {
            log::error!("yield refused at depth {}", self.yield_depth);
            return Err(SchedError::YieldDepthExceeded {
                depth: self.yield_depth,
            });
        }

        let yielded_at = self.now();
        let mut yielding = None;
        if let Some(id) = self.current {
            let counted = self.count_this_task;
            if let Ok(task) = self.scheduler.get_mut(id) {
                yielding = Some((id, task.serial));
                let runtime = yielded_at - task.last_call_time;
                self.load.cpu_time += runtime;
                // Lands in its backoff window, and off the runnable set
                task.state = TaskState::Yielding;
                if counted {
                    task.update_next_times(runtime, yielded_at);
                } else {
                    task.last_finish_time = yielded_at;
                }
            }
        }
        self.load.last_finish_time = yielded_at;

        let run_once = timeout < Time::from_secs(MIN_YIELD_TIMEOUT_SECS);
        let give_up_at = yielded_at + timeout;

        self.yield_depth += 1;
        let met = loop {
            self.tick();
            if until() {
                break true;
            }
            if run_once || self.now() >= give_up_at {
                break false;
            }
        };
        self.yield_depth -= 1;

        if let Some((id, serial)) = yielding {
            let resumed_at = self.now();
            match self.scheduler.get_mut(id) {
                Ok(task) if task.serial == serial => {
                    // Keeps it from being picked again the moment it returns
                    task.last_call_time = resumed_at;
                    task.state = TaskState::Running;
                }
                _ => {}
            }
        }
        Ok(met)
    }

    /// Run the loop once on top of the current task
    pub fn yield_once(&mut self) -> Result<()> {
        self.yield_until(|| true, Time::ZERO).map(|_| ())
    }

    // -----------------------------------------------------------------
    // Current-task accessors
    // -----------------------------------------------------------------

    /// Task whose body is executing
    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    /// Keep this run out of the duration statistics
    pub fn ignore_for_stats(&mut self) {
        self.count_this_task = false;
    }

    /// Smoothed duration of the executing task
    pub fn average_run_time_for_current_task(&self) -> Result<Time> {
        let id = self.current.ok_or(SchedError::NoCurrentTask)?;
        Ok(self.scheduler.get(id)?.duration.average)
    }

    /// Move the executing task's hard deadline
    pub fn set_next_run_time_for_current_task(&mut self, max_interval: Time) -> Result<()> {
        let id = self.current.ok_or(SchedError::NoCurrentTask)?;
        self.scheduler.get_mut(id)?.schedule.max_interval = max_interval;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Clock & statistics
    // -----------------------------------------------------------------

    /// Seconds since scheduler start; starts the clock on first use
    pub fn now(&mut self) -> Time {
        self.clock.now()
    }

    /// Configure the hardware timer without entering the loop
    pub fn start_clock(&mut self) {
        self.clock.start();
    }

    /// Has the clock been started?
    pub fn is_running(&self) -> bool {
        self.clock.is_started()
    }

    /// Scheduler clock
    pub fn clock(&self) -> &Clock<T> {
        &self.clock
    }

    /// Hardware timer (simulated time in tests)
    pub fn timer_mut(&mut self) -> &mut T {
        self.clock.timer_mut()
    }

    /// Load counters since the last dump
    pub fn load(&self) -> &SchedulerLoad {
        &self.load
    }

    /// Current nesting of `yield_until`
    pub fn yield_depth(&self) -> usize {
        self.yield_depth
    }

    /// Per-task report lines for the current window
    pub fn task_reports(&self) -> impl Iterator<Item = TaskReport<'_>> {
        let cpu_time = self.load.cpu_time;
        let window = cpu_time + self.load.overhead;
        self.scheduler
            .iter()
            .map(move |(_, task)| TaskReport::new(task, cpu_time, window))
    }

    /// Log the statistics and start a new window
    pub fn print_stats(&mut self) {
        log::info!("Dumping task manager stats:");
        for report in self.task_reports() {
            log::info!("{}", report);
        }
        log::info!(
            "{}. Total running time: {}",
            self.load,
            self.load.last_finish_time
        );
        self.reset_stats();
    }

    /// Zero every task's counters and the load counters
    pub fn reset_stats(&mut self) {
        for task in self.scheduler.iter_mut() {
            task.reset_stats();
        }
        self.load.reset();
    }

    /// Memory footprint estimate
    pub fn memory_footprint(&self) -> usize {
        core::mem::size_of::<Self>()
    }
}

impl Kernel<SoftwareTimer> {
    /// Create kernel for testing (software timer, one tick per read)
    pub fn testing() -> Self {
        Self::new(SoftwareTimer::new())
    }
}

/// Result of a bounded [`Kernel::start`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// Scheduler time spent in the loop
    pub elapsed: Time,
    /// Task bodies run
    pub tasks_executed: u64,
    /// Iterations with nothing selectable
    pub idle_cycles: u64,
}
