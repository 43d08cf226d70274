//! Task table and best-task selection
//!
//! Fixed table of [`MAX_TASKS`] descriptors plus a priority-sorted view of
//! the runnable ones. The view is rebuilt on every membership change; with
//! at most 25 entries the sort is cheap.
//!
//! Selection runs in three passes over the view:
//!
//! 1. Hard deadlines, highest precedence first. The first overdue task that
//!    is ready wins outright.
//! 2. Best effort, lowest precedence first. A task is considered once its
//!    ideal call time has passed, or when its latest call time falls before
//!    the current candidate would finish. A higher-precedence claim found
//!    later overwrites an earlier one. A claiming task still in backoff only
//!    drops the candidate if the candidate would run past its latest call
//!    time; the bound then moves in to that time.
//! 3. Slack fill, lowest precedence first, when pass 2 found nothing: any
//!    ready task that finishes before the bound (and the caller deadline),
//!    preferring ones past their target interval.
//!
//! Author: Moroya Sakamoto

use heapless::Vec;

use crate::config::MAX_TASKS;
use crate::error::{Result, SchedError};
use crate::task::{Resources, Task, TaskId, TaskPriority, TaskState};
use crate::timer::{HardwareTimer, Time};

/// Entry in the priority-sorted view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortedEntry {
    pub priority: TaskPriority,
    pub id: TaskId,
}

/// Why a task was selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Past its hard deadline
    Overdue,
    /// Target interval reached
    Due,
    /// Filling idle time before the next due task
    Slack,
}

/// Outcome of [`Scheduler::choose_best_task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub id: TaskId,
    pub pick: Pick,
}

/// Task table with priority-sorted view
///
/// Static table, no dynamic allocation.
pub struct Scheduler<T: HardwareTimer> {
    /// Static task table; free slots have no body
    tasks: [Task<T>; MAX_TASKS],
    /// Runnable slots, lowest precedence (highest number) first
    sorted: Vec<SortedEntry, MAX_TASKS>,
    /// Occupied slots
    registered: usize,
    /// Incremented on every registration
    next_serial: u32,
}

impl<T: HardwareTimer> Scheduler<T> {
    /// Create empty table
    pub fn new() -> Self {
        Self {
            tasks: core::array::from_fn(|_| Task::empty()),
            sorted: Vec::new(),
            registered: 0,
            next_serial: 1,
        }
    }

    /// Insert into the first free slot and rebuild the view
    pub fn register(&mut self, mut task: Task<T>) -> Result<TaskId> {
        let Some(index) = (0..MAX_TASKS).find(|&i| !self.tasks[i].is_occupied()) else {
            log::warn!("task table full, rejecting '{}'", task.name());
            return Err(SchedError::TableFull);
        };
        task.serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        self.tasks[index] = task;
        self.registered += 1;
        self.rebuild_sorted_view();
        Ok(TaskId::new(index))
    }

    /// Clear a slot and rebuild the view
    pub fn remove(&mut self, id: TaskId) -> Result<()> {
        self.get(id)?;
        log::debug!("removing task {} '{}'", id.index(), self.tasks[id.index()].name());
        self.tasks[id.index()] = Task::empty();
        self.registered -= 1;
        self.rebuild_sorted_view();
        Ok(())
    }

    /// Re-derive the sorted view from the table
    pub fn rebuild_sorted_view(&mut self) {
        self.sorted.clear();
        for (index, task) in self.tasks.iter().enumerate() {
            if task.is_runnable() {
                // Capacity equals the table size, so this cannot overflow
                let _ = self.sorted.push(SortedEntry {
                    priority: task.priority(),
                    id: TaskId::new(index),
                });
            }
        }
        self.sorted
            .sort_unstable_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    }

    /// Runnable tasks, lowest precedence first
    pub fn sorted_view(&self) -> &[SortedEntry] {
        &self.sorted
    }

    /// Descriptor of an occupied slot
    pub fn get(&self, id: TaskId) -> Result<&Task<T>> {
        match self.tasks.get(id.index()) {
            Some(task) if task.is_occupied() => Ok(task),
            _ => Err(SchedError::UnknownTask(id)),
        }
    }

    /// Mutable descriptor of an occupied slot
    pub fn get_mut(&mut self, id: TaskId) -> Result<&mut Task<T>> {
        match self.tasks.get_mut(id.index()) {
            Some(task) if task.is_occupied() => Ok(task),
            _ => Err(SchedError::UnknownTask(id)),
        }
    }

    /// Occupied slots with their ids
    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &Task<T>)> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_occupied())
            .map(|(i, t)| (TaskId::new(i), t))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task<T>> {
        self.tasks.iter_mut().filter(|t| t.is_occupied())
    }

    /// Number of occupied slots
    pub fn registered_count(&self) -> usize {
        self.registered
    }

    /// Number of tasks in the sorted view
    pub fn runnable_count(&self) -> usize {
        self.sorted.len()
    }

    /// Is every slot taken?
    pub fn is_full(&self) -> bool {
        self.registered >= MAX_TASKS
    }

    /// Highest-precedence runnable task
    pub fn highest_priority_task(&self) -> Option<TaskId> {
        self.sorted.last().map(|e| e.id)
    }

    /// Poll every conditional task once; rebuild the view if any fired
    pub fn check_conditional_tasks(&mut self) -> bool {
        let mut added = false;
        for task in self.tasks.iter_mut() {
            if task.check_condition() {
                log::debug!("conditional task '{}' is now runnable", task.name());
                added = true;
            }
        }
        if added {
            self.rebuild_sorted_view();
        }
        added
    }

    /// Permanently shorten a task's backoff and target interval
    pub fn boost(&mut self, id: TaskId) -> Result<()> {
        self.get_mut(id)?.boost();
        Ok(())
    }

    /// Declare the shared resources a task uses
    pub fn set_resources(&mut self, id: TaskId, resources: Resources) -> Result<()> {
        self.get_mut(id)?.resources = resources;
        Ok(())
    }

    /// Pick the next task to run at `now`
    ///
    /// `deadline` is the time the caller must have control back by, if any.
    /// `held` are the resources owned by tasks currently on the stack.
    pub fn choose_best_task(&self, now: Time, deadline: Option<Time>, held: Resources) -> Option<Selection> {
        for entry in self.sorted.iter().rev() {
            let task = &self.tasks[entry.id.index()];
            if task.is_overdue(now) && task.is_ready(now, held) {
                return Some(Selection { id: entry.id, pick: Pick::Overdue });
            }
        }

        // Predicted finish of the current candidate; starts at now
        let mut next_finish = now;
        // Latest start of a waiting task the fallback must not run past
        let mut held_back: Option<Time> = None;
        let mut best: Option<TaskId> = None;
        let mut best_priority: Option<TaskPriority> = None;

        for entry in self.sorted.iter() {
            let task = &self.tasks[entry.id.index()];
            let average = task.duration.average;
            let latest = task.latest_call_time();
            if task.ideal_call_time() >= now && latest >= next_finish {
                continue;
            }
            if deadline.is_some_and(|d| now + average >= d) {
                continue;
            }
            if best_priority.is_some_and(|p| task.priority() >= p) {
                continue;
            }
            if task.is_ready(now, held) {
                best = Some(entry.id);
                next_finish = now + average;
            } else if task.state == TaskState::Idle
                && !held.intersects(task.resources)
                && now - task.last_finish_time <= task.schedule.backoff
            {
                if next_finish > latest {
                    // The candidate would still be running when this one must start
                    best = None;
                    next_finish = latest;
                    held_back = Some(latest);
                }
            } else {
                continue;
            }
            best_priority = Some(task.priority());
        }

        if let Some(id) = best {
            return Some(Selection { id, pick: Pick::Due });
        }

        let bound = held_back
            .unwrap_or(Time::MAX)
            .min(deadline.unwrap_or(Time::MAX));
        let fits = |task: &Task<T>| task.is_ready(now, held) && now + task.duration.average < bound;
        self.sorted
            .iter()
            .find(|e| {
                let task = &self.tasks[e.id.index()];
                fits(task) && now - task.last_finish_time > task.schedule.target_interval
            })
            .or_else(|| self.sorted.iter().find(|e| fits(&self.tasks[e.id.index()])))
            .map(|e| Selection { id: e.id, pick: Pick::Slack })
    }
}

impl<T: HardwareTimer> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::task::TaskSchedule;
    use crate::timer::SoftwareTimer;
    use core::sync::atomic::{AtomicBool, Ordering};

    type Sched = Scheduler<SoftwareTimer>;

    fn dummy_task(_: &mut Kernel<SoftwareTimer>) {}

    fn ms(v: i64) -> Time {
        Time::from_millis(v)
    }

    fn schedule(priority: u8, backoff: i64, target: i64, max: i64) -> TaskSchedule {
        TaskSchedule::new(TaskPriority(priority), ms(backoff), ms(target), ms(max))
    }

    fn add(sched: &mut Sched, priority: u8, backoff: i64, target: i64, max: i64) -> TaskId {
        sched
            .register(Task::repeating(dummy_task, schedule(priority, backoff, target, max), "t"))
            .unwrap()
    }

    fn assert_view_consistent(sched: &Sched) {
        let view = sched.sorted_view();
        for (id, task) in sched.iter() {
            let n = view.iter().filter(|e| e.id == id).count();
            assert_eq!(n, task.is_runnable() as usize);
        }
        for e in view {
            assert!(sched.get(e.id).unwrap().is_runnable());
        }
        for pair in view.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
        }
    }

    #[test]
    fn test_scheduler_empty() {
        let sched = Sched::new();
        assert_eq!(sched.registered_count(), 0);
        assert_eq!(sched.choose_best_task(ms(100), None, Resources::empty()), None);
    }

    #[test]
    fn test_register_uses_first_free_slot() {
        let mut sched = Sched::new();
        let a = add(&mut sched, 0, 0, 1, 2);
        let b = add(&mut sched, 1, 0, 1, 2);
        let c = add(&mut sched, 2, 0, 1, 2);
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        sched.remove(b).unwrap();
        let d = add(&mut sched, 3, 0, 1, 2);
        assert_eq!(d, b);
        assert_eq!(sched.registered_count(), 3);
        assert_view_consistent(&sched);
    }

    #[test]
    fn test_sorted_view_order() {
        let mut sched = Sched::new();
        add(&mut sched, 3, 0, 1, 2);
        add(&mut sched, 0, 0, 1, 2);
        add(&mut sched, 7, 0, 1, 2);
        let prios: std::vec::Vec<u8> = sched.sorted_view().iter().map(|e| e.priority.0).collect();
        assert_eq!(prios, [7, 3, 0]);
        assert_eq!(sched.highest_priority_task(), Some(TaskId::new(1)));
        assert_view_consistent(&sched);
    }

    #[test]
    fn test_table_full() {
        let mut sched = Sched::new();
        for i in 0..MAX_TASKS {
            add(&mut sched, i as u8, 0, 1, 2);
        }
        assert!(sched.is_full());
        let rejected = sched.register(Task::repeating(dummy_task, schedule(0, 0, 1, 2), "extra"));
        assert_eq!(rejected, Err(SchedError::TableFull));
        assert_eq!(sched.registered_count(), MAX_TASKS);
        assert_eq!(sched.runnable_count(), MAX_TASKS);
        assert_view_consistent(&sched);
    }

    #[test]
    fn test_remove_unknown() {
        let mut sched = Sched::new();
        let id = add(&mut sched, 0, 0, 1, 2);
        sched.remove(id).unwrap();
        assert_eq!(sched.remove(id), Err(SchedError::UnknownTask(id)));
        let out_of_range = TaskId::new(MAX_TASKS + 3);
        assert_eq!(sched.remove(out_of_range), Err(SchedError::UnknownTask(out_of_range)));
        assert_eq!(sched.registered_count(), 0);
    }

    #[test]
    fn test_sooner_target_wins() {
        let mut sched = Sched::new();
        let _a = add(&mut sched, 0, 0, 10, 20);
        let b = add(&mut sched, 1, 0, 1, 2);
        let pick = sched.choose_best_task(ms(3) / 2, None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id: b, pick: Pick::Due });
    }

    #[test]
    fn test_priority_wins_among_due() {
        let mut sched = Sched::new();
        let b = add(&mut sched, 5, 0, 1, 100);
        let a = add(&mut sched, 0, 0, 1, 100);
        let pick = sched.choose_best_task(ms(5), None, Resources::empty()).unwrap();
        assert_eq!(pick.id, a);
        assert_ne!(pick.id, b);
    }

    #[test]
    fn test_overdue_beats_priority() {
        let mut sched = Sched::new();
        let _high = add(&mut sched, 0, 0, 50, 200);
        let low = add(&mut sched, 9, 0, 50, 100);
        let pick = sched.choose_best_task(ms(101), None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id: low, pick: Pick::Overdue });
    }

    #[test]
    fn test_overdue_ties_go_to_precedence() {
        let mut sched = Sched::new();
        let low = add(&mut sched, 9, 0, 1, 2);
        let high = add(&mut sched, 1, 0, 1, 2);
        let pick = sched.choose_best_task(ms(10), None, Resources::empty()).unwrap();
        assert_eq!(pick.id, high);
        assert_ne!(pick.id, low);
    }

    #[test]
    fn test_backoff_never_selected() {
        let mut sched = Sched::new();
        let id = add(&mut sched, 0, 5, 5, 10);
        {
            let t = sched.get_mut(id).unwrap();
            t.last_call_time = ms(20);
            t.last_finish_time = ms(40);
        }
        // Past the hard deadline, but backoff still holds
        for now in [41, 43, 45] {
            assert_eq!(sched.choose_best_task(ms(now), None, Resources::empty()), None);
        }
        let pick = sched.choose_best_task(ms(46), None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id, pick: Pick::Overdue });
    }

    #[test]
    fn test_waiting_high_priority_pulls_bound_in() {
        let mut sched = Sched::new();
        // Long low-priority job: would run past the audio task's latest start
        let slow = add(&mut sched, 5, 0, 1, 1000);
        sched.get_mut(slow).unwrap().duration.average = ms(8);
        let quick = add(&mut sched, 6, 0, 1, 1000);
        sched.get_mut(quick).unwrap().duration.average = ms(1);
        let audio = add(&mut sched, 0, 4, 4, 15);
        {
            let t = sched.get_mut(audio).unwrap();
            t.last_call_time = ms(0);
            t.last_finish_time = ms(8);
        }
        // At 10ms audio is due but in backoff until 12ms, latest start 15ms
        let pick = sched.choose_best_task(ms(10), None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id: quick, pick: Pick::Slack });
    }

    #[test]
    fn test_waiting_task_with_room_keeps_candidate() {
        let mut sched = Sched::new();
        let c1 = add(&mut sched, 5, 0, 1, 1000);
        let c2 = add(&mut sched, 3, 0, 1, 1000);
        for id in [c1, c2] {
            sched.get_mut(id).unwrap().duration.average = ms(1);
        }
        let waiting = add(&mut sched, 0, 5, 5, 1000);
        sched.get_mut(waiting).unwrap().last_finish_time = ms(8);
        // Due but in backoff, latest start far after c2 would finish
        let pick = sched.choose_best_task(ms(10), None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id: c2, pick: Pick::Due });
    }

    #[test]
    fn test_latest_call_time_admits_higher_precedence() {
        let mut sched = Sched::new();
        let long = add(&mut sched, 5, 0, 1, 1000);
        sched.get_mut(long).unwrap().duration.average = ms(50);
        let audio = add(&mut sched, 0, 0, 40, 60);
        sched.get_mut(audio).unwrap().duration.average = ms(1);
        // Audio is not due until 39ms, but long would end at 80ms, past audio's 59ms
        let pick = sched.choose_best_task(ms(30), None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id: audio, pick: Pick::Due });
    }

    #[test]
    fn test_long_job_held_back_for_waiting_deadline() {
        let mut sched = Sched::new();
        let long = add(&mut sched, 5, 0, 1, 1000);
        sched.get_mut(long).unwrap().duration.average = ms(50);
        let audio = add(&mut sched, 0, 35, 40, 60);
        sched.get_mut(audio).unwrap().duration.average = ms(1);
        // Audio in backoff until 35ms, must start by 59ms: long cannot fit
        assert_eq!(sched.choose_best_task(ms(30), None, Resources::empty()), None);

        let quick = add(&mut sched, 6, 0, 1, 1000);
        sched.get_mut(quick).unwrap().duration.average = ms(1);
        let pick = sched.choose_best_task(ms(30), None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id: quick, pick: Pick::Slack });
    }

    #[test]
    fn test_wide_index_does_not_alias() {
        let mut sched = Sched::new();
        let id = add(&mut sched, 0, 0, 1, 2);
        assert_eq!(id, TaskId::new(0));
        for index in [256, 512, usize::MAX] {
            let wide = TaskId::new(index);
            assert_eq!(sched.remove(wide), Err(SchedError::UnknownTask(wide)));
            assert!(sched.get(wide).is_err());
        }
        assert_eq!(sched.registered_count(), 1);
        assert!(sched.get(id).is_ok());
    }

    #[test]
    fn test_caller_deadline_bounds_candidates() {
        let mut sched = Sched::new();
        let id = add(&mut sched, 0, 0, 1, 1000);
        sched.get_mut(id).unwrap().duration.average = ms(5);
        assert_eq!(sched.choose_best_task(ms(10), Some(ms(12)), Resources::empty()), None);
        assert_eq!(
            sched.choose_best_task(ms(10), Some(ms(20)), Resources::empty()).map(|s| s.id),
            Some(id)
        );
    }

    #[test]
    fn test_slack_prefers_low_precedence() {
        let mut sched = Sched::new();
        let high = add(&mut sched, 1, 0, 50, 100);
        let low = add(&mut sched, 8, 0, 50, 100);
        for id in [high, low] {
            let t = sched.get_mut(id).unwrap();
            t.last_call_time = ms(10);
            t.last_finish_time = ms(10);
        }
        // Nothing due: slack fill walks from the lowest precedence up
        let pick = sched.choose_best_task(ms(20), None, Resources::empty()).unwrap();
        assert_eq!(pick, Selection { id: low, pick: Pick::Slack });
    }

    #[test]
    fn test_resources_held_by_stack() {
        let mut sched = Sched::new();
        let card = add(&mut sched, 0, 0, 1, 2);
        sched.set_resources(card, Resources::SD).unwrap();
        assert_eq!(sched.choose_best_task(ms(10), None, Resources::SD), None);
        assert_eq!(
            sched.choose_best_task(ms(10), None, Resources::USB).map(|s| s.id),
            Some(card)
        );
    }

    #[test]
    fn test_yielding_task_not_selected() {
        let mut sched = Sched::new();
        let id = add(&mut sched, 0, 0, 1, 2);
        sched.get_mut(id).unwrap().state = TaskState::Yielding;
        assert_eq!(sched.choose_best_task(ms(10), None, Resources::empty()), None);
    }

    static COND_READY: AtomicBool = AtomicBool::new(false);

    fn cond_ready() -> bool {
        COND_READY.load(Ordering::Relaxed)
    }

    #[test]
    fn test_conditional_task_joins_view() {
        let mut sched = Sched::new();
        let id = sched
            .register(Task::conditional(dummy_task, TaskPriority::LOW, cond_ready, "startup song"))
            .unwrap();
        assert_eq!(sched.runnable_count(), 0);
        assert!(!sched.check_conditional_tasks());
        assert_eq!(sched.choose_best_task(ms(10), None, Resources::empty()), None);

        COND_READY.store(true, Ordering::Relaxed);
        assert!(sched.check_conditional_tasks());
        assert_eq!(sched.sorted_view(), &[SortedEntry { priority: TaskPriority::LOW, id }]);
        assert_view_consistent(&sched);
        assert_eq!(
            sched.choose_best_task(ms(10), None, Resources::empty()).map(|s| s.id),
            Some(id)
        );
    }

    #[test]
    fn test_boost_unknown_task() {
        let mut sched = Sched::new();
        let id = TaskId::new(4);
        assert_eq!(sched.boost(id), Err(SchedError::UnknownTask(id)));
    }
}
