//! Deferred task scheduling
//!
//! The stack never blocks: every wait is a task posted to the scheduler and
//! dispatched later through `D7aStack::run_task`. Tasks are identified by a
//! `TimerTask` tag instead of a callback, so cancellation does not depend on
//! function identity.
use std::collections::VecDeque;

use thiserror::Error;
use tracing::trace;

use crate::timing::{elapsed_since, Tick};

/// Every deferred task the network and transport layers post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTask {
    /// NP foreground scan window elapsed
    ForegroundScanExpired,
    /// NP should open a foreground scan after a background advertising period
    StartForegroundScanAfterAdvertising,
    /// TP response period (`Tc`) elapsed on the responder side
    ResponsePeriodExpired,
}

/// Why the scheduler refused a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The task is still pending; cancel it first
    #[error("task already pending")]
    AlreadyPending,
    /// No room for another pending task
    #[error("task queue full")]
    QueueFull,
}

/// Timer/task collaborator
pub trait Scheduler {
    /// Post `task` to run after `delay` ticks
    fn schedule(&mut self, task: TimerTask, delay: Tick) -> Result<(), ScheduleError>;

    /// Drop `task`, whether it is still counting down or already due but not
    /// yet dispatched. Cancelling a task that is not pending is a no-op.
    fn cancel(&mut self, task: TimerTask);

    /// Current tick count
    fn now(&self) -> Tick;

    fn is_pending(&self, task: TimerTask) -> bool;
}

/// Replace any pending instance of `task` with a fresh one after `delay`
///
/// A refusal after the cancel means the platform cannot hold the handful of
/// tasks the stack uses, which is a defect.
pub(crate) fn rearm(scheduler: &mut dyn Scheduler, task: TimerTask, delay: Tick) {
    scheduler.cancel(task);
    if let Err(err) = scheduler.schedule(task, delay) {
        panic!("scheduler refused {task:?} after cancel: {err}");
    }
}

/// Default number of tasks a `TickScheduler` holds
pub const DEFAULT_TASK_CAPACITY: usize = 8;

/// Virtual-time scheduler
///
/// Keeps a countdown list and a ready queue (due but not yet dispatched), the
/// two forms a task can be cancelled in. Time only moves through `advance`,
/// which makes it suitable for hosted simulation and tests.
#[derive(Debug)]
pub struct TickScheduler {
    now: Tick,
    capacity: usize,
    /// (task, tick it was posted at, delay)
    pending: Vec<(TimerTask, Tick, Tick)>,
    ready: VecDeque<TimerTask>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TASK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            now: 0,
            capacity,
            pending: Vec::with_capacity(capacity),
            ready: VecDeque::with_capacity(capacity),
        }
    }

    /// Start the clock at `now` instead of 0
    pub fn starting_at(now: Tick) -> Self {
        let mut scheduler = Self::new();
        scheduler.now = now;
        scheduler
    }

    /// Move the clock forward and queue every task that became due
    ///
    /// The clock wraps; a task is due once the ticks elapsed since it was
    /// posted reach its delay. Due tasks are queued in deadline order; ties
    /// keep posting order.
    pub fn advance(&mut self, ticks: Tick) {
        self.now = self.now.wrapping_add(ticks);
        let now = self.now;
        let mut due: Vec<(TimerTask, Tick)> = Vec::new();
        self.pending.retain(|&(task, posted_at, delay)| {
            let elapsed = elapsed_since(posted_at, now);
            if elapsed >= delay {
                due.push((task, elapsed - delay));
                false
            } else {
                true
            }
        });
        // most overdue first
        due.sort_by_key(|&(_, overdue)| std::cmp::Reverse(overdue));
        for (task, overdue) in due {
            trace!(?task, overdue, now, "task due");
            self.ready.push_back(task);
        }
    }

    /// Next due task, in dispatch order
    pub fn pop_ready(&mut self) -> Option<TimerTask> {
        self.ready.pop_front()
    }

    fn find(&self, task: TimerTask) -> Option<(Tick, Tick)> {
        self.pending
            .iter()
            .find(|(pending, _, _)| *pending == task)
            .map(|&(_, posted_at, delay)| (posted_at, delay))
    }

    /// Tick at which a task still counting down becomes due (wrapping)
    pub fn deadline(&self, task: TimerTask) -> Option<Tick> {
        self.find(task)
            .map(|(posted_at, delay)| posted_at.wrapping_add(delay))
    }

    /// Ticks left before `task` becomes due
    pub fn remaining(&self, task: TimerTask) -> Option<Tick> {
        self.find(task)
            .map(|(posted_at, delay)| delay.saturating_sub(elapsed_since(posted_at, self.now)))
    }

    /// Tasks counting down or due
    pub fn pending_count(&self) -> usize {
        self.pending.len() + self.ready.len()
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TickScheduler {
    fn schedule(&mut self, task: TimerTask, delay: Tick) -> Result<(), ScheduleError> {
        if self.is_pending(task) {
            return Err(ScheduleError::AlreadyPending);
        }
        if self.pending_count() >= self.capacity {
            return Err(ScheduleError::QueueFull);
        }
        trace!(?task, delay, now = self.now, "task scheduled");
        self.pending.push((task, self.now, delay));
        if delay == 0 {
            self.advance(0);
        }
        Ok(())
    }

    fn cancel(&mut self, task: TimerTask) {
        self.pending.retain(|(pending, _, _)| *pending != task);
        self.ready.retain(|ready| *ready != task);
    }

    fn now(&self) -> Tick {
        self.now
    }

    fn is_pending(&self, task: TimerTask) -> bool {
        self.pending.iter().any(|(pending, _, _)| *pending == task) || self.ready.contains(&task)
    }
}
