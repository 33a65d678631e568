//! Deferred execution of promise continuations.
//!
//! Promises never run continuations themselves; they hand them to a
//! [`Schedule`] implementation which must run them later, first in first out.
//! [`TaskQueue`] is a single-threaded implementation that the caller drives.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::{Error, QueueConfig};

/// A deferred zero-argument callback.
pub type Task = Box<dyn FnOnce()>;

/// Something that runs tasks later, in the order they were scheduled.
pub trait Schedule {
    /// Enqueue `task`. It must not run before this call returns.
    fn schedule(&self, task: Task);

    /// Called when a rejected promise is dropped without any handler having
    /// been attached to it.
    fn unhandled_rejection(&self) {
        log::warn!("promise rejected with no handler attached");
    }
}

/// Shared handle to a [`Schedule`] implementation, carried by every promise.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<dyn Schedule>,
}

impl Scheduler {
    pub fn new<S: Schedule + 'static>(schedule: S) -> Self {
        Self {
            inner: Rc::new(schedule),
        }
    }

    /// Enqueue `task` on the underlying scheduler.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.schedule(Box::new(task));
    }

    pub(crate) fn unhandled_rejection(&self) {
        self.inner.unhandled_rejection();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

struct Queue {
    tasks: RefCell<VecDeque<Task>>,
    config: QueueConfig,
    unhandled: Cell<usize>,
}

/// Single-threaded FIFO task queue.
///
/// Nothing runs until the owner calls [`turn`](TaskQueue::turn) or
/// [`run_until_stalled`](TaskQueue::run_until_stalled).
///
/// # Examples
///
/// ```
/// use promise_chain::TaskQueue;
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let queue = TaskQueue::new();
/// let scheduler = queue.scheduler();
/// let order = Rc::new(RefCell::new(Vec::new()));
/// for i in 0..3 {
///     let order = order.clone();
///     scheduler.schedule(move || order.borrow_mut().push(i));
/// }
/// assert!(order.borrow().is_empty());
/// assert_eq!(queue.run_until_stalled().unwrap(), 3);
/// assert_eq!(*order.borrow(), vec![0, 1, 2]);
/// ```
#[derive(Clone)]
pub struct TaskQueue {
    queue: Rc<Queue>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .field("config", &self.queue.config)
            .finish()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            queue: Rc::new(Queue {
                tasks: RefCell::new(VecDeque::new()),
                config,
                unhandled: Cell::new(0),
            }),
        }
    }

    /// A scheduler handle feeding this queue.
    ///
    /// The handle holds the queue weakly: once every `TaskQueue` clone is
    /// gone, newly scheduled tasks are dropped.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(QueueHandle {
            queue: Rc::downgrade(&self.queue),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.queue.config
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.tasks.borrow().is_empty()
    }

    /// Number of rejected promises dropped without a handler so far.
    pub fn unhandled_rejections(&self) -> usize {
        self.queue.unhandled.get()
    }

    /// Run the oldest queued task. Returns `false` if the queue was empty.
    pub fn turn(&self) -> bool {
        // The borrow must end before the task runs; tasks schedule more tasks.
        let task = self.queue.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks, including the ones they schedule, until the queue is empty.
    ///
    /// Returns the number of tasks run, or [`Error::TurnBudgetExhausted`] if
    /// the queue still has work after `max_turns` tasks.
    pub fn run_until_stalled(&self) -> Result<usize, Error> {
        let mut turns = 0;
        while !self.is_empty() {
            if let Some(limit) = self.queue.config.max_turns {
                if turns >= limit {
                    log::debug!("task queue budget of {} turns exhausted", limit);
                    return Err(Error::TurnBudgetExhausted { limit });
                }
            }
            self.turn();
            turns += 1;
        }
        log::debug!("task queue stalled after {} turns", turns);
        Ok(turns)
    }
}

struct QueueHandle {
    queue: Weak<Queue>,
}

impl Schedule for QueueHandle {
    fn schedule(&self, task: Task) {
        match self.queue.upgrade() {
            Some(queue) => {
                queue.tasks.borrow_mut().push_back(task);
                log::trace!("scheduled task, {} queued", queue.tasks.borrow().len());
            }
            None => log::debug!("task queue dropped, discarding task"),
        }
    }

    fn unhandled_rejection(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.unhandled.set(queue.unhandled.get() + 1);
            if queue.config.report_unhandled_rejections {
                log::warn!("promise rejected with no handler attached");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Schedule, Scheduler, Task, TaskQueue};
    use crate::{Error, QueueConfig};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            scheduler.schedule(move || order.borrow_mut().push(i));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.run_until_stalled(), Ok(5));
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tasks_scheduled_while_running_go_last() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            let scheduler_inner = scheduler.clone();
            scheduler.schedule(move || {
                order.borrow_mut().push("outer");
                let order = order.clone();
                scheduler_inner.schedule(move || order.borrow_mut().push("nested"));
            });
        }
        {
            let order = order.clone();
            scheduler.schedule(move || order.borrow_mut().push("sibling"));
        }
        assert_eq!(queue.run_until_stalled(), Ok(3));
        assert_eq!(*order.borrow(), vec!["outer", "sibling", "nested"]);
    }

    #[test]
    fn test_turn_runs_one_task() {
        let queue = TaskQueue::new();
        let ran = Rc::new(Cell::new(0));
        for _ in 0..2 {
            let ran = ran.clone();
            queue.scheduler().schedule(move || ran.set(ran.get() + 1));
        }
        assert!(queue.turn());
        assert_eq!(ran.get(), 1);
        assert!(queue.turn());
        assert!(!queue.turn());
        assert_eq!(ran.get(), 2);
    }

    #[test]
    fn test_turn_budget() {
        let queue = TaskQueue::with_config(QueueConfig::default().max_turns(3));
        let scheduler = queue.scheduler();
        fn forever(scheduler: Scheduler) {
            let next = scheduler.clone();
            scheduler.schedule(move || forever(next));
        }
        forever(scheduler);
        assert_eq!(
            queue.run_until_stalled(),
            Err(Error::TurnBudgetExhausted { limit: 3 })
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_scheduling_after_queue_dropped_discards() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        drop(queue);
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        scheduler.schedule(move || flag.set(true));
        assert!(!ran.get());
        assert_eq!(Rc::strong_count(&ran), 1);
    }

    #[test]
    fn test_custom_schedule_implementation() {
        struct Stack(Rc<RefCell<Vec<Task>>>);
        impl Schedule for Stack {
            fn schedule(&self, task: Task) {
                self.0.borrow_mut().push(task);
            }
        }
        let tasks = Rc::new(RefCell::new(Vec::new()));
        let scheduler = Scheduler::new(Stack(tasks.clone()));
        let hit = Rc::new(Cell::new(false));
        let flag = hit.clone();
        scheduler.schedule(move || flag.set(true));
        let task = tasks.borrow_mut().pop().unwrap();
        task();
        assert!(hit.get());
    }
}
