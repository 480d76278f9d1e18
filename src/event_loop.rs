//! Deferred execution on the VM's owner thread.
//!
//! Requests coming from threads other than the owner must not touch VM state
//! directly. They are posted as one-shot tasks and run later, in submission
//! order, by whichever loop drives the owner thread.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;

use spin::Mutex;

/// Error types for scheduling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// The queue already holds its maximum number of tasks.
    QueueFull(usize),
    /// The queue has been closed; no further tasks are accepted.
    Closed,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull(cap) => write!(f, "Deferred task queue full ({} pending)", cap),
            Self::Closed => write!(f, "Deferred task queue closed"),
        }
    }
}

impl core::error::Error for ScheduleError {}

/// A labelled one-shot task.
///
/// Whatever the closure captures is released when the task runs, or when it
/// is dropped without running.
pub struct DeferredTask {
    label: &'static str,
    run: Box<dyn FnOnce() + Send>,
}

impl DeferredTask {
    /// Wrap `run` under `label`.
    pub fn new<F>(label: &'static str, run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            label,
            run: Box::new(run),
        }
    }

    /// Task label, for diagnostics.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Consume and run the task.
    pub fn run(self) {
        (self.run)()
    }
}

impl fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Posts tasks to the owner thread.
pub trait OwnerScheduler: Send + Sync {
    /// Queue `task` to run later on the owner thread, after every task
    /// scheduled before it.
    fn schedule(&self, task: DeferredTask) -> Result<(), ScheduleError>;
}

struct QueueInner {
    tasks: VecDeque<DeferredTask>,
    closed: bool,
}

/// FIFO of deferred tasks drained by the owner thread.
///
/// Any thread may [`schedule`](OwnerScheduler::schedule); only the owner
/// thread should call [`run_pending`](TaskQueue::run_pending).
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    capacity: Option<usize>,
}

impl TaskQueue {
    /// Create an unbounded queue.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            capacity: None,
        }
    }

    /// Create a queue refusing tasks beyond `capacity` pending ones.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            capacity: Some(capacity),
        }
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Whether the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Run one pending task. Returns `false` if the queue was empty.
    ///
    /// The lock is released before the task runs, so a task may schedule
    /// further work.
    pub fn run_one(&self) -> bool {
        let task = self.inner.lock().tasks.pop_front();
        match task {
            Some(task) => {
                log::trace!("event_loop: running deferred task '{}'", task.label());
                task.run();
                true
            }
            None => false,
        }
    }

    /// Run every task pending at call time, plus any they schedule.
    ///
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while self.run_one() {
            count += 1;
        }
        count
    }

    /// Refuse new tasks and drop the pending ones without running them.
    ///
    /// Returns the number of tasks dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            core::mem::take(&mut inner.tasks)
        };
        let count = dropped.len();
        if count > 0 {
            log::warn!("event_loop: dropping {} deferred task(s) on close", count);
        }
        // Captured state is released here, outside the lock.
        drop(dropped);
        count
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerScheduler for TaskQueue {
    fn schedule(&self, task: DeferredTask) -> Result<(), ScheduleError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ScheduleError::Closed);
        }
        if let Some(cap) = self.capacity
            && inner.tasks.len() >= cap
        {
            return Err(ScheduleError::QueueFull(cap));
        }
        log::trace!("event_loop: scheduled '{}'", task.label());
        inner.tasks.push_back(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    #[test]
    fn test_tasks_run_in_order() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let seen = seen.clone();
            queue
                .schedule(DeferredTask::new("push", move || seen.lock().push(i)))
                .unwrap();
        }

        assert_eq!(queue.pending(), 4);
        assert_eq!(queue.run_pending(), 4);
        assert_eq!(*seen.lock(), [0, 1, 2, 3]);
        assert!(!queue.run_one());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let queue = TaskQueue::with_capacity(1);
        queue.schedule(DeferredTask::new("a", || {})).unwrap();
        assert_eq!(
            queue.schedule(DeferredTask::new("b", || {})).unwrap_err(),
            ScheduleError::QueueFull(1)
        );
    }

    #[test]
    fn test_close_drops_without_running() {
        let queue = TaskQueue::new();
        let token = Arc::new(());
        let held = token.clone();
        queue
            .schedule(DeferredTask::new("never", move || {
                let _ = &held;
                panic!("closed task ran");
            }))
            .unwrap();

        assert_eq!(Arc::strong_count(&token), 2);
        assert_eq!(queue.close(), 1);
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(
            queue.schedule(DeferredTask::new("late", || {})).unwrap_err(),
            ScheduleError::Closed
        );
    }
}
